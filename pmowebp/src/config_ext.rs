//! Extension pour lire les réglages de la passerelle dans pmoconfig
//!
//! Ce module fournit le trait `WebpConfigExt` qui ajoute à
//! `pmoconfig::Config` les accès aux sections `images`, `proxy`, `lazy`
//! et `prefetch`, ainsi qu'une fabrique de [`ImageGateway`].

use anyhow::Result;
use pmoconfig::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;
use crate::gateway::{GatewaySettings, ImageGateway, MetadataBackend, Origin, ProxySettings};
use crate::inflight::DEFAULT_INFLIGHT_TTL;
use crate::pipeline::{PipelineSettings, num_cpus};

const DEFAULT_IMAGES_PATH: &str = "./pics";
const DEFAULT_EXHAUST_DIR: &str = "./exhaust";
const DEFAULT_REMOTE_RAW_DIR: &str = "./remote-raw";
const DEFAULT_ALLOWED_TYPES: [&str; 4] = ["jpg", "png", "jpeg", "bmp"];
const DEFAULT_QUALITY: usize = 80;
const DEFAULT_PROXY_TIMEOUT_SECS: usize = 30;
const DEFAULT_TICK_MS: usize = 1000;
const DEFAULT_QUEUE_CAPACITY: usize = 1000;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: usize = 15;

/// Une valeur nulle signifie « un par CPU »
fn jobs_or_cpus(jobs: usize) -> usize {
    if jobs == 0 { num_cpus() } else { jobs }
}

/// Trait d'extension pour configurer la passerelle depuis pmoconfig
///
/// # Exemple
///
/// ```rust,ignore
/// use pmoconfig::get_config;
/// use pmowebp::{ImageCodec, WebpConfigExt};
/// use std::sync::Arc;
///
/// let config = get_config();
/// let gateway = config.create_webp_gateway(Arc::new(ImageCodec))?;
/// ```
pub trait WebpConfigExt {
    /// Valeur brute de `images.path` : un répertoire ou une URL http(s)
    fn get_images_path(&self) -> String;

    /// Répertoire des images dérivées, créé si besoin (default: "./exhaust")
    fn get_exhaust_dir(&self) -> Result<String>;

    /// Répertoire des copies de l'origine en mode proxy (default: "./remote-raw")
    fn get_remote_raw_dir(&self) -> Result<String>;

    fn get_allowed_types(&self) -> Vec<String>;

    /// Qualité d'encodage, bornée à 100
    fn get_quality(&self) -> u8;

    fn get_enable_avif(&self) -> bool;

    fn get_enable_extra_params(&self) -> bool;

    /// Table nom d'hôte → URL d'origine
    fn get_host_map(&self) -> std::collections::HashMap<String, String>;

    fn get_proxy_timeout(&self) -> Duration;

    /// Backend des métadonnées de fraîcheur (`file` ou `db`)
    fn get_metadata_backend(&self) -> Result<MetadataBackend>;

    fn get_lazy_enabled(&self) -> bool;

    fn get_prefetch_enabled(&self) -> bool;

    /// Nombre d'images préchargées simultanément
    fn get_prefetch_jobs(&self) -> usize;

    /// Construit les réglages de la passerelle
    ///
    /// Une valeur `images.path` commençant par `http://` ou `https://`
    /// active le mode proxy ; sinon le chemin est résolu relativement au
    /// répertoire de configuration.
    fn gateway_settings(&self) -> Result<GatewaySettings>;

    /// Réglages du pipeline différé, `None` si `lazy.enabled` est faux
    fn pipeline_settings(&self) -> Option<PipelineSettings>;

    /// Crée une passerelle prête à l'emploi
    ///
    /// Doit être appelée dans un runtime tokio lorsque le mode différé est
    /// actif.
    fn create_webp_gateway(&self, codec: Arc<dyn Codec>) -> Result<ImageGateway>;
}

impl WebpConfigExt for Config {
    fn get_images_path(&self) -> String {
        self.get_string(&["images", "path"], DEFAULT_IMAGES_PATH)
    }

    fn get_exhaust_dir(&self) -> Result<String> {
        self.get_managed_dir(&["images", "exhaust_path"], DEFAULT_EXHAUST_DIR)
    }

    fn get_remote_raw_dir(&self) -> Result<String> {
        self.get_managed_dir(&["images", "remote_raw_path"], DEFAULT_REMOTE_RAW_DIR)
    }

    fn get_allowed_types(&self) -> Vec<String> {
        self.get_string_list(&["images", "allowed_types"], &DEFAULT_ALLOWED_TYPES)
    }

    fn get_quality(&self) -> u8 {
        self.get_usize(&["images", "quality"], DEFAULT_QUALITY).min(100) as u8
    }

    fn get_enable_avif(&self) -> bool {
        self.get_bool(&["images", "enable_avif"], false)
    }

    fn get_enable_extra_params(&self) -> bool {
        self.get_bool(&["images", "enable_extra_params"], false)
    }

    fn get_host_map(&self) -> std::collections::HashMap<String, String> {
        self.get_string_map(&["proxy", "host_map"], "backend_url")
    }

    fn get_proxy_timeout(&self) -> Duration {
        let secs = self.get_usize(&["proxy", "timeout_secs"], DEFAULT_PROXY_TIMEOUT_SECS);
        Duration::from_secs(secs as u64)
    }

    fn get_metadata_backend(&self) -> Result<MetadataBackend> {
        self.get_string(&["proxy", "metadata_backend"], "file").parse()
    }

    fn get_lazy_enabled(&self) -> bool {
        self.get_bool(&["lazy", "enabled"], false)
    }

    fn get_prefetch_enabled(&self) -> bool {
        self.get_bool(&["prefetch", "enabled"], false)
    }

    fn get_prefetch_jobs(&self) -> usize {
        jobs_or_cpus(self.get_usize(&["prefetch", "jobs"], 0))
    }

    fn gateway_settings(&self) -> Result<GatewaySettings> {
        let images = self.get_images_path();
        let lowered = images.to_ascii_lowercase();

        let origin = if lowered.starts_with("http://") || lowered.starts_with("https://") {
            Origin::Proxy(ProxySettings {
                backend_url: images.trim_end_matches('/').to_string(),
                host_map: self.get_host_map(),
                remote_raw: PathBuf::from(self.get_remote_raw_dir()?),
                timeout: self.get_proxy_timeout(),
                metadata_backend: self.get_metadata_backend()?,
            })
        } else {
            Origin::Local(self.resolve_path(&images))
        };

        Ok(GatewaySettings {
            origin,
            exhaust_path: PathBuf::from(self.get_exhaust_dir()?),
            allowed_types: self.get_allowed_types(),
            quality: self.get_quality(),
            enable_avif: self.get_enable_avif(),
            enable_extra_params: self.get_enable_extra_params(),
        })
    }

    fn pipeline_settings(&self) -> Option<PipelineSettings> {
        if !self.get_lazy_enabled() {
            return None;
        }
        let tick_ms = self.get_usize(&["lazy", "tick_ms"], DEFAULT_TICK_MS).max(1);
        let shutdown_secs = self.get_usize(
            &["lazy", "shutdown_timeout_secs"],
            DEFAULT_SHUTDOWN_TIMEOUT_SECS,
        );
        Some(PipelineSettings {
            tick: Duration::from_millis(tick_ms as u64),
            default_jobs: jobs_or_cpus(self.get_usize(&["lazy", "default_jobs"], 0)),
            heavy_jobs: jobs_or_cpus(self.get_usize(&["lazy", "heavy_jobs"], 0)),
            queue_capacity: self.get_usize(&["lazy", "queue_capacity"], DEFAULT_QUEUE_CAPACITY),
            shutdown_timeout: Duration::from_secs(shutdown_secs as u64),
            inflight_ttl: DEFAULT_INFLIGHT_TTL,
        })
    }

    fn create_webp_gateway(&self, codec: Arc<dyn Codec>) -> Result<ImageGateway> {
        ImageGateway::new(self.gateway_settings()?, codec, self.pipeline_settings())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn load(yaml: &str) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yaml"), yaml).unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        (dir, config)
    }

    #[test]
    fn test_local_settings_resolve_against_config_dir() {
        let (dir, config) = load("images:\n  path: pics\n  quality: 250\n  enable_avif: true\n");
        let settings = config.gateway_settings().unwrap();

        match &settings.origin {
            Origin::Local(root) => assert_eq!(root, &dir.path().join("pics")),
            other => panic!("unexpected origin {:?}", other),
        }
        assert!(settings.exhaust_path.is_dir());
        assert_eq!(settings.quality, 100);
        assert!(settings.enable_avif);
        assert!(config.pipeline_settings().is_none());
    }

    #[test]
    fn test_proxy_and_lazy_settings() {
        let (_dir, config) = load(
            "images:\n  path: https://origin.example/\nproxy:\n  metadata_backend: db\n  host_map:\n    cdn.example: http://other\nlazy:\n  enabled: true\n  tick_ms: 250\n  heavy_jobs: 2\n",
        );
        let settings = config.gateway_settings().unwrap();

        match &settings.origin {
            Origin::Proxy(proxy) => {
                assert_eq!(proxy.backend_url, "https://origin.example");
                assert_eq!(proxy.metadata_backend, MetadataBackend::Db);
                assert_eq!(proxy.host_map.get("cdn.example").unwrap(), "http://other");
                assert!(proxy.remote_raw.is_dir());
            }
            other => panic!("unexpected origin {:?}", other),
        }

        let pipeline = config.pipeline_settings().unwrap();
        assert_eq!(pipeline.tick, Duration::from_millis(250));
        assert_eq!(pipeline.heavy_jobs, 2);
        assert_eq!(pipeline.default_jobs, num_cpus());
        assert_eq!(pipeline.queue_capacity, 1000);
    }
}
