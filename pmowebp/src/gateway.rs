//! Traitement d'une requête d'image, de bout en bout
//!
//! ```text
//! requête ─▶ type autorisé ? ─▶ négociation ─▶ (proxy) miroir de l'origine
//!         ─▶ chemins dérivés ─▶ conversions ─▶ plus petit fichier ─▶ Outcome
//! ```
//!
//! Le résultat est un [`Outcome`] indépendant du framework HTTP ; la
//! traduction en réponse se fait dans `pmoserver_ext`.

use anyhow::{Result, bail};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::Codec;
use crate::coordinator::Coordinator;
use crate::db::DbMetadataStore;
use crate::fetch::{FetchError, OriginFetcher};
use crate::format::{ImageFormat, negotiate, raw_content_type};
use crate::identity::identity_for;
use crate::meta::{FileMetadataStore, MetadataStore};
use crate::paths::{CachePaths, ExtraParams, image_exists, sanitize};
use crate::pipeline::{CachePipeline, PipelineSettings, REQUEST_PRIORITY};
use crate::select::{compression_ratio, invalidate_prefix, smallest_of};

/// Nom de la base SQLite des métadonnées, sous la racine « remote-raw »
pub const META_DB_FILE: &str = "meta.db";

/// Backend de stockage des métadonnées de fraîcheur
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetadataBackend {
    /// Un fichier `<identité>.meta` à côté de chaque fichier brut
    #[default]
    File,
    /// Une base SQLite partagée
    Db,
}

impl std::str::FromStr for MetadataBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "sidecar" => Ok(MetadataBackend::File),
            "db" | "sqlite" | "kv" => Ok(MetadataBackend::Db),
            other => bail!("unknown metadata backend {:?}", other),
        }
    }
}

/// Réglages du mode proxy
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// URL de l'origine, sans barre finale
    pub backend_url: String,
    /// Origines spécifiques par nom d'hôte de la requête
    pub host_map: HashMap<String, String>,
    /// Racine des copies locales
    pub remote_raw: PathBuf,
    pub timeout: Duration,
    pub metadata_backend: MetadataBackend,
}

/// Provenance des images sources
#[derive(Debug, Clone)]
pub enum Origin {
    /// Arborescence locale
    Local(PathBuf),
    /// Origine HTTP mise en miroir
    Proxy(ProxySettings),
}

/// Réglages de la passerelle
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub origin: Origin,
    pub exhaust_path: PathBuf,
    /// Extensions autorisées (sans point) ; `*` autorise tout
    pub allowed_types: Vec<String>,
    pub quality: u8,
    pub enable_avif: bool,
    pub enable_extra_params: bool,
}

impl GatewaySettings {
    /// Réglages par défaut pour une arborescence locale
    pub fn local(images: impl Into<PathBuf>, exhaust: impl Into<PathBuf>) -> Self {
        Self {
            origin: Origin::Local(images.into()),
            exhaust_path: exhaust.into(),
            allowed_types: ["jpg", "png", "jpeg", "bmp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quality: 80,
            enable_avif: false,
            enable_extra_params: false,
        }
    }

    /// Le nom de fichier a-t-il une extension autorisée ?
    pub fn is_allowed(&self, file_name: &str) -> bool {
        let file_name = file_name.to_lowercase();
        self.allowed_types.iter().any(|allowed| {
            allowed == "*" || file_name.ends_with(&format!(".{}", allowed.to_lowercase()))
        })
    }

    /// Formats produits par conversion
    pub fn enabled_formats(&self) -> Vec<ImageFormat> {
        ImageFormat::CONVERTED
            .into_iter()
            .filter(|f| *f != ImageFormat::Avif || self.enable_avif)
            .collect()
    }
}

/// Requête d'image, indépendante du framework HTTP
#[derive(Debug, Clone, Default)]
pub struct ImageRequest {
    /// Chemin décodé (`/a/b.jpg`)
    pub path: String,
    /// Chemin et requête tels que reçus (`/a/b.jpg?width=200`)
    pub uri_with_query: String,
    /// Nom d'hôte de la requête, sans port
    pub host: String,
    pub client_ip: Option<String>,
    pub accept: String,
    pub user_agent: String,
    pub width: u32,
    pub height: u32,
}

impl ImageRequest {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            uri_with_query: path.clone(),
            path,
            ..Default::default()
        }
    }

    pub fn accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = accept.into();
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or_default()
    }
}

/// Issue du traitement d'une requête
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Extension non autorisée (400)
    BadRequest(String),
    /// Aucune source disponible (404)
    NotFound,
    /// L'origine a échoué ou a répondu avec ce statut
    Upstream(u16, String),
    /// Fichier à servir
    File {
        path: PathBuf,
        format: ImageFormat,
        content_type: String,
        /// Rapport de compression, vide s'il n'a pas pu être calculé
        ratio: String,
        /// Fichier source, servi si `path` disparaît avant la lecture
        raw: PathBuf,
        raw_content_type: String,
    },
}

struct Inner {
    settings: GatewaySettings,
    paths: CachePaths,
    coordinator: Coordinator,
    fetcher: Option<OriginFetcher>,
}

/// Passerelle d'images, partagée entre les requêtes
#[derive(Clone)]
pub struct ImageGateway {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ImageGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageGateway")
            .field("settings", &self.inner.settings)
            .field("lazy", &self.inner.coordinator.is_lazy())
            .finish()
    }
}

impl ImageGateway {
    /// Construit la passerelle
    ///
    /// Avec `pipeline`, les conversions sont différées et la boucle de
    /// vidage démarre immédiatement (un runtime tokio doit être actif).
    ///
    /// # Errors
    ///
    /// En mode local, une racine source absente est une erreur fatale.
    pub fn new(
        settings: GatewaySettings,
        codec: Arc<dyn Codec>,
        pipeline: Option<PipelineSettings>,
    ) -> Result<Self> {
        let fetcher = match &settings.origin {
            Origin::Local(root) => {
                if !root.is_dir() {
                    bail!("image path {} is incorrect, please check", root.display());
                }
                tracing::info!("Serving local images from {}", root.display());
                None
            }
            Origin::Proxy(proxy) => {
                std::fs::create_dir_all(&proxy.remote_raw)?;
                let meta: Arc<dyn MetadataStore> = match proxy.metadata_backend {
                    MetadataBackend::File => Arc::new(FileMetadataStore::new(proxy.remote_raw.clone())),
                    MetadataBackend::Db => {
                        Arc::new(DbMetadataStore::open(&proxy.remote_raw.join(META_DB_FILE))?)
                    }
                };
                tracing::info!(
                    "Proxying {} ({} host mappings), mirror in {}",
                    proxy.backend_url,
                    proxy.host_map.len(),
                    proxy.remote_raw.display()
                );
                Some(OriginFetcher::new(meta, proxy.timeout)?)
            }
        };

        std::fs::create_dir_all(&settings.exhaust_path)?;

        let coordinator = match pipeline {
            Some(pipeline_settings) => {
                let pipeline = CachePipeline::new(pipeline_settings, codec);
                pipeline.start();
                Coordinator::lazy(settings.quality, pipeline)
            }
            None => Coordinator::eager(codec, settings.quality),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                paths: CachePaths::new(settings.exhaust_path.clone(), settings.enable_extra_params),
                settings,
                coordinator,
                fetcher,
            }),
        })
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.inner.settings
    }

    pub fn paths(&self) -> &CachePaths {
        &self.inner.paths
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }

    pub fn pipeline(&self) -> Option<&Arc<CachePipeline>> {
        self.inner.coordinator.pipeline()
    }

    /// Paramètres de redimensionnement effectifs d'une requête
    pub fn extra_params(&self, request: &ImageRequest) -> ExtraParams {
        if self.inner.settings.enable_extra_params {
            ExtraParams::new(request.width, request.height)
        } else {
            ExtraParams::default()
        }
    }

    /// Cibles de conversion d'une source, par format
    pub fn targets_for(
        &self,
        raw: &Path,
        logical_name: &str,
        request_path: &str,
        params: &ExtraParams,
    ) -> Option<BTreeMap<ImageFormat, PathBuf>> {
        let derived = self
            .inner
            .paths
            .resolve(raw, logical_name, request_path, params)?;
        let targets = self
            .inner
            .settings
            .enabled_formats()
            .into_iter()
            .map(|format| match format {
                ImageFormat::Avif => (format, derived.avif.clone()),
                _ => (format, derived.webp.clone()),
            })
            .collect();
        Some(targets)
    }

    /// Traite une requête
    pub async fn serve(&self, request: &ImageRequest) -> Outcome {
        let settings = &self.inner.settings;
        let file_name = request.file_name();

        tracing::debug!(
            "Incoming request from {} {} {}",
            request.client_ip.as_deref().unwrap_or("-"),
            request.host,
            file_name
        );

        if !settings.is_allowed(file_name) {
            let msg = format!("File extension not allowed! {}", file_name);
            tracing::warn!("{}", msg);
            return Outcome::BadRequest(msg);
        }

        let accepted = negotiate(&request.user_agent, &request.accept);
        let params = self.extra_params(request);

        let (raw, logical_name, request_path) = match &settings.origin {
            Origin::Local(root) => {
                let relative = sanitize(&request.path);
                let request_path = format!("/{}", relative.to_string_lossy());
                (root.join(&relative), file_name.to_string(), request_path)
            }
            Origin::Proxy(proxy) => match self.mirror(proxy, request).await {
                Ok(located) => located,
                Err(outcome) => return outcome,
            },
        };

        if !image_exists(&raw) {
            tracing::info!("Image not found: {}", raw.display());
            return Outcome::NotFound;
        }

        let targets = match self.targets_for(&raw, &logical_name, &request_path, &params) {
            Some(targets) => targets,
            None => return Outcome::NotFound,
        };

        self.inner
            .coordinator
            .ensure(&raw, &targets, &params, REQUEST_PRIORITY)
            .await;

        let mut candidates = vec![raw.clone()];
        for (format, target) in &targets {
            if accepted.contains(format) && image_exists(target) {
                candidates.push(target.clone());
            }
        }

        let chosen = match smallest_of(&candidates) {
            Some(chosen) => chosen,
            None => return Outcome::NotFound,
        };

        let format = if chosen == raw {
            ImageFormat::Raw
        } else {
            ImageFormat::of_artifact(&chosen)
        };
        let source_type = raw_content_type(Path::new(&request.path));
        let content_type = format.content_type().unwrap_or(source_type).to_string();
        let ratio = compression_ratio(&raw, &chosen);

        Outcome::File {
            path: chosen,
            format,
            content_type,
            ratio,
            raw,
            raw_content_type: source_type.to_string(),
        }
    }

    /// Met l'origine en miroir et retourne (fichier brut, nom logique, chemin de requête)
    async fn mirror(
        &self,
        proxy: &ProxySettings,
        request: &ImageRequest,
    ) -> std::result::Result<(PathBuf, String, String), Outcome> {
        let Some(fetcher) = &self.inner.fetcher else {
            return Err(Outcome::Upstream(500, "proxy is not configured".into()));
        };

        let host = request.host.to_ascii_lowercase();
        let backend = match proxy.host_map.get(&host) {
            Some(mapped) => {
                tracing::debug!("Host {} mapped to {}", request.host, mapped);
                mapped.as_str()
            }
            None => proxy.backend_url.as_str(),
        };
        let remote_url = format!("{}{}", backend.trim_end_matches('/'), request.uri_with_query);

        let id = identity_for(&remote_url);
        let raw = proxy.remote_raw.join(&id);
        let host_dir = sanitize(&host).to_string_lossy().into_owned();
        let request_path = format!("/{}/{}", host_dir, id);
        let prefix = self.inner.paths.artifact_prefix(&id, &request_path);

        tracing::info!("Fetching {} for {}", remote_url, request.path);
        match fetcher.mirror(&raw, &remote_url, &id).await {
            Ok(true) => {
                // Nouvelle génération : les artefacts de l'ancienne ne servent plus
                invalidate_prefix(&prefix);
            }
            Ok(false) => {}
            Err(FetchError::Status(status)) => {
                invalidate_prefix(&prefix);
                return Err(Outcome::Upstream(
                    status,
                    format!("Remote returned {} status code!", status),
                ));
            }
            Err(FetchError::NotImage(content_type)) => {
                invalidate_prefix(&prefix);
                tracing::warn!("{} is not an image ({})", remote_url, content_type);
                return Err(Outcome::NotFound);
            }
            Err(e) if image_exists(&raw) => {
                tracing::warn!("{}, serving stale copy of {}", e, remote_url);
            }
            Err(e @ FetchError::Io(_)) => {
                return Err(Outcome::Upstream(500, e.to_string()));
            }
            Err(e) => {
                return Err(Outcome::Upstream(502, e.to_string()));
            }
        }

        Ok((raw, id, request_path))
    }

    /// Arrête le pipeline de conversions différées, s'il existe
    pub async fn shutdown(&self) -> bool {
        match self.pipeline() {
            Some(pipeline) => pipeline.shutdown().await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_types() {
        let mut settings = GatewaySettings::local("/tmp", "/tmp/exhaust");
        assert!(settings.is_allowed("photo.JPG"));
        assert!(!settings.is_allowed("photo.gif"));
        assert!(!settings.is_allowed("jpg"));

        settings.allowed_types = vec!["*".into()];
        assert!(settings.is_allowed("anything.txt"));
    }

    #[test]
    fn test_metadata_backend_from_str() {
        assert_eq!("db".parse::<MetadataBackend>().unwrap(), MetadataBackend::Db);
        assert_eq!("File".parse::<MetadataBackend>().unwrap(), MetadataBackend::File);
        assert!("redis".parse::<MetadataBackend>().is_err());
    }
}
