//! Préchargement de l'arborescence source
//!
//! Parcourt les images autorisées de la racine locale et les fait passer
//! par le coordinateur avec une priorité basse : converties aussitôt en
//! mode immédiat, mises en file en mode différé.

use anyhow::{Result, bail};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gateway::{ImageGateway, Origin};
use crate::paths::ExtraParams;
use crate::pipeline::PREFETCH_PRIORITY;

/// Bilan d'un préchargement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    /// Images autorisées trouvées
    pub images: usize,
    /// Images sans date de modification lisible
    pub skipped: usize,
}

/// Précharge toutes les images de la racine locale
///
/// # Arguments
///
/// * `gateway` - passerelle configurée en mode local
/// * `jobs` - nombre d'images traitées simultanément (au moins 1)
pub async fn prefetch(gateway: &ImageGateway, jobs: usize) -> Result<PrefetchReport> {
    let root = match &gateway.settings().origin {
        Origin::Local(root) => root.clone(),
        Origin::Proxy(_) => bail!("prefetch is only available for a local image tree"),
    };

    let walk_root = root.clone();
    let files = tokio::task::spawn_blocking(move || collect_files(&walk_root)).await??;

    let settings = gateway.settings();
    let images: Vec<PathBuf> = files
        .into_iter()
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| settings.is_allowed(n))
        })
        .collect();

    tracing::info!("Prefetching {} images from {}", images.len(), root.display());

    let skipped = AtomicUsize::new(0);
    let params = ExtraParams::default();

    futures::stream::iter(images.iter())
        .for_each_concurrent(jobs.max(1), |raw| {
            let root = &root;
            let skipped = &skipped;
            async move {
                let Some((logical_name, request_path)) = logical_location(root, raw) else {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                match gateway.targets_for(raw, &logical_name, &request_path, &params) {
                    Some(targets) => {
                        gateway
                            .coordinator()
                            .ensure(raw, &targets, &params, PREFETCH_PRIORITY)
                            .await;
                    }
                    None => {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
        .await;

    let report = PrefetchReport {
        images: images.len(),
        skipped: skipped.into_inner(),
    };
    tracing::info!("Prefetch done: {:?}", report);
    Ok(report)
}

/// Nom logique et chemin de requête équivalent d'un fichier de la racine
fn logical_location(root: &Path, raw: &Path) -> Option<(String, String)> {
    let relative = raw.strip_prefix(root).ok()?;
    let name = relative.file_name()?.to_str()?.to_string();
    let request_path = format!("/{}", relative.to_str()?);
    Some((name, request_path))
}

/// Liste récursivement les fichiers réguliers sous `root`
fn collect_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}
