//! Métadonnées de fraîcheur des ressources distantes
//!
//! Ces métadonnées servent uniquement à construire des requêtes
//! conditionnelles vers l'origine. La fraîcheur des artefacts dérivés
//! repose sur la date de modification encodée dans leur nom.
//!
//! Deux implémentations de [`MetadataStore`] sont disponibles :
//! - [`FileMetadataStore`] : un fichier JSON `<identité>.meta` par ressource,
//!   à côté du fichier brut
//! - [`crate::db::DbMetadataStore`] : une ligne par ressource dans une base SQLite

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Extension des fichiers de métadonnées
pub const META_EXTENSION: &str = "meta";

/// Enregistrement de fraîcheur d'une ressource mirroir
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessMetadata {
    /// ETag renvoyé par l'origine (vide si absent)
    #[serde(default)]
    pub etag: String,
    /// Last-Modified, en secondes Unix
    #[serde(default)]
    pub modified_epoch: i64,
    /// Expires, en secondes Unix (0 si absent)
    #[serde(default)]
    pub expires_epoch: i64,
}

/// Stockage des métadonnées de fraîcheur, indexé par identité de ressource.
///
/// Un échec de lecture n'est jamais une erreur : il équivaut à
/// l'absence de métadonnées antérieures.
pub trait MetadataStore: Send + Sync {
    /// Charge les métadonnées d'une ressource
    fn load(&self, id: &str) -> Option<FreshnessMetadata>;

    /// Enregistre (ou écrase) les métadonnées d'une ressource
    fn save(&self, id: &str, meta: &FreshnessMetadata) -> Result<()>;

    /// Oublie les métadonnées d'une ressource
    fn remove(&self, id: &str) -> Result<()>;
}

/// Métadonnées stockées dans un fichier JSON par ressource
#[derive(Debug, Clone)]
pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Chemin du fichier de métadonnées d'une ressource
    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, META_EXTENSION))
    }
}

impl MetadataStore for FileMetadataStore {
    fn load(&self, id: &str) -> Option<FreshnessMetadata> {
        let path = self.meta_path(id);
        let content = match std::fs::read(&path) {
            Ok(content) => content,
            Err(_) => return None,
        };
        match serde_json::from_slice(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!("Ignoring unreadable metadata {}: {}", path.display(), e);
                None
            }
        }
    }

    fn save(&self, id: &str, meta: &FreshnessMetadata) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_vec(meta)?;
        std::fs::write(self.meta_path(id), content)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.meta_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
