//! Mise en miroir d'une ressource distante
//!
//! Le fichier local n'est jamais visible dans un état partiel : le corps
//! de la réponse est écrit dans un fichier temporaire du même répertoire
//! puis renommé atomiquement sur le chemin cible.

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, ETAG, EXPIRES, IF_NONE_MATCH, LAST_MODIFIED};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::meta::{FreshnessMetadata, MetadataStore};

/// Échecs possibles d'une mise en miroir
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// L'origine n'a pas pu être contactée ou la lecture du corps a échoué
    #[error("origin unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    /// L'origine a répondu avec un statut autre que 200 (ou 304 attendu)
    #[error("origin answered with status {0}")]
    Status(u16),
    /// Le contenu servi n'est pas une image
    #[error("origin served non-image content: {0:?}")]
    NotImage(String),
    #[error("local storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Client de mise en miroir avec requêtes conditionnelles
#[derive(Clone)]
pub struct OriginFetcher {
    client: reqwest::Client,
    meta: Arc<dyn MetadataStore>,
}

impl OriginFetcher {
    /// Crée un fetcher avec un client HTTP borné par `timeout`
    pub fn new(meta: Arc<dyn MetadataStore>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, meta))
    }

    pub fn with_client(client: reqwest::Client, meta: Arc<dyn MetadataStore>) -> Self {
        Self { client, meta }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.meta
    }

    /// Assure qu'une copie locale fraîche de `url` existe à `target`
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - le fichier local a été (re)téléchargé
    /// * `Ok(false)` - l'origine a confirmé la copie existante (304)
    /// * `Err(_)` - voir [`FetchError`] ; seul `NotImage` modifie l'état local
    pub async fn mirror(&self, target: &Path, url: &str, id: &str) -> Result<bool, FetchError> {
        // Sans copie locale, une revalidation n'aurait rien à confirmer
        let prior = match tokio::fs::try_exists(target).await {
            Ok(true) => self.meta.load(id).unwrap_or_default(),
            _ => FreshnessMetadata::default(),
        };

        let mut request = self.client.get(url);
        if !prior.etag.is_empty() {
            request = request.header(IF_NONE_MATCH, prior.etag.as_str());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED && !prior.etag.is_empty() {
            tracing::debug!("{} not modified (etag {})", url, prior.etag);
            return Ok(false);
        }
        if status != StatusCode::OK {
            tracing::warn!("Origin answered {} for {}", status, url);
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = header_str(&response, CONTENT_TYPE).unwrap_or_default();
        if !content_type.to_ascii_lowercase().starts_with("image/") {
            tracing::warn!("Origin served {:?} for {}, dropping local copy", content_type, url);
            remove_if_exists(target).await?;
            if let Err(e) = self.meta.remove(id) {
                tracing::warn!("Failed to forget metadata for {}: {}", id, e);
            }
            return Err(FetchError::NotImage(content_type));
        }

        let meta = FreshnessMetadata {
            etag: header_str(&response, ETAG).unwrap_or_default(),
            modified_epoch: header_str(&response, LAST_MODIFIED)
                .and_then(|v| parse_http_date(&v))
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            expires_epoch: header_str(&response, EXPIRES)
                .and_then(|v| parse_http_date(&v))
                .unwrap_or(0),
        };

        write_atomically(target, response).await?;
        tracing::info!("Mirrored {} into {}", url, target.display());

        if let Err(e) = self.meta.save(id, &meta) {
            tracing::warn!("Failed to persist metadata for {}: {}", id, e);
        }

        Ok(true)
    }
}

/// Écrit le corps de la réponse dans un fichier temporaire puis le renomme
async fn write_atomically(target: &Path, response: reqwest::Response) -> Result<(), FetchError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;

    let tmp = tempfile::Builder::new()
        .prefix(".fetch-")
        .tempfile_in(parent)?;
    let (file, tmp_path) = tmp.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    tmp_path.persist(target).map_err(|e| FetchError::Io(e.error))?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Dates HTTP (`Wed, 21 Oct 2015 07:28:00 GMT`) en secondes Unix
fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_date() {
        assert_eq!(
            parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(1445412480)
        );
        assert_eq!(parse_http_date("not a date"), None);
    }
}
