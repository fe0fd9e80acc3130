//! Formats d'image et négociation avec le client
//!
//! La négociation se base sur l'en-tête `Accept` et, pour WebP uniquement,
//! sur quelques signatures de `User-Agent` mobiles qui n'annoncent pas
//! correctement leurs capacités.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

/// Représentations qu'un client peut recevoir.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageFormat {
    /// Fichier source, servi tel quel
    Raw,
    Webp,
    Avif,
}

impl ImageFormat {
    /// Formats produits par conversion, dans l'ordre de production.
    pub const CONVERTED: [ImageFormat; 2] = [ImageFormat::Webp, ImageFormat::Avif];

    /// Extension utilisée dans les noms d'artefacts dérivés.
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
        }
    }

    /// Content-Type à poser sur la réponse, `None` pour le fichier source.
    pub fn content_type(self) -> Option<&'static str> {
        match self {
            ImageFormat::Raw => None,
            ImageFormat::Webp => Some("image/webp"),
            ImageFormat::Avif => Some("image/avif"),
        }
    }

    /// Les conversions coûteuses partent sur la file « heavy ».
    pub fn is_heavy(self) -> bool {
        matches!(self, ImageFormat::Avif)
    }

    /// Retrouve le format d'un artefact à partir de son nom de fichier.
    ///
    /// Les artefacts suffixés par des paramètres de redimensionnement
    /// (`photo.jpg.1700000000.webp_width=200&height=0`) sont reconnus.
    pub fn of_artifact(path: &Path) -> ImageFormat {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return ImageFormat::Raw,
        };
        let ext = name.rsplit('.').next().unwrap_or_default();
        let ext = ext.split('_').next().unwrap_or_default();
        match ext {
            "webp" if name.contains('.') => ImageFormat::Webp,
            "avif" if name.contains('.') => ImageFormat::Avif,
            _ => ImageFormat::Raw,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Navigateurs mobiles qui supportent WebP sans l'annoncer dans `Accept`.
const WEBP_USER_AGENTS: &[&str] = &[
    "iPhone OS 14",
    "CPU OS 14",
    "iPhone OS 15",
    "CPU OS 15",
    "Android",
    "Linux",
];

/// Détermine l'ensemble des formats acceptables pour une requête.
///
/// Le format brut est toujours présent. AVIF n'est ajouté que sur annonce
/// explicite dans `Accept`.
pub fn negotiate(user_agent: &str, accept: &str) -> BTreeSet<ImageFormat> {
    let accept = accept.to_lowercase();
    let mut formats = BTreeSet::from([ImageFormat::Raw]);

    if accept.contains("image/webp") || WEBP_USER_AGENTS.iter().any(|ua| user_agent.contains(ua))
    {
        formats.insert(ImageFormat::Webp);
    }
    if accept.contains("image/avif") {
        formats.insert(ImageFormat::Avif);
    }

    tracing::debug!("negotiated {:?} for ua={:?} accept={:?}", formats, user_agent, accept);
    formats
}

/// Content-Type d'un fichier source d'après son extension.
pub fn raw_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "tif" | "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_only_without_signals() {
        let formats = negotiate("curl/8.0", "*/*");
        assert_eq!(formats, BTreeSet::from([ImageFormat::Raw]));
    }

    #[test]
    fn test_accept_header() {
        let formats = negotiate("", "image/AVIF,image/webp,*/*");
        assert!(formats.contains(&ImageFormat::Webp));
        assert!(formats.contains(&ImageFormat::Avif));
    }

    #[test]
    fn test_ios_user_agent_gets_webp() {
        let ua = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_2 like Mac OS X) AppleWebKit/605.1.15";
        let formats = negotiate(ua, "");
        assert!(formats.contains(&ImageFormat::Webp));
        assert!(!formats.contains(&ImageFormat::Avif));
    }

    #[test]
    fn test_avif_has_no_user_agent_heuristic() {
        let formats = negotiate("Mozilla/5.0 (Linux; Android 12)", "");
        assert!(formats.contains(&ImageFormat::Webp));
        assert!(!formats.contains(&ImageFormat::Avif));
    }

    #[test]
    fn test_of_artifact() {
        assert_eq!(
            ImageFormat::of_artifact(Path::new("/x/b.jpg.1700000000.webp")),
            ImageFormat::Webp
        );
        assert_eq!(
            ImageFormat::of_artifact(Path::new("/x/b.jpg.1700000000.avif_width=200&height=0")),
            ImageFormat::Avif
        );
        assert_eq!(ImageFormat::of_artifact(Path::new("/x/b.jpg")), ImageFormat::Raw);
    }
}
