//! Calcul des chemins des artefacts dérivés
//!
//! ```text
//! <exhaust>/<répertoire de la requête>/<nom>.<mtime>.<format>[_width=W&height=H]
//! ```
//!
//! La date de modification de la source (secondes Unix) fait partie du nom :
//! quand la source change, le chemin calculé change aussi et les anciens
//! artefacts ne sont plus jamais servis. Ils restent sur disque.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Taille en dessous de laquelle un fichier est considéré comme tronqué
pub const MIN_IMAGE_SIZE: u64 = 100;

/// Paramètres de redimensionnement demandés par le client (0 = non fourni)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExtraParams {
    pub width: u32,
    pub height: u32,
}

impl ExtraParams {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Interprète une valeur de requête ; absente ou non numérique donne 0
    pub fn parse_dimension(value: Option<&str>) -> u32 {
        value.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 && self.height == 0
    }
}

impl fmt::Display for ExtraParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_width={}&height={}", self.width, self.height)
    }
}

/// Chemins cibles calculés pour une source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedPaths {
    pub avif: PathBuf,
    pub webp: PathBuf,
}

/// Résolveur des chemins de l'arborescence « exhaust »
#[derive(Debug, Clone)]
pub struct CachePaths {
    exhaust_root: PathBuf,
    extra_params_enabled: bool,
}

impl CachePaths {
    pub fn new(exhaust_root: impl Into<PathBuf>, extra_params_enabled: bool) -> Self {
        Self {
            exhaust_root: exhaust_root.into(),
            extra_params_enabled,
        }
    }

    pub fn exhaust_root(&self) -> &Path {
        &self.exhaust_root
    }

    pub fn extra_params_enabled(&self) -> bool {
        self.extra_params_enabled
    }

    /// Calcule les chemins AVIF et WebP pour `raw`
    ///
    /// # Arguments
    ///
    /// * `raw` - fichier source, dont on lit la date de modification
    /// * `logical_name` - nom de base des artefacts (nom du fichier ou identité)
    /// * `request_path` - chemin de la requête, seul son répertoire est utilisé
    /// * `extra` - paramètres de redimensionnement
    ///
    /// # Returns
    ///
    /// `None` si la source ne peut pas être lue
    pub fn resolve(
        &self,
        raw: &Path,
        logical_name: &str,
        request_path: &str,
        extra: &ExtraParams,
    ) -> Option<DerivedPaths> {
        let mtime = source_mtime(raw)?;
        let dir = self.exhaust_root.join(sanitize(parent_of(request_path)));

        let name = |format: &str| {
            let mut file = format!("{}.{}.{}", logical_name, mtime, format);
            if self.extra_params_enabled {
                file.push_str(&extra.to_string());
            }
            dir.join(file)
        };

        Some(DerivedPaths {
            avif: name("avif"),
            webp: name("webp"),
        })
    }

    /// Préfixe commun de tous les artefacts d'une source, toutes générations confondues
    pub fn artifact_prefix(&self, logical_name: &str, request_path: &str) -> PathBuf {
        self.exhaust_root
            .join(sanitize(parent_of(request_path)))
            .join(format!("{}.", logical_name))
    }
}

/// Date de modification d'un fichier en secondes Unix
pub fn source_mtime(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let secs = match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    };
    Some(secs)
}

/// Un fichier image existe s'il est régulier et fait au moins [`MIN_IMAGE_SIZE`] octets
pub fn image_exists(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(info) if info.is_file() && info.len() >= MIN_IMAGE_SIZE => {
            tracing::debug!("{} exists", path.display());
            true
        }
        _ => false,
    }
}

/// Transforme un chemin de requête en chemin relatif sûr
///
/// Les composants `..`, `.` et racine sont ignorés, ce qui empêche de
/// sortir de la racine à laquelle le résultat est joint.
pub fn sanitize(request_path: &str) -> PathBuf {
    Path::new(request_path)
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

fn parent_of(request_path: &str) -> &str {
    match request_path.rfind('/') {
        Some(idx) => &request_path[..idx],
        None => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_drops_traversal() {
        assert_eq!(sanitize("/a/../../etc/passwd"), PathBuf::from("a/etc/passwd"));
        assert_eq!(sanitize("./b.jpg"), PathBuf::from("b.jpg"));
        assert_eq!(sanitize("/"), PathBuf::new());
    }

    #[test]
    fn test_parse_dimension() {
        assert_eq!(ExtraParams::parse_dimension(Some("200")), 200);
        assert_eq!(ExtraParams::parse_dimension(Some("abc")), 0);
        assert_eq!(ExtraParams::parse_dimension(Some("-3")), 0);
        assert_eq!(ExtraParams::parse_dimension(None), 0);
    }

    #[test]
    fn test_extra_params_suffix() {
        assert_eq!(ExtraParams::new(200, 0).to_string(), "_width=200&height=0");
    }
}
