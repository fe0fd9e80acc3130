//! Choix du fichier servi et invalidation des artefacts

use std::path::{Path, PathBuf};

/// Retourne le plus petit fichier existant parmi `candidates`
///
/// En cas d'égalité, le premier rencontré l'emporte. `None` si aucun
/// candidat n'existe.
pub fn smallest_of<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    let mut best: Option<(u64, &Path)> = None;

    for candidate in candidates {
        let candidate = candidate.as_ref();
        let size = match std::fs::metadata(candidate) {
            Ok(info) if info.is_file() => info.len(),
            _ => {
                tracing::debug!("{} not found on filesystem", candidate.display());
                continue;
            }
        };
        if best.is_none_or(|(smallest, _)| size < smallest) {
            best = Some((size, candidate));
        }
    }

    best.map(|(_, path)| path.to_path_buf())
}

/// Rapport taille choisie / taille brute, avec deux décimales
///
/// Chaîne vide si l'un des deux fichiers ne peut pas être lu.
pub fn compression_ratio(raw: &Path, chosen: &Path) -> String {
    let (raw_size, chosen_size) = match (std::fs::metadata(raw), std::fs::metadata(chosen)) {
        (Ok(r), Ok(c)) => (r.len(), c.len()),
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!("Cannot compute compression ratio: {}", e);
            return String::new();
        }
    };
    if raw_size == 0 {
        return String::new();
    }
    let ratio = chosen_size as f64 / raw_size as f64;
    tracing::debug!("Compression ratio {}/{} = {:.2}", chosen_size, raw_size, ratio);
    format!("{:.2}", ratio)
}

/// Supprime tous les fichiers dont le chemin commence par `prefix`
///
/// Seul le répertoire parent de `prefix` est parcouru, sans récursion.
/// Retourne le nombre de fichiers supprimés.
pub fn invalidate_prefix(prefix: &Path) -> usize {
    let (dir, stem) = match (prefix.parent(), prefix.file_name().and_then(|n| n.to_str())) {
        (Some(dir), Some(stem)) => (dir, stem),
        _ => return 0,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let matches = name.to_str().is_some_and(|n| n.starts_with(stem));
        if !matches || !entry.file_type().is_ok_and(|t| t.is_file()) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::info!("Cannot remove {}: {}", entry.path().display(), e),
        }
    }

    if removed > 0 {
        tracing::info!("Invalidated {} files under {}*", removed, prefix.display());
    }
    removed
}

/// ETag faible `W/"<taille>-<CRC32>"` d'un contenu
pub fn weak_etag(data: &[u8]) -> String {
    format!("W/\"{}-{:08X}\"", data.len(), crc32fast::hash(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weak_etag() {
        // CRC32("123456789") = CBF43926
        assert_eq!(weak_etag(b"123456789"), "W/\"9-CBF43926\"");
        assert_eq!(weak_etag(b""), "W/\"0-00000000\"");
    }
}
