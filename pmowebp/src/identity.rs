/// Identité stable d'une ressource distante
///
/// Utilise SHA1 sur l'URL complète (requête incluse) et retourne
/// l'empreinte en hexadécimal (40 caractères). Deux chaînes de requête
/// différentes donnent deux identités différentes.
///
/// # Exemple
///
/// ```
/// use pmowebp::identity_for;
///
/// let a = identity_for("https://origin.example/a.jpg?v=1");
/// let b = identity_for("https://origin.example/a.jpg?v=2");
/// assert_eq!(a.len(), 40);
/// assert_ne!(a, b);
/// ```
pub fn identity_for(url: &str) -> String {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_stable() {
        assert_eq!(
            identity_for("http://o/a.jpg"),
            identity_for("http://o/a.jpg")
        );
        // SHA1("abc")
        assert_eq!(identity_for("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
