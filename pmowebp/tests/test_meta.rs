use pmowebp::{DbMetadataStore, FileMetadataStore, FreshnessMetadata, MetadataStore};

fn sample() -> FreshnessMetadata {
    FreshnessMetadata {
        etag: "\"abc\"".into(),
        modified_epoch: 1445412480,
        expires_epoch: 0,
    }
}

/// Contrat commun aux deux backends
fn exercise(store: &dyn MetadataStore) {
    assert_eq!(store.load("id"), None);

    store.save("id", &sample()).unwrap();
    assert_eq!(store.load("id"), Some(sample()));

    let updated = FreshnessMetadata {
        etag: "\"def\"".into(),
        ..sample()
    };
    store.save("id", &updated).unwrap();
    assert_eq!(store.load("id"), Some(updated));
    assert_eq!(store.load("other"), None);

    store.remove("id").unwrap();
    assert_eq!(store.load("id"), None);
    // Supprimer une entrée absente n'est pas une erreur
    store.remove("id").unwrap();
}

#[test]
fn test_file_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMetadataStore::new(dir.path());
    exercise(&store);
}

#[test]
fn test_db_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = DbMetadataStore::open(&dir.path().join("nested/meta.db")).unwrap();
    exercise(&store);
}

#[test]
fn test_file_store_layout_and_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileMetadataStore::new(dir.path());
    store.save("abc", &sample()).unwrap();

    let path = dir.path().join("abc.meta");
    assert_eq!(store.meta_path("abc"), path);
    let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(json["etag"], "\"abc\"");

    // Un fichier illisible équivaut à l'absence de métadonnées
    std::fs::write(&path, b"{not json").unwrap();
    assert_eq!(store.load("abc"), None);
}

#[test]
fn test_db_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("meta.db");
    {
        let store = DbMetadataStore::open(&path).unwrap();
        store.save("abc", &sample()).unwrap();
    }
    let store = DbMetadataStore::open(&path).unwrap();
    assert_eq!(store.load("abc"), Some(sample()));
}
