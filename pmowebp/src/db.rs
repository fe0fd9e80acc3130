//! Backend SQLite des métadonnées de fraîcheur
//!
//! Chaque ressource est une ligne indépendante : la lecture se fait dans
//! une transaction différée, l'écriture dans une transaction immédiate.

use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::meta::{FreshnessMetadata, MetadataStore};

/// Nom de la table des métadonnées
const TABLE: &str = "freshness";

/// Métadonnées stockées dans une base SQLite
///
/// La valeur est l'enregistrement JSON, la clé l'identité de la ressource.
#[derive(Debug)]
pub struct DbMetadataStore {
    conn: Mutex<Connection>,
}

impl DbMetadataStore {
    /// Ouvre (ou crée) la base
    ///
    /// # Arguments
    ///
    /// * `path` - Chemin vers le fichier SQLite
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Base en mémoire, utile pour les tests
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    record TEXT NOT NULL
                )",
                TABLE
            ),
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // Une connexion SQLite reste cohérente même si un thread a paniqué
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self, id: &str) -> Result<Option<FreshnessMetadata>> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let record: Option<String> = tx
            .query_row(
                &format!("SELECT record FROM {} WHERE id = ?1", TABLE),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        tx.commit()?;

        match record {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).map_err(|e| anyhow!("corrupted record: {}", e))?,
            )),
            None => Ok(None),
        }
    }
}

impl MetadataStore for DbMetadataStore {
    fn load(&self, id: &str) -> Option<FreshnessMetadata> {
        match self.read(id) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Metadata lookup failed for {}: {}", id, e);
                None
            }
        }
    }

    fn save(&self, id: &str, meta: &FreshnessMetadata) -> Result<()> {
        let record = serde_json::to_string(meta)?;
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!(
                "INSERT INTO {} (id, record) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET record = excluded.record",
                TABLE
            ),
            params![id, record],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(&format!("DELETE FROM {} WHERE id = ?1", TABLE), params![id])?;
        Ok(())
    }
}
