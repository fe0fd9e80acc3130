//! Ensemble des cibles en cours de production (single-flight)
//!
//! Avant de produire une cible, on tente de l'admettre dans l'ensemble.
//! Le premier arrivé obtient un [`InFlightGuard`] ; les suivants obtiennent
//! un [`Waiter`] qu'ils peuvent attendre ou ignorer. La libération du guard
//! (y compris lors d'une panique) retire l'entrée et réveille les attentes.
//!
//! Les entrées expirent après un délai fixe : une tâche perdue ne bloque
//! pas une cible indéfiniment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Durée de vie par défaut d'une entrée
pub const DEFAULT_INFLIGHT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Entry {
    since: Instant,
    token: u64,
    done: watch::Receiver<bool>,
}

#[derive(Debug)]
struct Inner {
    entries: Mutex<HashMap<PathBuf, Entry>>,
    next_token: AtomicU64,
    ttl: Duration,
}

/// Ensemble partagé des cibles en cours de production
#[derive(Debug, Clone)]
pub struct InFlightSet {
    inner: Arc<Inner>,
}

/// Résultat d'une tentative d'admission
#[derive(Debug)]
pub enum Admission {
    /// La cible est à nous jusqu'à la libération du guard
    Acquired(InFlightGuard),
    /// Une autre exécution produit déjà la cible
    Busy(Waiter),
}

impl Default for InFlightSet {
    fn default() -> Self {
        Self::new(DEFAULT_INFLIGHT_TTL)
    }
}

impl InFlightSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                ttl,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Tente d'admettre `target`
    ///
    /// Une entrée plus vieille que la durée de vie est considérée comme
    /// abandonnée et remplacée.
    pub fn try_admit(&self, target: &Path) -> Admission {
        let mut entries = self.entries();

        if let Some(entry) = entries.get(target) {
            if entry.since.elapsed() < self.inner.ttl {
                return Admission::Busy(Waiter {
                    done: entry.done.clone(),
                });
            }
            tracing::warn!(
                "In-flight entry for {} expired, taking over",
                target.display()
            );
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(false);
        entries.insert(
            target.to_path_buf(),
            Entry {
                since: Instant::now(),
                token,
                done: rx,
            },
        );

        Admission::Acquired(InFlightGuard {
            set: self.clone(),
            target: target.to_path_buf(),
            token,
            done: tx,
        })
    }

    /// Indique si une cible est actuellement en cours (entrée non expirée)
    pub fn contains(&self, target: &Path) -> bool {
        self.entries()
            .get(target)
            .is_some_and(|e| e.since.elapsed() < self.inner.ttl)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, target: &Path, token: u64) {
        let mut entries = self.entries();
        if entries.get(target).is_some_and(|e| e.token == token) {
            entries.remove(target);
        }
    }
}

/// Droit exclusif de produire une cible
#[derive(Debug)]
pub struct InFlightGuard {
    set: InFlightSet,
    target: PathBuf,
    token: u64,
    done: watch::Sender<bool>,
}

impl InFlightGuard {
    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.release(&self.target, self.token);
        let _ = self.done.send(true);
    }
}

/// Attente de la fin d'une production menée ailleurs
#[derive(Debug, Clone)]
pub struct Waiter {
    done: watch::Receiver<bool>,
}

impl Waiter {
    /// Se résout quand le guard correspondant est libéré
    pub async fn wait(mut self) {
        // Une erreur signifie que l'émetteur a disparu : la production est terminée
        let _ = self.done.wait_for(|done| *done).await;
    }
}
