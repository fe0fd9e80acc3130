//! Pool de workers borné pour les conversions en arrière-plan
//!
//! Un pool accepte au plus `workers + capacity` travaux non terminés :
//! `workers` s'exécutent, les autres attendent un permis. Au-delà, la
//! soumission est refusée et l'appelant garde son travail.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

#[derive(Debug)]
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
    limit: usize,
    permits: Arc<Semaphore>,
    outstanding: Arc<AtomicUsize>,
    tracker: TaskTracker,
}

/// Place réservée dans un pool, consommée par [`PoolSlot::run`]
///
/// Une place non utilisée est rendue à sa destruction.
#[derive(Debug)]
pub struct PoolSlot<'a> {
    pool: &'a WorkerPool,
    used: bool,
}

impl WorkerPool {
    /// Crée un pool de `workers` travaux simultanés (au moins 1)
    /// avec une file interne de `capacity` travaux
    pub fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        Self {
            name,
            workers,
            limit: workers + capacity,
            permits: Arc::new(Semaphore::new(workers)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            tracker: TaskTracker::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Nombre de travaux soumis et non terminés
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Réserve une place, `None` si le pool est plein ou arrêté
    pub fn try_reserve(&self) -> Option<PoolSlot<'_>> {
        if self.tracker.is_closed() {
            return None;
        }
        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .ok()
            .map(|_| PoolSlot {
                pool: self,
                used: false,
            })
    }

    /// Ferme le pool et attend la fin des travaux soumis
    ///
    /// Retourne `false` si le délai expire ; les travaux restants sont
    /// abandonnés à leur sort, pas interrompus.
    pub async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "Pool {} still has {} jobs after {:?}, abandoning them",
                    self.name,
                    self.outstanding(),
                    timeout
                );
                false
            }
        }
    }
}

impl PoolSlot<'_> {
    /// Lance `job` (bloquant) dès qu'un worker est libre
    pub fn run<F>(mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.used = true;
        let permits = Arc::clone(&self.pool.permits);
        let outstanding = Arc::clone(&self.pool.outstanding);
        let name = self.pool.name;

        self.pool.tracker.spawn(async move {
            if let Ok(_permit) = permits.acquire_owned().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    tracing::error!("Job in pool {} panicked: {}", name, e);
                }
            }
            outstanding.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl Drop for PoolSlot<'_> {
    fn drop(&mut self) {
        if !self.used {
            self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_beyond_capacity() {
        let pool = WorkerPool::new("test", 1, 1);
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let rx = Arc::new(std::sync::Mutex::new(rx));

        for _ in 0..2 {
            let rx = Arc::clone(&rx);
            pool.try_reserve().unwrap().run(move || {
                let _ = rx.lock().unwrap().recv();
            });
        }
        assert!(pool.try_reserve().is_none());

        drop(tx);
        assert!(pool.stop_and_wait(Duration::from_secs(5)).await);
        assert_eq!(pool.outstanding(), 0);
        assert!(pool.try_reserve().is_none());
    }

    #[tokio::test]
    async fn test_unused_slot_is_returned() {
        let pool = WorkerPool::new("test", 1, 0);
        let slot = pool.try_reserve().unwrap();
        assert!(pool.try_reserve().is_none());
        drop(slot);
        assert!(pool.try_reserve().is_some());
    }
}
