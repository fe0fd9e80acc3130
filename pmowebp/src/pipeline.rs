//! Conversions différées (politique « lazy »)
//!
//! Le [`CachePipeline`] possède deux files de priorité (formats légers et
//! formats lourds), chacune associée à un [`WorkerPool`], ainsi que
//! l'ensemble des cibles en cours. Une boucle périodique vide les files
//! dans les pools ; un seul vidage peut s'exécuter à la fois.
//!
//! ```text
//! requête ──enqueue──▶ file default ──tick──▶ pool default (WebP)
//!          └────────▶ file heavy   ──tick──▶ pool heavy   (AVIF)
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, Codec};
use crate::format::ImageFormat;
use crate::inflight::{InFlightGuard, InFlightSet};
use crate::paths::{ExtraParams, image_exists};
use crate::pool::WorkerPool;

/// Priorité des conversions déclenchées par une requête
pub const REQUEST_PRIORITY: i32 = 0;
/// Priorité des conversions déclenchées par le préchargement
pub const PREFETCH_PRIORITY: i32 = -1;

/// Réglages du pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Période de vidage des files
    pub tick: Duration,
    /// Workers du pool des formats légers
    pub default_jobs: usize,
    /// Workers du pool des formats lourds
    pub heavy_jobs: usize,
    /// File interne de chaque pool
    pub queue_capacity: usize,
    /// Attente maximale à l'arrêt
    pub shutdown_timeout: Duration,
    /// Durée de vie des entrées en cours
    pub inflight_ttl: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let cpus = num_cpus();
        Self {
            tick: Duration::from_secs(1),
            default_jobs: cpus,
            heavy_jobs: cpus,
            queue_capacity: 1000,
            shutdown_timeout: Duration::from_secs(15),
            inflight_ttl: crate::inflight::DEFAULT_INFLIGHT_TTL,
        }
    }
}

/// Nombre de CPU disponibles (1 si inconnu)
pub fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Classe de file d'une tâche
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    Default,
    Heavy,
}

impl QueueClass {
    pub fn of(format: ImageFormat) -> Self {
        if format.is_heavy() {
            QueueClass::Heavy
        } else {
            QueueClass::Default
        }
    }
}

/// Travail de conversion d'une source vers une ou plusieurs cibles
///
/// La tâche détient les entrées en cours de ses cibles : elles sont
/// libérées quand la tâche est terminée ou abandonnée.
#[derive(Debug)]
pub struct ConversionTask {
    pub source: PathBuf,
    pub targets: BTreeMap<ImageFormat, PathBuf>,
    pub quality: u8,
    pub params: ExtraParams,
    pub priority: i32,
    guards: Vec<InFlightGuard>,
}

impl ConversionTask {
    pub fn new(source: PathBuf, quality: u8, params: ExtraParams, priority: i32) -> Self {
        Self {
            source,
            targets: BTreeMap::new(),
            quality,
            params,
            priority,
            guards: Vec::new(),
        }
    }

    /// Ajoute une cible admise dans l'ensemble des cibles en cours
    pub fn push_target(&mut self, format: ImageFormat, guard: InFlightGuard) {
        self.targets.insert(format, guard.target().to_path_buf());
        self.guards.push(guard);
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// File de destination : lourde dès qu'une cible l'est
    pub fn class(&self) -> QueueClass {
        if self.targets.keys().any(|f| f.is_heavy()) {
            QueueClass::Heavy
        } else {
            QueueClass::Default
        }
    }

    /// Produit toutes les cibles absentes (appel bloquant)
    pub fn run(self, codec: &dyn Codec) {
        for (format, target) in &self.targets {
            if image_exists(target) {
                continue;
            }
            if let Err(e) = codec::produce(
                codec,
                &self.source,
                target,
                *format,
                self.quality,
                &self.params,
            ) {
                tracing::warn!(
                    "Conversion of {} to {} failed: {}",
                    self.source.display(),
                    format,
                    e
                );
            }
        }
        // Les guards sont libérés ici
    }
}

/// Élément de file : priorité décroissante, puis ordre d'arrivée
#[derive(Debug)]
struct Queued {
    seq: u64,
    task: ConversionTask,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bilan d'un cycle de vidage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tâches confiées aux pools
    pub submitted: usize,
    /// Tâches remises en file faute de place
    pub deferred: usize,
}

struct Lane {
    queue: Mutex<BinaryHeap<Queued>>,
    pool: WorkerPool,
}

impl Lane {
    fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::new()),
            pool: WorkerPool::new(name, workers, capacity),
        }
    }

    fn queue(&self) -> MutexGuard<'_, BinaryHeap<Queued>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drain(&self, codec: &Arc<dyn Codec>, report: &mut DrainReport) {
        // Instantané : ce qui arrive pendant le vidage attend le tick suivant
        let snapshot = std::mem::take(&mut *self.queue());
        let mut rejected = Vec::new();

        for queued in snapshot.into_sorted_vec().into_iter().rev() {
            match self.pool.try_reserve() {
                Some(slot) => {
                    let codec = Arc::clone(codec);
                    let task = queued.task;
                    slot.run(move || task.run(codec.as_ref()));
                    report.submitted += 1;
                }
                None => rejected.push(queued),
            }
        }

        if !rejected.is_empty() {
            report.deferred += rejected.len();
            self.queue().extend(rejected);
        }
    }
}

/// Remet le drapeau de vidage à zéro, même en cas de panique
struct BusyFlag<'a>(&'a AtomicBool);

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pipeline de conversions différées
pub struct CachePipeline {
    settings: PipelineSettings,
    codec: Arc<dyn Codec>,
    inflight: InFlightSet,
    default_lane: Lane,
    heavy_lane: Lane,
    seq: AtomicU64,
    draining: AtomicBool,
    accepting: AtomicBool,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for CachePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePipeline")
            .field("settings", &self.settings)
            .field("default_queue", &self.queue_len(QueueClass::Default))
            .field("heavy_queue", &self.queue_len(QueueClass::Heavy))
            .finish()
    }
}

impl CachePipeline {
    /// Construit le pipeline sans démarrer la boucle périodique
    pub fn new(settings: PipelineSettings, codec: Arc<dyn Codec>) -> Arc<Self> {
        tracing::info!(
            "Lazy pipeline: {} default workers, {} heavy workers, tick {:?}",
            settings.default_jobs.max(1),
            settings.heavy_jobs.max(1),
            settings.tick
        );
        Arc::new(Self {
            inflight: InFlightSet::new(settings.inflight_ttl),
            default_lane: Lane::new("default", settings.default_jobs, settings.queue_capacity),
            heavy_lane: Lane::new("heavy", settings.heavy_jobs, settings.queue_capacity),
            settings,
            codec,
            seq: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn inflight(&self) -> &InFlightSet {
        &self.inflight
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    fn lane(&self, class: QueueClass) -> &Lane {
        match class {
            QueueClass::Default => &self.default_lane,
            QueueClass::Heavy => &self.heavy_lane,
        }
    }

    /// Démarre la boucle de vidage périodique (sans effet si déjà démarrée)
    pub fn start(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let pipeline = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.settings.tick;

        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(pipeline) = pipeline.upgrade() else { break };
                        if let Some(report) = pipeline.drain() {
                            if report.submitted > 0 || report.deferred > 0 {
                                tracing::debug!("Drain: {:?}", report);
                            }
                        }
                    }
                }
            }
            tracing::debug!("Lazy pipeline ticker stopped");
        }));
    }

    /// Met une tâche en file ; refusée (et abandonnée) après l'arrêt
    pub fn enqueue(&self, task: ConversionTask) -> bool {
        if task.is_empty() {
            return false;
        }
        if !self.accepting.load(Ordering::Acquire) {
            tracing::debug!("Pipeline stopped, dropping task for {}", task.source.display());
            return false;
        }
        let class = task.class();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Queued {} -> {:?} ({:?}, priority {})",
            task.source.display(),
            task.targets.keys().collect::<Vec<_>>(),
            class,
            task.priority
        );
        self.lane(class).queue().push(Queued { seq, task });
        true
    }

    /// Vide les deux files dans leurs pools
    ///
    /// Retourne `None` si un autre vidage est déjà en cours.
    pub fn drain(&self) -> Option<DrainReport> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return None;
        }
        let _busy = BusyFlag(&self.draining);

        let mut report = DrainReport::default();
        self.default_lane.drain(&self.codec, &mut report);
        self.heavy_lane.drain(&self.codec, &mut report);
        Some(report)
    }

    /// Nombre de tâches en attente dans une file
    pub fn queue_len(&self, class: QueueClass) -> usize {
        self.lane(class).queue().len()
    }

    /// Nombre de travaux soumis à un pool et non terminés
    pub fn pool_outstanding(&self, class: QueueClass) -> usize {
        self.lane(class).pool.outstanding()
    }

    /// Arrête la boucle puis attend les pools, dans la limite du délai configuré
    ///
    /// Les tâches restées en file sont abandonnées. Retourne `true` si
    /// les deux pools ont terminé à temps.
    pub async fn shutdown(&self) -> bool {
        self.accepting.store(false, Ordering::Release);
        self.cancel.cancel();

        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                tracing::warn!("Lazy pipeline ticker ended abnormally: {}", e);
            }
        }

        let timeout = self.settings.shutdown_timeout;
        let (default_done, heavy_done) = tokio::join!(
            self.default_lane.pool.stop_and_wait(timeout),
            self.heavy_lane.pool.stop_and_wait(timeout)
        );

        let abandoned = self.default_lane.queue().drain().count()
            + self.heavy_lane.queue().drain().count();
        if abandoned > 0 {
            tracing::info!("Abandoned {} queued conversions at shutdown", abandoned);
        }

        tracing::info!("Lazy pipeline stopped");
        default_done && heavy_done
    }
}

impl Drop for CachePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inflight::Admission;

    struct NullCodec;

    impl Codec for NullCodec {
        fn encode(
            &self,
            _raw: &std::path::Path,
            _format: ImageFormat,
            _quality: u8,
            _params: &ExtraParams,
        ) -> anyhow::Result<Vec<u8>> {
            Ok(vec![0; 200])
        }
    }

    fn queued_task(pipeline: &CachePipeline, dir: &std::path::Path) -> ConversionTask {
        let target = dir.join("a.jpg.1.webp");
        let Admission::Acquired(guard) = pipeline.inflight().try_admit(&target) else {
            panic!("target already in flight");
        };
        let mut task = ConversionTask::new(
            dir.join("a.jpg"),
            80,
            ExtraParams::default(),
            REQUEST_PRIORITY,
        );
        task.push_target(ImageFormat::Webp, guard);
        task
    }

    #[tokio::test]
    async fn test_overlapping_drain_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = CachePipeline::new(PipelineSettings::default(), Arc::new(NullCodec));
        assert!(pipeline.enqueue(queued_task(&pipeline, dir.path())));

        // Un vidage est déjà en cours
        pipeline.draining.store(true, Ordering::Release);
        assert_eq!(pipeline.drain(), None);
        assert_eq!(pipeline.queue_len(QueueClass::Default), 1);

        pipeline.draining.store(false, Ordering::Release);
        let report = pipeline.drain().unwrap();
        assert_eq!(report.submitted, 1);
        assert_eq!(pipeline.queue_len(QueueClass::Default), 0);
        assert!(!pipeline.draining.load(Ordering::Acquire));

        assert!(pipeline.shutdown().await);
    }

    #[test]
    fn test_busy_flag_resets_on_panic() {
        let flag = AtomicBool::new(true);
        let result = std::panic::catch_unwind(|| {
            let _busy = BusyFlag(&flag);
            panic!("drain failed");
        });
        assert!(result.is_err());
        assert!(!flag.load(Ordering::Acquire));
    }
}
