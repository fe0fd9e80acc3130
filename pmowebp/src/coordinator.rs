//! Coordination des conversions
//!
//! Pour chaque cible absente, une seule exécution à la fois est autorisée.
//! En mode immédiat (« eager ») la conversion se fait pendant la requête ;
//! en mode différé (« lazy ») la cible est confiée au [`CachePipeline`] et
//! la requête repart aussitôt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{self, Codec};
use crate::format::ImageFormat;
use crate::inflight::{Admission, InFlightSet};
use crate::paths::{ExtraParams, image_exists};
use crate::pipeline::{CachePipeline, ConversionTask, QueueClass};

/// Coordinateur des conversions, partagé entre les requêtes
#[derive(Clone)]
pub struct Coordinator {
    codec: Arc<dyn Codec>,
    quality: u8,
    inflight: InFlightSet,
    pipeline: Option<Arc<CachePipeline>>,
}

impl Coordinator {
    /// Conversions synchrones
    pub fn eager(codec: Arc<dyn Codec>, quality: u8) -> Self {
        Self {
            codec,
            quality,
            inflight: InFlightSet::default(),
            pipeline: None,
        }
    }

    /// Conversions différées, confiées à `pipeline`
    ///
    /// Le codec et l'ensemble des cibles en cours sont ceux du pipeline.
    pub fn lazy(quality: u8, pipeline: Arc<CachePipeline>) -> Self {
        Self {
            codec: Arc::clone(pipeline.codec()),
            quality,
            inflight: pipeline.inflight().clone(),
            pipeline: Some(pipeline),
        }
    }

    pub fn is_lazy(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn pipeline(&self) -> Option<&Arc<CachePipeline>> {
        self.pipeline.as_ref()
    }

    pub fn inflight(&self) -> &InFlightSet {
        &self.inflight
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Assure que chaque cible existe ou est en cours de production
    ///
    /// Les échecs de conversion sont journalisés et jamais propagés :
    /// l'appelant sert simplement le meilleur fichier présent.
    pub async fn ensure(
        &self,
        raw: &Path,
        targets: &BTreeMap<ImageFormat, PathBuf>,
        params: &ExtraParams,
        priority: i32,
    ) {
        match &self.pipeline {
            Some(pipeline) => self.ensure_lazy(pipeline, raw, targets, params, priority),
            None => self.ensure_eager(raw, targets, params).await,
        }
    }

    async fn ensure_eager(
        &self,
        raw: &Path,
        targets: &BTreeMap<ImageFormat, PathBuf>,
        params: &ExtraParams,
    ) {
        let mut owned = Vec::new();
        let mut waiters = Vec::new();

        for (format, target) in targets {
            if image_exists(target) {
                continue;
            }
            match self.inflight.try_admit(target) {
                Admission::Acquired(guard) => owned.push((*format, guard)),
                Admission::Busy(waiter) => {
                    tracing::debug!("{} already in flight, waiting", target.display());
                    waiters.push(waiter);
                }
            }
        }

        if !owned.is_empty() {
            let codec = Arc::clone(&self.codec);
            let raw = raw.to_path_buf();
            let quality = self.quality;
            let params = *params;

            let result = tokio::task::spawn_blocking(move || {
                for (format, guard) in owned {
                    if let Err(e) =
                        codec::produce(codec.as_ref(), &raw, guard.target(), format, quality, &params)
                    {
                        tracing::warn!("Conversion of {} to {} failed: {}", raw.display(), format, e);
                    }
                    drop(guard);
                }
            })
            .await;

            if let Err(e) = result {
                tracing::error!("Conversion worker panicked: {}", e);
            }
        }

        for waiter in waiters {
            waiter.wait().await;
        }
    }

    fn ensure_lazy(
        &self,
        pipeline: &CachePipeline,
        raw: &Path,
        targets: &BTreeMap<ImageFormat, PathBuf>,
        params: &ExtraParams,
        priority: i32,
    ) {
        let mut light = ConversionTask::new(raw.to_path_buf(), self.quality, *params, priority);
        let mut heavy = ConversionTask::new(raw.to_path_buf(), self.quality, *params, priority);

        for (format, target) in targets {
            if image_exists(target) {
                continue;
            }
            // Déjà en file ou en cours : rien à faire
            if let Admission::Acquired(guard) = self.inflight.try_admit(target) {
                match QueueClass::of(*format) {
                    QueueClass::Default => light.push_target(*format, guard),
                    QueueClass::Heavy => heavy.push_target(*format, guard),
                }
            }
        }

        for task in [light, heavy] {
            if !task.is_empty() {
                pipeline.enqueue(task);
            }
        }
    }
}
