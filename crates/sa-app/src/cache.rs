use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use sa_core::Fingerprint;

struct Slot<P> {
    fingerprint: Fingerprint,
    pipeline: Arc<Mutex<P>>,
}

/// Holds at most one loaded pipeline.
///
/// Loading is expensive, so consecutive requests with the same fingerprint
/// reuse the resident instance. On a fingerprint change the old pipeline is
/// released before the loader runs, so two pipelines are never resident at
/// once through the cache.
///
/// Access is serialized through `&mut self`; the generation worker is the
/// only owner.
pub struct PipelineCache<P> {
    slot: Option<Slot<P>>,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self { slot: None }
    }
}

impl<P> PipelineCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.slot.as_ref().map(|slot| &slot.fingerprint)
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.is_some()
    }

    /// Return the resident pipeline if it matches `fingerprint`, otherwise
    /// swap in the one built by `loader`. A failed load leaves the cache
    /// empty.
    pub fn get_or_load<E>(
        &mut self,
        fingerprint: &Fingerprint,
        loader: impl FnOnce(&Fingerprint) -> Result<P, E>,
    ) -> Result<Arc<Mutex<P>>, E> {
        if let Some(slot) = &self.slot {
            if slot.fingerprint == *fingerprint {
                debug!(%fingerprint, "Pipeline cache hit");
                return Ok(slot.pipeline.clone());
            }
        }

        if let Some(old) = self.slot.take() {
            info!(old = %old.fingerprint, new = %fingerprint, "Releasing cached pipeline");
            drop(old);
        }

        info!(%fingerprint, "Loading pipeline");
        let pipeline = Arc::new(Mutex::new(loader(fingerprint)?));
        self.slot = Some(Slot {
            fingerprint: fingerprint.clone(),
            pipeline: pipeline.clone(),
        });

        Ok(pipeline)
    }

    /// Drop the resident pipeline
    pub fn clear(&mut self) {
        if let Some(old) = self.slot.take() {
            debug!(fingerprint = %old.fingerprint, "Pipeline cache cleared");
        }
    }
}
