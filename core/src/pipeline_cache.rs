use std::{
    collections::HashMap,
    sync::Arc,
};
use parking_lot::Mutex;

use crate::types::{AbstractBindGroupLayout, AbstractComputePipeline};

/// Signature of a specialized pipeline: shader + binding counts
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct PipelineKey {
    pub(crate) src:   Arc<str>,
    pub(crate) ent:   Arc<str>,
    pub(crate) n_in:  usize,
    pub(crate) n_out: usize,
}

#[derive(Clone)]
pub struct PipelineBundle {
    pub pipeline: Arc<AbstractComputePipeline>,
    pub layout:   Arc<AbstractBindGroupLayout>,
}

/// Compiled pipelines, shared by every kernel bound to one `GpuContext`.
#[derive(Default)]
pub(crate) struct PipelineCache {
    cache: Mutex<HashMap<PipelineKey, PipelineBundle>>,
}

impl PipelineCache {
    pub(crate) fn get(&self, key: &PipelineKey) -> Option<PipelineBundle> {
        self.cache.lock().get(key).cloned()
    }

    pub(crate) fn insert(&self, key: PipelineKey, bundle: PipelineBundle) {
        self.cache.lock().insert(key, bundle);
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.lock().len()
    }
}
