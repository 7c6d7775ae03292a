use std::sync::Arc;
use wgpu::{Buffer, BufferUsages, BindGroupLayout, ComputePipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Main,
    Upload,
    Download,
}
impl From<BufferKind> for BufferUsages {
    fn from(kind: BufferKind) -> Self {
        match kind {
            BufferKind::Main => BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
            BufferKind::Upload => BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC,
            BufferKind::Download => BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct AbstractBuffer(pub(crate) Buffer);
impl AbstractBuffer {
    pub(crate) fn raw(&self) -> &wgpu::Buffer {
        &self.0
    }

    pub fn size(&self) -> u64 {
        self.0.size()
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct AbstractBindGroupLayout(pub(crate) BindGroupLayout);

#[derive(Debug, Eq, PartialEq)]
pub struct AbstractComputePipeline(pub(crate) ComputePipeline);

/// Shared handle to a device buffer held by a pool
pub type BufferHandle = Arc<AbstractBuffer>;

/// Host-side storage: 32-bit words, reinterpreted as the element type on access.
pub type HostWords = Vec<u32>;
