mod pool;

use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use bytemuck::{Pod, Zeroable, cast_slice, cast_slice_mut};
use core_types::{BufferId, DeviceKind};
use gradops_core::types::{AbstractBuffer, BufferHandle, BufferKind, HostWords};
use gradops_core::{Device, GpuContext};
use parking_lot::RwLock;
use pool::BufferPool;

/// Host buffer handle. Kernels take one write lock per destination and read
/// locks on the remaining distinct sources.
pub type HostBuffer = Arc<RwLock<HostWords>>;

const WORD: usize = std::mem::size_of::<u32>();

enum Backing {
    Host {
        main: BufferPool<RwLock<HostWords>>,
    },
    /// Three buffer pools on **one** GPU device:
    /// - `main`             : STORAGE buffers that hold tensor data
    /// - `staging_upload`   : MAP_WRITE + COPY_SRC  (CPU → GPU)
    /// - `staging_download` : MAP_READ  + COPY_DST  (GPU → CPU)
    Gpu {
        ctx:              GpuContext,
        main:             BufferPool<AbstractBuffer>,
        staging_upload:   BufferPool<AbstractBuffer>,
        staging_download: BufferPool<AbstractBuffer>,
    },
}

/// Owns every tensor buffer of one device.
pub struct MemoryManager {
    device:  Device,
    backing: Backing,
}

impl MemoryManager {
    pub fn new(device: Device) -> Self {
        let backing = match &device {
            Device::Cpu => Backing::Host { main: BufferPool::new("host") },
            Device::Gpu(ctx) => Backing::Gpu {
                ctx:              ctx.clone(),
                main:             BufferPool::new("gpu-main"),
                staging_upload:   BufferPool::new("gpu-upload"),
                staging_download: BufferPool::new("gpu-download"),
            },
        };
        Self { device, backing }
    }

    /// Host-memory manager
    pub fn cpu() -> Self {
        Self::new(Device::Cpu)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn device_kind(&self) -> DeviceKind {
        self.device.kind()
    }

    /// Raw allocation, zero-initialised on the host.
    pub fn allocate_raw(&self, size_bytes: usize) -> Result<BufferId> {
        // buffers are whole 32-bit words, never empty
        let words = size_bytes.div_ceil(WORD).max(1);
        let id = match &self.backing {
            Backing::Host { main } => main.insert(RwLock::new(vec![0; words]), size_bytes).0,
            Backing::Gpu { ctx, main, .. } => {
                let raw = ctx.create_buffer((words * WORD) as u64, BufferKind::Main);
                main.insert(raw, size_bytes).0
            }
        };
        Ok(id)
    }

    /// Raw deallocation. Returns whether the id was live.
    pub fn release(&self, id: BufferId) -> bool {
        match &self.backing {
            Backing::Host { main } => main.release_buffer(id),
            Backing::Gpu { main, .. } => main.release_buffer(id),
        }
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.size_of(id).is_some()
    }

    /// Requested size in bytes of a live buffer
    pub fn size_of(&self, id: BufferId) -> Option<usize> {
        match &self.backing {
            Backing::Host { main } => main.get_buffer_size(id),
            Backing::Gpu { main, .. } => main.get_buffer_size(id),
        }
    }

    /// Number of live tensor buffers
    pub fn live_buffers(&self) -> usize {
        match &self.backing {
            Backing::Host { main } => main.len(),
            Backing::Gpu { main, .. } => main.len(),
        }
    }

    /// Raw upload: CPU → device, starting at the first byte of the buffer.
    pub fn write_to_buffer<T: Pod>(&self, dest_id: BufferId, data: &[T]) -> Result<()> {
        let bytes: &[u8] = cast_slice(data);
        let capacity = self.size_of(dest_id).ok_or_else(|| anyhow!("missing buffer: {dest_id}"))?;
        if bytes.len() > capacity {
            bail!("write of {} bytes overflows {dest_id} ({capacity} bytes)", bytes.len());
        }

        match &self.backing {
            Backing::Host { main } => {
                let buf = main.get(dest_id).ok_or_else(|| anyhow!("missing buffer: {dest_id}"))?;
                let mut words = buf.write();
                let dst: &mut [u8] = cast_slice_mut(&mut words[..]);
                dst[..bytes.len()].copy_from_slice(bytes);
            }
            Backing::Gpu { ctx, main, staging_upload, .. } => {
                if bytes.is_empty() {
                    return Ok(());
                }
                // pad to whole words, copies must be 4-byte aligned
                let mut padded = bytes.to_vec();
                padded.resize(bytes.len().div_ceil(WORD) * WORD, 0);

                let dst = main.get(dest_id).ok_or_else(|| anyhow!("missing buffer: {dest_id}"))?;

                // 1) staging_upload: write via GpuContext
                let raw = ctx.create_buffer(padded.len() as u64, BufferKind::Upload);
                let (sid, src) = staging_upload.insert(raw, padded.len());
                let written = ctx.write_buffer(&src, &padded);

                // 2) copy staging_upload → main[dest_id]
                if written.is_ok() {
                    ctx.copy_buffer_to_buffer(&src, &dst, padded.len() as u64);
                }

                // 3) cleanup staging
                staging_upload.release_buffer(sid);
                written?;
            }
        }
        Ok(())
    }

    /// Raw download: device → CPU into a `Vec<T>` covering the requested size of the buffer
    pub fn download_raw<T: Pod>(&self, id: BufferId) -> Result<Vec<T>> {
        let size = self.size_of(id).ok_or_else(|| anyhow!("missing buffer: {id}"))?;
        let count = size / std::mem::size_of::<T>().max(1);

        let bytes: Vec<u8> = match &self.backing {
            Backing::Host { main } => {
                let buf = main.get(id).ok_or_else(|| anyhow!("missing buffer: {id}"))?;
                let words = buf.read();
                cast_slice::<u32, u8>(&words[..]).to_vec()
            }
            Backing::Gpu { ctx, main, staging_download, .. } => {
                // 1) Copy main → staging_download
                let src = main.get(id).ok_or_else(|| anyhow!("missing buffer: {id}"))?;
                let raw = ctx.create_buffer(src.size(), BufferKind::Download);
                let (sid, dst) = staging_download.insert(raw, src.size() as usize);
                ctx.copy_buffer_to_buffer(&src, &dst, src.size());

                // 2) read entire staging buffer via GpuContext
                let bytes = ctx.read_buffer(&dst);

                // 3) cleanup staging
                staging_download.release_buffer(sid);
                bytes?
            }
        };

        let mut out = vec![<T as Zeroable>::zeroed(); count];
        let out_bytes: &mut [u8] = cast_slice_mut(&mut out[..]);
        let n = out_bytes.len();
        out_bytes.copy_from_slice(&bytes[..n]);
        Ok(out)
    }

    #[cfg(test)]
    fn staging_buffers(&self) -> usize {
        match &self.backing {
            Backing::Gpu { staging_upload, staging_download, .. } => staging_upload.len() + staging_download.len(),
            Backing::Host { .. } => 0,
        }
    }

    /// Host storage behind `id`, when this manager lives on the CPU.
    pub fn host_buffer(&self, id: BufferId) -> Option<HostBuffer> {
        match &self.backing {
            Backing::Host { main } => main.get(id),
            Backing::Gpu { .. } => None,
        }
    }

    /// Device storage behind `id`, when this manager lives on a GPU.
    pub fn gpu_buffer(&self, id: BufferId) -> Option<BufferHandle> {
        match &self.backing {
            Backing::Gpu { main, .. } => main.get(id),
            Backing::Host { .. } => None,
        }
    }
}
