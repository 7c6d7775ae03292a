pub mod types;
mod device;
mod pipeline_cache;

use anyhow::{bail, Result};
use std::sync::Arc;
use wgpu::{
    util::DeviceExt, BindGroupLayoutDescriptor, BindGroupLayoutEntry, ShaderStages,
    CommandEncoder, CommandEncoderDescriptor, Device as WgpuDevice, Instance, PollType, ComputePipelineDescriptor,
    PipelineLayoutDescriptor, Queue, ShaderModule, ShaderModuleDescriptor, ShaderSource,
    PipelineCompilationOptions, BindGroup, BindGroupEntry, BindGroupDescriptor, ComputePassDescriptor,
};

pub use device::Device;
pub use pipeline_cache::PipelineBundle;
use pipeline_cache::{PipelineCache, PipelineKey};
use types::{AbstractBuffer, AbstractBindGroupLayout, AbstractComputePipeline, BufferKind};

/// Context for GPU operations
#[derive(Clone)]
pub struct GpuContext {
    pub device: Arc<WgpuDevice>,
    pub queue:  Arc<Queue>,
    pipelines:  Arc<PipelineCache>,
}

impl GpuContext {
    /* ------------------------------------------------------------------ */
    /* Construction                                                       */
    /* ------------------------------------------------------------------ */
    pub async fn new() -> Result<Self> {
        let instance = Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .map_err(|e| anyhow::anyhow!("No suitable adapter found: {}", e))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor::default())
            .await?;

        tracing::debug!(adapter = ?adapter.get_info().name, "created gpu context");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            pipelines: Arc::new(PipelineCache::default()),
        })
    }

    /* ------------------------------------------------------------------ */
    /* Buffers                                                            */
    /* ------------------------------------------------------------------ */

    /// Allocate an uninitialised GPU buffer.
    pub fn create_buffer(&self, size: u64, usage: BufferKind) -> AbstractBuffer {
        AbstractBuffer(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size,
            usage: usage.into(),
            mapped_at_creation: false,
        }))
    }

    /// Allocate and initialise a GPU buffer from host data.
    pub fn create_buffer_with_data(&self, data: &[u8], usage: BufferKind) -> AbstractBuffer {
        AbstractBuffer(self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: None,
            contents: data,
            usage: usage.into(),
        }))
    }

    /// Blocking write: map-write, copy `data`, unmap.
    pub fn write_buffer(&self, buffer: &AbstractBuffer, data: &[u8]) -> Result<()> {
        let wgpu_buffer = buffer.raw();
        let slice = wgpu_buffer.slice(..data.len() as u64);
        slice.map_async(wgpu::MapMode::Write, |_| ());
        self.device_poll(PollType::Wait)?;
        slice.get_mapped_range_mut().copy_from_slice(data);
        wgpu_buffer.unmap();
        Ok(())
    }

    /// Blocking read: map-read entire buffer, return Vec<u8>.
    pub fn read_buffer(&self, buffer: &AbstractBuffer) -> Result<Vec<u8>> {
        let wgpu_buffer = buffer.raw();
        let slice = wgpu_buffer.slice(..);
        slice.map_async(wgpu::MapMode::Read, |_| ());
        self.device_poll(PollType::Wait)?;
        let data = slice.get_mapped_range().to_vec();
        wgpu_buffer.unmap();
        Ok(data)
    }

    /* ------------------------------------------------------------------ */
    /* Encoder helpers                                                    */
    /* ------------------------------------------------------------------ */
    fn create_encoder(&self, label: &str) -> CommandEncoder {
        self.device
            .create_command_encoder(&CommandEncoderDescriptor { label: Some(label) })
    }

    fn submit_encoder(&self, encoder: CommandEncoder) {
        self.queue.submit(Some(encoder.finish()));
    }

    pub fn copy_buffer_to_buffer(&self, src: &AbstractBuffer, dst: &AbstractBuffer, size: u64) {
        let mut enc = self.create_encoder("copy-b2b");
        enc.copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, size);
        self.submit_encoder(enc);
    }

    /* ------------------------------------------------------------------ */
    /* Shaders Preprocessing                                              */
    /* ------------------------------------------------------------------ */

    /// Create a storage buffer layout for a compute shader.
    ///
    /// Bindings `0..n_in` are read-only, `n_in..n_in + n_out` are read-write.
    pub fn create_storage_layout(&self, n_in: usize, n_out: usize) -> Arc<AbstractBindGroupLayout> {
        let entries: Vec<BindGroupLayoutEntry> = (0..n_in + n_out)
            .map(|i| BindGroupLayoutEntry {
                binding: i as u32,
                visibility: ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: i < n_in },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let bgl = self.device.create_bind_group_layout(&BindGroupLayoutDescriptor {
            label: Some("storage-layout"),
            entries: &entries,
        });
        Arc::new(AbstractBindGroupLayout(bgl))
    }

    /// Create a compute pipeline from WGSL source code.
    pub fn create_compute_pipeline(
        &self,
        src: &str,
        entry: &str,
        layout: &AbstractBindGroupLayout,
    ) -> Arc<AbstractComputePipeline> {
        let module: ShaderModule = self.device.create_shader_module(ShaderModuleDescriptor {
            label: Some("wgsl-module"),
            source: ShaderSource::Wgsl(src.into()),
        });
        let pipeline_layout = self.device.create_pipeline_layout(&PipelineLayoutDescriptor {
            label: Some("compute-pl-layout"),
            bind_group_layouts: &[&layout.0],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some("compute-pipeline"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(entry),
            compilation_options: PipelineCompilationOptions::default(),
            cache: None,
        });
        Arc::new(AbstractComputePipeline(pipeline))
    }

    /// Cached layout + pipeline for `src`/`entry` with the given binding counts.
    pub fn pipeline(&self, src: &str, entry: &str, n_in: usize, n_out: usize) -> PipelineBundle {
        let key = PipelineKey {
            src: Arc::from(src),
            ent: Arc::from(entry),
            n_in,
            n_out,
        };
        if let Some(bundle) = self.pipelines.get(&key) {
            return bundle;
        }

        let layout = self.create_storage_layout(n_in, n_out);
        let pipeline = self.create_compute_pipeline(src, entry, &layout);
        let bundle = PipelineBundle { pipeline, layout };
        self.pipelines.insert(key, bundle.clone());
        tracing::debug!(entry, cached = self.pipelines.len(), "compiled compute pipeline");
        bundle
    }

    /* ------------------------------------------------------------------ */
    /* Dispatch                                                           */
    /* ------------------------------------------------------------------ */

    fn create_storage_bind_group(
        &self,
        layout: &AbstractBindGroupLayout,
        inputs: &[&AbstractBuffer],
        outputs: &[&AbstractBuffer],
    ) -> BindGroup {
        let entries: Vec<BindGroupEntry> = inputs
            .iter()
            .chain(outputs.iter())
            .enumerate()
            .map(|(i, b)| BindGroupEntry {
                binding: i as u32,
                resource: b.0.as_entire_binding(),
            })
            .collect();
        self.device.create_bind_group(&BindGroupDescriptor {
            label: Some("storage-bg"),
            layout: &layout.0,
            entries: &entries,
        })
    }

    pub fn dispatch_compute_1d(
        &self,
        bundle: &PipelineBundle,
        inputs: &[&AbstractBuffer],
        outputs: &[&AbstractBuffer],
        total_elems: u32,
        workgroup_size: u32,
    ) -> Result<()> {
        let (x, _, _) = self.dispatch_size_1d(total_elems, workgroup_size);
        let max = self.device.limits().max_compute_workgroups_per_dimension;
        if x > max {
            bail!("dispatch of {total_elems} elements needs {x} workgroups, device limit is {max}");
        }

        let bg = self.create_storage_bind_group(&bundle.layout, inputs, outputs);
        let mut enc = self.create_encoder("dispatch-1d");
        {
            let mut pass = enc.begin_compute_pass(&ComputePassDescriptor::default());
            pass.set_pipeline(&bundle.pipeline.0);
            pass.set_bind_group(0, &bg, &[]);
            pass.dispatch_workgroups(x, 1, 1);
        }
        self.submit_encoder(enc);
        Ok(())
    }

    /* ------------------------------------------------------------------ */
    /* Misc utils                                                         */
    /* ------------------------------------------------------------------ */

    /// Block until GPU idle / or PollType::Poll for non-blocking.
    fn device_poll(&self, mode: PollType) -> Result<()> {
        self.device
            .poll(mode)
            .map_err(|e| anyhow::anyhow!("device poll failed: {e}"))?;
        Ok(())
    }

    /// Helper: compute `(x,1,1)` for 1-D dispatch with `workgroup_size`.
    pub fn dispatch_size_1d(&self, total: u32, workgroup_size: u32) -> (u32, u32, u32) {
        (total.div_ceil(workgroup_size), 1, 1)
    }
}
