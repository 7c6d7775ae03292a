use std::fmt;

use anyhow::Result;
use core_types::DeviceKind;

use crate::GpuContext;

/// Execution context handed to kernels: which device they run on, plus the
/// handles needed to submit work there.
#[derive(Clone)]
pub enum Device {
    Cpu,
    Gpu(GpuContext),
}

impl Device {
    /// Open the default GPU adapter.
    pub async fn default_gpu() -> Result<Self> {
        Ok(Device::Gpu(GpuContext::new().await?))
    }

    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Cpu => DeviceKind::Cpu,
            Device::Gpu(_) => DeviceKind::Gpu,
        }
    }

    pub fn gpu(&self) -> Option<&GpuContext> {
        match self {
            Device::Gpu(ctx) => Some(ctx),
            Device::Cpu => None,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.kind())
    }
}
