use anyhow::{Result, anyhow};
use core_types::{BufferId, DataType, DeviceKind, Element, ViewDescriptor};
use memory::MemoryManager;
use std::marker::PhantomData;

/// Ordered dimension sizes. An empty shape means "not known yet" during shape inference.
pub type Shape = Vec<usize>;

/// Lightweight handle: (BufferId, ViewDescriptor, device, dtype).
///
/// The handle never owns storage; the `MemoryManager` that allocated it does.
/// Cloning a handle aliases the same buffer.
pub struct Tensor<T: Element> {
    buffer_id: BufferId,
    device:    DeviceKind,
    view:      ViewDescriptor,
    dtype:     DataType,
    _marker:   PhantomData<T>,
}

impl<T: Element> Clone for Tensor<T> {
    fn clone(&self) -> Self {
        Self {
            buffer_id: self.buffer_id,
            device:    self.device,
            view:      self.view,
            dtype:     self.dtype,
            _marker:   PhantomData,
        }
    }
}

impl<T: Element> std::fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("buffer", &self.buffer_id)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape())
            .finish()
    }
}

fn view_for(shape: &[usize]) -> Result<ViewDescriptor> {
    ViewDescriptor::contiguous(shape, 0)
        .ok_or_else(|| anyhow!("shape {shape:?} does not fit a view descriptor"))
}

impl<T: Element> Tensor<T> {
    /* --------------------------------------------------------------------- */
    /* Constructors                                                          */
    /* --------------------------------------------------------------------- */

    /// Allocate a zero-filled tensor on the manager's device.
    pub fn empty(mgr: &MemoryManager, shape: &[usize]) -> Result<Self> {
        let view   = view_for(shape)?;
        let bytes  = view.numel() * T::DTYPE.size_in_bytes();
        let buf_id = mgr.allocate_raw(bytes)?;
        Ok(Self::from_parts(buf_id, mgr.device_kind(), view))
    }

    /// Construct a tensor by uploading a CPU slice to the manager's device.
    pub fn from_vec(mgr: &MemoryManager, data: &[T], shape: &[usize]) -> Result<Self> {
        let view = view_for(shape)?;
        if view.numel() != data.len() {
            return Err(anyhow!(
                "{} elements do not fill shape {shape:?}",
                data.len()
            ));
        }
        let buf_id = mgr.allocate_raw(data.len() * T::DTYPE.size_in_bytes())?;
        mgr.write_to_buffer(buf_id, data)?;
        Ok(Self::from_parts(buf_id, mgr.device_kind(), view))
    }

    /// Wrap an existing buffer. Used when a buffer is reused for another tensor.
    pub fn from_parts(buffer_id: BufferId, device: DeviceKind, view: ViewDescriptor) -> Self {
        Tensor {
            buffer_id,
            device,
            view,
            dtype: T::DTYPE,
            _marker: PhantomData,
        }
    }

    /// Download the tensor's elements into a `Vec<T>`.
    pub fn to_vec(&self, mgr: &MemoryManager) -> Result<Vec<T>> {
        let all: Vec<T> = mgr.download_raw(self.buffer_id)?;
        let start = self.view.offset as usize;
        let end = start + self.numel();
        all.get(start..end)
            .map(|s| s.to_vec())
            .ok_or_else(|| anyhow!("view {start}..{end} exceeds {}", self.buffer_id))
    }

    /* --------------------------------------------------------------------- */
    /* Accessors                                                             */
    /* --------------------------------------------------------------------- */

    /// The view descriptor (shape, strides, offset)
    pub fn view(&self) -> &ViewDescriptor {
        &self.view
    }

    pub fn shape(&self) -> Shape {
        self.view.dims()
    }

    pub fn numel(&self) -> usize {
        self.view.numel()
    }

    /// The internal BufferId
    pub fn buffer_id(&self) -> BufferId {
        self.buffer_id
    }

    /// The device this tensor lives on
    pub fn device(&self) -> DeviceKind {
        self.device
    }

    /// The tensor’s DataType
    pub fn dtype(&self) -> DataType {
        self.dtype
    }
}

/* ------------------------------------------------------------------------- */
/*                                     Tests                                 */
/* ------------------------------------------------------------------------- */
#[cfg(test)]
mod tests {
    use super::*;
    use core_types::MAX_DIMS;
    use gradops_core::Device;
    use pollster::block_on;

    #[test]
    fn test_empty_tensor_dtype_and_view() {
        let mm = MemoryManager::cpu();

        let shape = [2, 3, 4];
        let t: Tensor<f32> = Tensor::empty(&mm, &shape).unwrap();

        assert_eq!(t.dtype(), DataType::F32);

        // shape padded to MAX_DIMS
        let mut expect_shape = [0u32; MAX_DIMS];
        for i in 0..shape.len() {
            expect_shape[i] = shape[i] as u32;
        }
        assert_eq!(t.view().shape, expect_shape);

        let mut expect_strides = [0u32; MAX_DIMS];
        expect_strides[..3].copy_from_slice(&[12, 4, 1]);
        assert_eq!(t.view().strides, expect_strides);

        assert_eq!(t.device(), DeviceKind::Cpu);
        assert_eq!(t.to_vec(&mm).unwrap(), vec![0.0; 24]);
    }

    #[test]
    fn test_from_vec_and_to_vec_preserves_data_and_dtype() {
        let mm = MemoryManager::cpu();

        let data = vec![1u32, 2, 3, 4];
        let t = Tensor::from_vec(&mm, &data, &[2, 2]).unwrap();

        assert_eq!(t.to_vec(&mm).unwrap(), data);
        assert_eq!(t.dtype(), DataType::U32);
        assert_eq!(t.shape(), vec![2, 2]);
    }

    #[test]
    fn from_vec_rejects_wrong_element_count() {
        let mm = MemoryManager::cpu();
        assert!(Tensor::from_vec(&mm, &[1.0f32, 2.0, 3.0], &[2, 2]).is_err());
    }

    #[test]
    fn clones_alias_the_same_buffer() {
        let mm = MemoryManager::cpu();
        let t = Tensor::from_vec(&mm, &[1.0f32], &[1]).unwrap();
        assert_eq!(t.clone().buffer_id(), t.buffer_id());
    }

    #[test]
    fn gpu_tensor_roundtrip() {
        let Ok(device) = block_on(Device::default_gpu()) else {
            eprintln!("no gpu adapter, skipping");
            return;
        };
        let mm = MemoryManager::new(device);
        let t = Tensor::from_vec(&mm, &[1.0f32, 2.0, 3.0, 4.0], &[4]).unwrap();
        assert_eq!(t.device(), DeviceKind::Gpu);
        assert_eq!(t.to_vec(&mm).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }
}
