use bytemuck::{Pod, Zeroable};
use std::fmt;

include!("generated_data_types.rs");

/// Type alias for a buffer identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);
impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferId({})", self.0)
    }
}

/// Kind of device a buffer or kernel lives on.
///
/// Kernel constructors are looked up by this tag, so adding a backend means
/// adding a variant here and registering constructors for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => f.write_str("cpu"),
            DeviceKind::Gpu => f.write_str("gpu"),
        }
    }
}

/// Maximum number of dimensions for a view descriptor
pub const MAX_DIMS: usize = 8;

/// Descriptor for a view into a buffer.
///
/// `offset` and `strides` are counted in elements, not bytes.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq, Eq)]
pub struct ViewDescriptor {
    pub offset:  u32,
    pub ndim:    u32,
    pub shape:   [u32; MAX_DIMS],
    pub strides: [u32; MAX_DIMS],
}

impl ViewDescriptor {
    /// Row-major contiguous view of `shape`, starting at `offset`.
    ///
    /// Returns `None` when `shape` has more than [`MAX_DIMS`] dimensions or a
    /// dimension does not fit in `u32`.
    pub fn contiguous(shape: &[usize], offset: u32) -> Option<Self> {
        if shape.len() > MAX_DIMS {
            return None;
        }
        let mut vd = ViewDescriptor::zeroed();
        vd.offset = offset;
        vd.ndim = shape.len() as u32;
        let mut stride: u32 = 1;
        for i in (0..shape.len()).rev() {
            vd.shape[i] = u32::try_from(shape[i]).ok()?;
            vd.strides[i] = stride;
            stride = stride.checked_mul(vd.shape[i].max(1))?;
        }
        Some(vd)
    }

    /// The active dimensions, as `usize`
    pub fn dims(&self) -> Vec<usize> {
        self.shape[..self.ndim as usize].iter().map(|&d| d as usize).collect()
    }

    /// Number of elements covered by the view
    pub fn numel(&self) -> usize {
        self.shape[..self.ndim as usize].iter().map(|&d| d as usize).product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_view_has_row_major_strides() {
        let vd = ViewDescriptor::contiguous(&[2, 3, 4], 0).unwrap();
        assert_eq!(vd.ndim, 3);
        assert_eq!(&vd.strides[..3], &[12, 4, 1]);
        assert_eq!(vd.dims(), vec![2, 3, 4]);
        assert_eq!(vd.numel(), 24);
    }

    #[test]
    fn too_many_dims_is_rejected() {
        let shape = [1usize; MAX_DIMS + 1];
        assert!(ViewDescriptor::contiguous(&shape, 0).is_none());
    }

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(<f32 as Element>::DTYPE, DataType::F32);
        assert_eq!(<u32 as Element>::DTYPE.size_in_bytes(), 4);
    }
}
