//! Differentiable gradient-shaping operators with pluggable CPU and GPU kernels.
//!
//! ```
//! use gradops::ops::{OpRegistry, ParamMap};
//!
//! let registry = OpRegistry::with_builtins();
//! let params = ParamMap::from([("grad_scale".to_string(), "0.1".to_string())]);
//! let node = registry.create("GradReverse", &params).unwrap();
//! assert_eq!(node.list_arguments(), vec!["data"]);
//! ```

pub use core_types as types;
pub use execution;
pub use gradops_core as device;
pub use gradops_ops as ops;
pub use memory;
pub use tensor;

pub use core_types::{DataType, DeviceKind};
pub use execution::{ExecError, Inference, NodeExecutor};
pub use gradops_core::{Device, GpuContext};
pub use gradops_ops::{OpDescriptor, OpError, OpRegistry, ParamMap, TensorAny, WriteReq, register_builtin_ops};
pub use memory::MemoryManager;
pub use tensor::Tensor;
