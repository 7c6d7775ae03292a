use std::collections::HashMap;

use core_types::{DataType, DeviceKind};
use gradops_core::Device;
use memory::MemoryManager;
use tensor::Shape;

use crate::param::OpParam;
use crate::types::{OpError, ParamMap, TensorAny, TensorId, WriteReq};

/// Per-call context: the memory that owns every tensor handed to the kernel.
#[derive(Clone, Copy)]
pub struct OpContext<'a> {
    pub mem: &'a MemoryManager,
}

impl<'a> OpContext<'a> {
    pub fn new(mem: &'a MemoryManager) -> Self {
        Self { mem }
    }

    pub fn device(&self) -> &Device {
        self.mem.device()
    }
}

/// Executes the forward and backward computation of one operator on one device.
///
/// Calls are synchronous. Outputs may share storage with the inputs their
/// descriptor offered for in-place reuse; implementations must give the same
/// result either way.
pub trait Kernel: Send {
    fn forward(
        &self,
        ctx:     &OpContext<'_>,
        in_data: &[TensorAny],
        req:     &[WriteReq],
        out_data: &[TensorAny],
    ) -> Result<(), OpError>;

    fn backward(
        &self,
        ctx:      &OpContext<'_>,
        out_grad: &[TensorAny],
        in_data:  &[TensorAny],
        out_data: &[TensorAny],
        req:      &[WriteReq],
        in_grad:  &[TensorAny],
    ) -> Result<(), OpError>;
}

/// Declarative side of an operator: arguments, inference rules, memory hints
/// and the kernel factory. One instance per graph node.
pub trait OpDescriptor: Send + Sync {
    /// Name the operator is registered under
    fn type_name(&self) -> &'static str;

    /// Input names; callers order tensors accordingly
    fn list_arguments(&self) -> Vec<&'static str>;

    fn list_outputs(&self) -> Vec<&'static str> {
        vec!["output"]
    }

    /// Current configuration in string form
    fn params(&self) -> ParamMap;

    /// Output shapes from input shapes. `IncompleteShape` means "retry later".
    fn infer_shape(&self, in_shapes: &[Shape]) -> Result<Vec<Shape>, OpError>;

    fn infer_type(&self, in_types: &[DataType]) -> Result<Vec<DataType>, OpError>;

    /// Forward-time tensors the backward pass reads; everything else may be freed after forward.
    ///
    /// Id lists are laid out like `list_arguments` / `list_outputs`. A slot
    /// missing from a shorter list is left out of the result.
    fn declare_backward_dependency(
        &self,
        out_grad: &[TensorId],
        in_data:  &[TensorId],
        out_data: &[TensorId],
    ) -> Vec<TensorId>;

    /// `(source, destination)` pairs whose storage may be shared during forward
    fn forward_inplace_option(&self, in_data: &[TensorId], out_data: &[TensorId]) -> Vec<(TensorId, TensorId)>;

    /// `(source, destination)` pairs whose storage may be shared during backward
    fn backward_inplace_option(
        &self,
        out_grad: &[TensorId],
        in_data:  &[TensorId],
        out_data: &[TensorId],
        in_grad:  &[TensorId],
    ) -> Vec<(TensorId, TensorId)>;

    fn create_kernel(&self, device: &Device) -> Result<Box<dyn Kernel>, OpError>;

    /// Independent copy, including its own configuration
    fn box_clone(&self) -> Box<dyn OpDescriptor>;
}

impl Clone for Box<dyn OpDescriptor> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Docstring of one tensor argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgInfo {
    pub name:        &'static str,
    pub type_info:   &'static str,
    pub description: &'static str,
}

/// Static registration data for an operator type
pub trait RegistrationInfo: OpDescriptor + Sized + 'static {
    /// Unique name for the operation
    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const ARGUMENTS: &'static [ArgInfo];

    type Param: OpParam;

    fn from_param(param: Self::Param) -> Self;
}

/// Constructs a kernel for one device kind
pub type KernelCtor<P> = fn(&P, &Device) -> Result<Box<dyn Kernel>, OpError>;

/// Kernel constructors of one operator, indexed by device kind.
#[derive(Clone)]
pub struct KernelTable<P> {
    op:    &'static str,
    ctors: HashMap<DeviceKind, KernelCtor<P>>,
}

impl<P> KernelTable<P> {
    pub fn new(op: &'static str) -> Self {
        Self { op, ctors: HashMap::new() }
    }

    pub fn with(mut self, kind: DeviceKind, ctor: KernelCtor<P>) -> Self {
        self.register(kind, ctor);
        self
    }

    /// Add or replace the constructor for `kind`
    pub fn register(&mut self, kind: DeviceKind, ctor: KernelCtor<P>) {
        if self.ctors.insert(kind, ctor).is_some() {
            tracing::debug!(op = self.op, device = %kind, "replaced kernel constructor");
        }
    }

    pub fn devices(&self) -> Vec<DeviceKind> {
        let mut kinds: Vec<_> = self.ctors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    pub fn create(&self, param: &P, device: &Device) -> Result<Box<dyn Kernel>, OpError> {
        let kind = device.kind();
        let ctor = self.ctors.get(&kind).ok_or(OpError::UnsupportedDevice { op: self.op, device: kind })?;
        tracing::debug!(op = self.op, device = %kind, "creating kernel");
        ctor(param, device)
    }
}
