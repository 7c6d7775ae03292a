pub mod op;
pub mod param;
pub mod types;
pub mod builtin;
pub mod elementwise;

use std::collections::HashMap;

pub use op::{ArgInfo, Kernel, KernelCtor, KernelTable, OpContext, OpDescriptor, RegistrationInfo};
pub use param::{FieldInfo, OpParam};
pub use types::{OpError, ParamMap, TensorAny, TensorId, WriteReq};

use builtin::{GradReverseProp, GradScaleProp};

/// Builds a descriptor from its string parameters
pub type OpConstructor = fn(&ParamMap) -> Result<Box<dyn OpDescriptor>, OpError>;

/// Everything the registry knows about one operator type
#[derive(Clone)]
pub struct OpInfo {
    pub name:        &'static str,
    pub description: &'static str,
    pub arguments:   &'static [ArgInfo],
    pub params:      &'static [FieldInfo],
    construct:       OpConstructor,
}

impl OpInfo {
    pub fn create(&self, kwargs: &ParamMap) -> Result<Box<dyn OpDescriptor>, OpError> {
        (self.construct)(kwargs)
    }
}

fn construct<D: RegistrationInfo>(kwargs: &ParamMap) -> Result<Box<dyn OpDescriptor>, OpError> {
    let param = <D::Param as OpParam>::init(D::NAME, kwargs)?;
    Ok(Box::new(D::from_param(param)))
}

/// Operators by name. Populated through explicit `register` calls.
#[derive(Default)]
pub struct OpRegistry {
    map: HashMap<&'static str, OpInfo>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    /// Registry holding every builtin operator
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        register_builtin_ops(&mut reg);
        reg
    }

    /// Register an operator type under its `NAME`, replacing any previous entry
    pub fn register<D: RegistrationInfo>(&mut self) {
        let info = OpInfo {
            name:        D::NAME,
            description: D::DESCRIPTION,
            arguments:   D::ARGUMENTS,
            params:      <D::Param as OpParam>::FIELDS,
            construct:   construct::<D>,
        };
        if self.map.insert(D::NAME, info).is_some() {
            tracing::warn!(op = D::NAME, "operator registered twice, keeping the latest");
        } else {
            tracing::debug!(op = D::NAME, "registered operator");
        }
    }

    /// Lookup + parse parameters + build the descriptor in one call
    pub fn create(&self, name: &str, kwargs: &ParamMap) -> Result<Box<dyn OpDescriptor>, OpError> {
        self.get(name)
            .ok_or_else(|| OpError::UnknownOp(name.to_string()))?
            .create(kwargs)
    }

    /// Validate tensor list lengths against the operator's declared arity
    pub fn check_arity(&self, name: &str, num_inputs: usize, num_outputs: usize) -> Result<(), OpError> {
        let info = self.get(name).ok_or_else(|| OpError::UnknownOp(name.to_string()))?;
        types::check_count(info.name, "inputs", info.arguments.len(), num_inputs)?;
        types::check_count(info.name, "outputs", 1, num_outputs)
    }

    /// lookup sans construction
    pub fn get(&self, name: &str) -> Option<&OpInfo> {
        self.map.get(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.map.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

/// Register `GradReverse` and `GradScale`
pub fn register_builtin_ops(reg: &mut OpRegistry) {
    reg.register::<GradReverseProp>();
    reg.register::<GradScaleProp>();
}
