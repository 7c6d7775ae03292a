//! Host-side driver for a single operator node.
//!
//! `NodeExecutor` walks a descriptor through the lifecycle a graph executor
//! would: shape inference (with retry while upstream shapes are unknown),
//! output allocation honoring in-place hints, forward, retention of the
//! tensors named by the backward dependency declaration, and backward.

use std::collections::HashSet;
use std::ops::RangeFrom;

use core_types::{BufferId, DataType};
use gradops_ops::{Kernel, OpContext, OpDescriptor, OpError, TensorAny, TensorId, WriteReq};
use memory::MemoryManager;
use tensor::{Shape, Tensor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Op(#[from] OpError),

    #[error("{op}: backward called without a preceding forward")]
    NoForward { op: &'static str },

    #[error(transparent)]
    Memory(#[from] anyhow::Error),
}

/// Outcome of shape inference
#[derive(Debug)]
pub enum Inference {
    Ready(Vec<Shape>),
    /// An input shape is still unknown; retry once upstream nodes resolve it
    Pending(OpError),
}

/// Positions of one node's tensors in the id space handed to the descriptor:
/// inputs, then outputs, then output gradients, then input gradients.
struct Slots {
    in_data:  Vec<TensorId>,
    out_data: Vec<TensorId>,
    out_grad: Vec<TensorId>,
    in_grad:  Vec<TensorId>,
}

impl Slots {
    fn new(n_in: usize, n_out: usize) -> Self {
        let mut next: RangeFrom<TensorId> = 0..;
        let mut take = |n: usize| next.by_ref().take(n).collect::<Vec<_>>();
        Self {
            in_data:  take(n_in),
            out_data: take(n_out),
            out_grad: take(n_out),
            in_grad:  take(n_in),
        }
    }
}

/// Forward state kept alive for backward
struct Saved {
    in_data:  Vec<TensorAny>,
    out_data: Vec<TensorAny>,
    /// Executor-owned buffers retained for backward
    retained: Vec<BufferId>,
}

pub struct NodeExecutor<'m> {
    desc:    Box<dyn OpDescriptor>,
    kernel:  Box<dyn Kernel>,
    mem:     &'m MemoryManager,
    slots:   Slots,
    inplace: bool,
    saved:   Option<Saved>,
}

fn alloc(mem: &MemoryManager, dtype: DataType, shape: &[usize]) -> anyhow::Result<TensorAny> {
    Ok(match dtype {
        DataType::F32 => Tensor::<f32>::empty(mem, shape)?.into(),
        DataType::I32 => Tensor::<i32>::empty(mem, shape)?.into(),
        DataType::U32 => Tensor::<u32>::empty(mem, shape)?.into(),
    })
}

impl<'m> NodeExecutor<'m> {
    /// Create the kernel for `mem`'s device. In-place reuse starts disabled.
    pub fn bind(desc: Box<dyn OpDescriptor>, mem: &'m MemoryManager) -> Result<Self, ExecError> {
        let kernel = desc.create_kernel(mem.device())?;
        let slots = Slots::new(desc.list_arguments().len(), desc.list_outputs().len());
        tracing::debug!(op = desc.type_name(), device = %mem.device_kind(), "bound node");
        Ok(Self { desc, kernel, mem, slots, inplace: false, saved: None })
    }

    /// Let outputs share storage with the inputs the descriptor offers.
    /// Caller-owned inputs may then be overwritten by forward.
    pub fn with_inplace(mut self, enabled: bool) -> Self {
        self.inplace = enabled;
        self
    }

    pub fn infer(&self, in_shapes: &[Shape]) -> Result<Inference, ExecError> {
        match self.desc.infer_shape(in_shapes) {
            Ok(shapes) => Ok(Inference::Ready(shapes)),
            Err(e) if e.is_retryable() => {
                tracing::trace!(op = self.desc.type_name(), "shape inference pending: {e}");
                Ok(Inference::Pending(e))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forward over caller-owned inputs. Nothing the caller passed is released.
    pub fn forward(&mut self, inputs: &[TensorAny]) -> Result<Vec<TensorAny>, ExecError> {
        self.run_forward(inputs.to_vec(), false)
    }

    /// Forward taking ownership of `inputs`: every input buffer the backward
    /// pass does not depend on is released as soon as forward completes, the
    /// rest after backward.
    pub fn forward_owned(&mut self, inputs: Vec<TensorAny>) -> Result<Vec<TensorAny>, ExecError> {
        self.run_forward(inputs, true)
    }

    fn run_forward(&mut self, in_data: Vec<TensorAny>, owned: bool) -> Result<Vec<TensorAny>, ExecError> {
        self.clear_saved();
        let op = self.desc.type_name();

        let mut fresh = Vec::new();
        let out_data = match self.compute_forward(&in_data, &mut fresh) {
            Ok(out) => out,
            Err(e) => {
                self.release(fresh);
                if owned {
                    let mut ids: Vec<BufferId> = in_data.iter().map(TensorAny::buffer_id).collect();
                    ids.sort_unstable();
                    ids.dedup();
                    self.release(ids);
                }
                return Err(e);
            }
        };

        let deps = self.desc.declare_backward_dependency(&self.slots.out_grad, &self.slots.in_data, &self.slots.out_data);
        let mut retained = Vec::new();
        if owned {
            let mut keep: HashSet<BufferId> = out_data.iter().map(TensorAny::buffer_id).collect();
            for (t, id) in in_data.iter().zip(&self.slots.in_data) {
                if deps.contains(id) {
                    keep.insert(t.buffer_id());
                }
            }
            let mut released = HashSet::new();
            for t in &in_data {
                let id = t.buffer_id();
                if keep.contains(&id) {
                    if !out_data.iter().any(|o| o.buffer_id() == id) && !retained.contains(&id) {
                        retained.push(id);
                    }
                } else if released.insert(id) && self.mem.release(id) {
                    tracing::trace!(op, buffer = %id, "released forward input");
                }
            }
        }

        self.saved = Some(Saved { in_data, out_data: out_data.clone(), retained });
        Ok(out_data)
    }

    /// Infer, allocate (or alias) the outputs and run the kernel. Buffers
    /// allocated here are recorded in `fresh`.
    fn compute_forward(&self, in_data: &[TensorAny], fresh: &mut Vec<BufferId>) -> Result<Vec<TensorAny>, ExecError> {
        let op = self.desc.type_name();
        let in_shapes: Vec<Shape> = in_data.iter().map(TensorAny::shape).collect();
        let in_types: Vec<DataType> = in_data.iter().map(TensorAny::dtype).collect();
        let out_shapes = self.desc.infer_shape(&in_shapes)?;
        let out_types = self.desc.infer_type(&in_types)?;

        let aliases = if self.inplace {
            self.desc.forward_inplace_option(&self.slots.in_data, &self.slots.out_data)
        } else {
            Vec::new()
        };

        let mut out_data = Vec::with_capacity(out_shapes.len());
        let mut req = Vec::with_capacity(out_shapes.len());
        for (o, (shape, dtype)) in out_shapes.iter().zip(&out_types).enumerate() {
            let dst = self.slots.out_data.get(o).copied();
            let src = aliases
                .iter()
                .filter(|(_, d)| Some(*d) == dst)
                .filter_map(|(s, _)| self.slots.in_data.iter().position(|id| id == s))
                .filter_map(|i| in_data.get(i))
                .find(|t| t.dtype() == *dtype && t.shape() == *shape);
            match src {
                Some(t) => {
                    tracing::debug!(op, buffer = %t.buffer_id(), "forward in place");
                    out_data.push(t.clone());
                    req.push(WriteReq::WriteInplace);
                }
                None => {
                    let t = alloc(self.mem, *dtype, shape)?;
                    fresh.push(t.buffer_id());
                    out_data.push(t);
                    req.push(WriteReq::WriteTo);
                }
            }
        }

        let ctx = OpContext::new(self.mem);
        self.kernel.forward(&ctx, in_data, &req, &out_data)?;
        Ok(out_data)
    }

    /// Gradient of the primary input given the output gradients.
    ///
    /// Auxiliary inputs get no gradient. Consumes the state of the preceding
    /// forward; with in-place enabled the result may share `out_grad`'s storage.
    pub fn backward(&mut self, out_grad: &[TensorAny]) -> Result<Vec<TensorAny>, ExecError> {
        let op = self.desc.type_name();
        let saved = self.saved.take().ok_or(ExecError::NoForward { op })?;
        let result = self.run_backward(&saved, out_grad);
        self.release(saved.retained);
        result
    }

    fn run_backward(&self, saved: &Saved, out_grad: &[TensorAny]) -> Result<Vec<TensorAny>, ExecError> {
        let op = self.desc.type_name();
        let data = saved.in_data.first().ok_or(OpError::ArgumentCount {
            op,
            what: "inputs",
            expected: self.slots.in_data.len(),
            found: 0,
        })?;
        let dst = self.slots.in_grad[0];

        let aliased = if self.inplace {
            let pairs = self.desc.backward_inplace_option(
                &self.slots.out_grad,
                &self.slots.in_data,
                &self.slots.out_data,
                &self.slots.in_grad,
            );
            pairs
                .iter()
                .filter(|(_, d)| *d == dst)
                .filter_map(|(s, _)| self.slots.out_grad.iter().position(|id| id == s))
                .filter_map(|i| out_grad.get(i))
                .find(|g| g.dtype() == data.dtype() && g.shape() == data.shape())
                .cloned()
        } else {
            None
        };

        let (grad, req) = match aliased {
            Some(g) => {
                tracing::debug!(op, buffer = %g.buffer_id(), "backward in place");
                (g, WriteReq::WriteInplace)
            }
            None => (alloc(self.mem, data.dtype(), &data.shape())?, WriteReq::WriteTo),
        };

        let in_grad = vec![grad];
        let ctx = OpContext::new(self.mem);
        if let Err(e) = self.kernel.backward(&ctx, out_grad, &saved.in_data, &saved.out_data, &[req], &in_grad) {
            // an aliased gradient belongs to the caller
            if req == WriteReq::WriteTo {
                self.release(in_grad.iter().map(TensorAny::buffer_id));
            }
            return Err(e.into());
        }
        Ok(in_grad)
    }

    fn release(&self, ids: impl IntoIterator<Item = BufferId>) {
        for id in ids {
            if self.mem.release(id) {
                tracing::trace!(op = self.desc.type_name(), buffer = %id, "released buffer");
            }
        }
    }

    fn clear_saved(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.release(saved.retained);
        }
    }
}

impl Drop for NodeExecutor<'_> {
    fn drop(&mut self) {
        self.clear_saved();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use core_types::DeviceKind;
    use gradops_core::Device;
    use gradops_ops::builtin::{GradReverseParam, GradReverseProp};
    use gradops_ops::{OpRegistry, ParamMap};

    /// Kernel whose every call fails after the executor has prepared buffers
    struct Failing;

    impl Kernel for Failing {
        fn forward(&self, _: &OpContext<'_>, _: &[TensorAny], _: &[WriteReq], _: &[TensorAny]) -> Result<(), OpError> {
            Err(anyhow::anyhow!("forward failed").into())
        }

        fn backward(
            &self,
            _: &OpContext<'_>,
            _: &[TensorAny],
            _: &[TensorAny],
            _: &[TensorAny],
            _: &[WriteReq],
            _: &[TensorAny],
        ) -> Result<(), OpError> {
            Err(anyhow::anyhow!("backward failed").into())
        }
    }

    fn failing(_: &GradReverseParam, _: &Device) -> Result<Box<dyn Kernel>, OpError> {
        Ok(Box::new(Failing))
    }

    fn failing_node(mm: &MemoryManager) -> NodeExecutor<'_> {
        let mut desc = GradReverseProp::new(GradReverseParam::default());
        desc.register_kernel(DeviceKind::Cpu, failing);
        NodeExecutor::bind(Box::new(desc), mm).unwrap()
    }

    fn kwargs(pairs: &[(&str, &str)]) -> ParamMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn f32s(mm: &MemoryManager, data: &[f32]) -> TensorAny {
        Tensor::from_vec(mm, data, &[data.len()]).unwrap().into()
    }

    fn values(mm: &MemoryManager, t: &TensorAny) -> Vec<f32> {
        t.as_f32().unwrap().to_vec(mm).unwrap()
    }

    fn node<'m>(mm: &'m MemoryManager, name: &str, params: &[(&str, &str)]) -> NodeExecutor<'m> {
        let desc = OpRegistry::with_builtins().create(name, &kwargs(params)).unwrap();
        NodeExecutor::bind(desc, mm).unwrap()
    }

    #[test]
    fn infer_defers_unknown_shapes() {
        let mm = MemoryManager::cpu();
        let exec = node(&mm, "GradScale", &[]);

        match exec.infer(&[vec![], vec![3]]).unwrap() {
            Inference::Pending(e) => assert!(e.is_retryable()),
            other => panic!("expected pending, got {other:?}"),
        }
        match exec.infer(&[vec![2, 3], vec![2, 3]]).unwrap() {
            Inference::Ready(shapes) => assert_eq!(shapes, vec![vec![2, 3]]),
            other => panic!("expected ready, got {other:?}"),
        }
        assert!(matches!(exec.infer(&[vec![2]]), Err(ExecError::Op(OpError::ArgumentCount { .. }))));
    }

    #[test]
    fn grad_reverse_lifecycle_releases_data_early() {
        let mm = MemoryManager::cpu();
        let mut exec = node(&mm, "GradReverse", &[("grad_scale", "2.0")]);

        let x = f32s(&mm, &[1.0, -2.0, 3.0]);
        let x_id = x.buffer_id();
        let out = exec.forward_owned(vec![x]).unwrap();
        assert_eq!(values(&mm, &out[0]), vec![1.0, -2.0, 3.0]);
        assert!(!mm.contains(x_id));

        let g = f32s(&mm, &[0.5, 1.0, -1.0]);
        let gx = exec.backward(&[g]).unwrap();
        assert_eq!(gx.len(), 1);
        assert_eq!(values(&mm, &gx[0]), vec![-1.0, -2.0, 2.0]);
    }

    #[test]
    fn grad_scale_retains_scale_until_backward() {
        let mm = MemoryManager::cpu();
        let mut exec = node(&mm, "GradScale", &[("base_scale", "0.5")]);

        let x = f32s(&mm, &[1.0, 2.0, 3.0]);
        let s = f32s(&mm, &[2.0, 0.0, -4.0]);
        let (x_id, s_id) = (x.buffer_id(), s.buffer_id());
        let out = exec.forward_owned(vec![x, s]).unwrap();
        assert_eq!(values(&mm, &out[0]), vec![1.0, 2.0, 3.0]);
        assert!(!mm.contains(x_id));
        assert!(mm.contains(s_id));

        let g = f32s(&mm, &[1.0, 1.0, 1.0]);
        let gx = exec.backward(&[g]).unwrap();
        assert_eq!(values(&mm, &gx[0]), vec![1.0, 0.0, -2.0]);
        assert!(!mm.contains(s_id));
    }

    #[test]
    fn caller_owned_inputs_survive() {
        let mm = MemoryManager::cpu();
        let mut exec = node(&mm, "GradScale", &[]);

        let x = f32s(&mm, &[1.0, 2.0]);
        let s = f32s(&mm, &[3.0, 4.0]);
        exec.forward(&[x.clone(), s.clone()]).unwrap();
        exec.backward(&[f32s(&mm, &[1.0, 1.0])]).unwrap();
        assert!(mm.contains(x.buffer_id()));
        assert!(mm.contains(s.buffer_id()));
    }

    #[test]
    fn inplace_shares_buffers() {
        let mm = MemoryManager::cpu();
        let mut exec = node(&mm, "GradReverse", &[("grad_scale", "3")]).with_inplace(true);

        let x = f32s(&mm, &[1.0, 2.0]);
        let x_id = x.buffer_id();
        let out = exec.forward_owned(vec![x]).unwrap();
        assert_eq!(out[0].buffer_id(), x_id);
        assert!(mm.contains(x_id));
        assert_eq!(values(&mm, &out[0]), vec![1.0, 2.0]);

        let g = f32s(&mm, &[1.0, -1.0]);
        let gx = exec.backward(&[g.clone()]).unwrap();
        assert_eq!(gx[0].buffer_id(), g.buffer_id());
        assert_eq!(values(&mm, &gx[0]), vec![-3.0, 3.0]);
    }

    #[test]
    fn inplace_matches_out_of_place() {
        let mm = MemoryManager::cpu();
        let run = |inplace: bool| {
            let mut exec = node(&mm, "GradScale", &[("base_scale", "1.5")]).with_inplace(inplace);
            let out = exec.forward(&[f32s(&mm, &[1.0, 2.0]), f32s(&mm, &[2.0, -2.0])]).unwrap();
            let gx = exec.backward(&[f32s(&mm, &[4.0, 4.0])]).unwrap();
            (values(&mm, &out[0]), values(&mm, &gx[0]))
        };
        assert_eq!(run(true), run(false));
        assert_eq!(run(false), (vec![1.0, 2.0], vec![12.0, -12.0]));
    }

    #[test]
    fn backward_needs_forward() {
        let mm = MemoryManager::cpu();
        let mut exec = node(&mm, "GradReverse", &[]);
        let g = f32s(&mm, &[1.0]);
        assert!(matches!(exec.backward(&[g.clone()]), Err(ExecError::NoForward { op: "GradReverse" })));

        exec.forward(&[f32s(&mm, &[1.0])]).unwrap();
        exec.backward(&[g.clone()]).unwrap();
        assert!(matches!(exec.backward(&[g]), Err(ExecError::NoForward { .. })));
    }

    #[test]
    fn kernel_errors_surface() {
        let mm = MemoryManager::cpu();
        let mut exec = node(&mm, "GradScale", &[]);
        exec.forward(&[f32s(&mm, &[1.0, 2.0]), f32s(&mm, &[1.0, 2.0])]).unwrap();
        let err = exec.backward(&[f32s(&mm, &[1.0, 2.0, 3.0])]).unwrap_err();
        assert!(matches!(err, ExecError::Op(OpError::ShapeMismatch { .. })));
    }

    #[test]
    fn dropping_releases_retained() {
        let mm = MemoryManager::cpu();
        let s = f32s(&mm, &[1.0]);
        let s_id = s.buffer_id();
        {
            let mut exec = node(&mm, "GradScale", &[]);
            exec.forward_owned(vec![f32s(&mm, &[5.0]), s]).unwrap();
            assert!(mm.contains(s_id));
        }
        assert!(!mm.contains(s_id));
    }

    #[test]
    fn failed_backward_releases_gradient_buffer() {
        let mm = MemoryManager::cpu();
        let mut exec = node(&mm, "GradScale", &[]);
        // scale is not checked until backward
        exec.forward(&[f32s(&mm, &[1.0, 2.0]), f32s(&mm, &[1.0, 2.0, 3.0])]).unwrap();
        let g = f32s(&mm, &[1.0, 1.0]);

        let live = mm.live_buffers();
        let err = exec.backward(&[g]).unwrap_err();
        assert!(matches!(err, ExecError::Op(OpError::ShapeMismatch { arg: "scale", .. })));
        assert_eq!(mm.live_buffers(), live);
    }

    #[test]
    fn failed_inplace_backward_keeps_caller_gradient() {
        let mm = MemoryManager::cpu();
        let mut exec = failing_node(&mm).with_inplace(true);
        let x = f32s(&mm, &[1.0]);
        let g = f32s(&mm, &[1.0]);
        exec.saved = Some(Saved { in_data: vec![x.clone()], out_data: vec![x], retained: Vec::new() });

        assert!(exec.backward(&[g.clone()]).is_err());
        assert!(mm.contains(g.buffer_id()));
    }

    #[test]
    fn failed_forward_releases_outputs() {
        let mm = MemoryManager::cpu();
        let mut exec = failing_node(&mm);
        let x = f32s(&mm, &[1.0, 2.0]);

        let live = mm.live_buffers();
        assert!(matches!(exec.forward(&[x.clone()]), Err(ExecError::Op(OpError::Device(_)))));
        assert_eq!(mm.live_buffers(), live);
        assert!(mm.contains(x.buffer_id()));
        assert!(matches!(exec.backward(&[f32s(&mm, &[1.0, 1.0])]), Err(ExecError::NoForward { .. })));
    }

    #[test]
    fn failed_owned_forward_releases_inputs() {
        let mm = MemoryManager::cpu();
        let mut exec = failing_node(&mm);
        let x = f32s(&mm, &[1.0, 2.0]);
        let x_id = x.buffer_id();

        assert!(exec.forward_owned(vec![x]).is_err());
        assert!(!mm.contains(x_id));
        assert_eq!(mm.live_buffers(), 0);
    }
}
