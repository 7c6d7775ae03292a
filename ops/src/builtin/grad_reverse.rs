//! `GradReverse`: identity forward, negated and scaled gradient backward.
//!
//! Used as a gradient reversal layer in domain-adversarial training.

use std::sync::Arc;

use core_types::{DataType, DeviceKind};
use gradops_core::{Device, GpuContext};
use tensor::Shape;

use super::{DATA, OUT, backward_operands, forward_operands, infer_f32, infer_from_data, inplace_pair, select};
use crate::elementwise::{gpu_map, host_map};
use crate::op::{ArgInfo, Kernel, KernelCtor, KernelTable, OpContext, OpDescriptor, RegistrationInfo};
use crate::param::{FieldInfo, OpParam, format_f32, parse_f32, reject_unknown};
use crate::types::{OpError, ParamMap, TensorAny, TensorId, WriteReq};

const NAME: &str = "GradReverse";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradReverseParam {
    pub grad_scale: f32,
}

impl Default for GradReverseParam {
    fn default() -> Self {
        Self { grad_scale: 1.0 }
    }
}

impl OpParam for GradReverseParam {
    const FIELDS: &'static [FieldInfo] = &[FieldInfo {
        name: "grad_scale",
        type_info: "float, optional, default=1",
        default: Some("1"),
        description: "Scale the reverse gradient by a float factor",
    }];

    fn init(op: &'static str, kwargs: &ParamMap) -> Result<Self, OpError> {
        reject_unknown(op, Self::FIELDS, kwargs)?;
        Ok(Self { grad_scale: parse_f32(op, &Self::FIELDS[0], kwargs)? })
    }

    fn to_map(&self) -> ParamMap {
        ParamMap::from([("grad_scale".to_string(), format_f32(self.grad_scale))])
    }
}

/* ------------------------------------------------------------------------- */
/* Kernels                                                                   */
/* ------------------------------------------------------------------------- */

pub struct CpuGradReverse {
    param: GradReverseParam,
}

impl Kernel for CpuGradReverse {
    fn forward(
        &self,
        ctx: &OpContext<'_>,
        in_data: &[TensorAny],
        req: &[WriteReq],
        out_data: &[TensorAny],
    ) -> Result<(), OpError> {
        let (data, out, req) = forward_operands(NAME, 1, in_data, req, out_data)?;
        host_map(NAME, ctx.mem, ["data"], [data], out, req, |[x]| x)
    }

    fn backward(
        &self,
        ctx: &OpContext<'_>,
        out_grad: &[TensorAny],
        _in_data: &[TensorAny],
        _out_data: &[TensorAny],
        req: &[WriteReq],
        in_grad: &[TensorAny],
    ) -> Result<(), OpError> {
        let (grad, gdata, req) = backward_operands(NAME, 1, out_grad, req, in_grad)?;
        let scale = self.param.grad_scale;
        host_map(NAME, ctx.mem, ["output_grad"], [grad], gdata, req, |[g]| scale * -g)
    }
}

pub struct GpuGradReverse {
    param: GradReverseParam,
    gpu:   GpuContext,
}

impl Kernel for GpuGradReverse {
    fn forward(
        &self,
        ctx: &OpContext<'_>,
        in_data: &[TensorAny],
        req: &[WriteReq],
        out_data: &[TensorAny],
    ) -> Result<(), OpError> {
        let (data, out, req) = forward_operands(NAME, 1, in_data, req, out_data)?;
        gpu_map(NAME, &self.gpu, ctx.mem, ["data"], [data], out, req, 1.0, "x0")
    }

    fn backward(
        &self,
        ctx: &OpContext<'_>,
        out_grad: &[TensorAny],
        _in_data: &[TensorAny],
        _out_data: &[TensorAny],
        req: &[WriteReq],
        in_grad: &[TensorAny],
    ) -> Result<(), OpError> {
        let (grad, gdata, req) = backward_operands(NAME, 1, out_grad, req, in_grad)?;
        gpu_map(
            NAME,
            &self.gpu,
            ctx.mem,
            ["output_grad"],
            [grad],
            gdata,
            req,
            self.param.grad_scale,
            "P.scale * (-x0)",
        )
    }
}

fn cpu_kernel(param: &GradReverseParam, _device: &Device) -> Result<Box<dyn Kernel>, OpError> {
    Ok(Box::new(CpuGradReverse { param: *param }))
}

fn gpu_kernel(param: &GradReverseParam, device: &Device) -> Result<Box<dyn Kernel>, OpError> {
    let gpu = device
        .gpu()
        .ok_or(OpError::UnsupportedDevice { op: NAME, device: device.kind() })?;
    Ok(Box::new(GpuGradReverse { param: *param, gpu: gpu.clone() }))
}

/// Builtin kernels: host and wgpu
pub fn kernel_table() -> KernelTable<GradReverseParam> {
    KernelTable::new(NAME)
        .with(DeviceKind::Cpu, cpu_kernel)
        .with(DeviceKind::Gpu, gpu_kernel)
}

/* ------------------------------------------------------------------------- */
/* Descriptor                                                                */
/* ------------------------------------------------------------------------- */

#[derive(Clone)]
pub struct GradReverseProp {
    param:   GradReverseParam,
    kernels: Arc<KernelTable<GradReverseParam>>,
}

impl GradReverseProp {
    pub fn new(param: GradReverseParam) -> Self {
        Self { param, kernels: Arc::new(kernel_table()) }
    }

    /// Add or replace the kernel used on `kind`, for this node only
    pub fn register_kernel(&mut self, kind: DeviceKind, ctor: KernelCtor<GradReverseParam>) {
        Arc::make_mut(&mut self.kernels).register(kind, ctor);
    }

    pub fn kernel_devices(&self) -> Vec<DeviceKind> {
        self.kernels.devices()
    }
}

impl RegistrationInfo for GradReverseProp {
    const NAME: &'static str = NAME;
    const DESCRIPTION: &'static str = "Reverse and scale the gradient; identity in the forward pass.";
    const ARGUMENTS: &'static [ArgInfo] = &[ArgInfo {
        name: "data",
        type_info: "Symbol",
        description: "Input data",
    }];

    type Param = GradReverseParam;

    fn from_param(param: GradReverseParam) -> Self {
        Self::new(param)
    }
}

impl OpDescriptor for GradReverseProp {
    fn type_name(&self) -> &'static str {
        NAME
    }

    fn list_arguments(&self) -> Vec<&'static str> {
        vec!["data"]
    }

    fn params(&self) -> ParamMap {
        self.param.to_map()
    }

    fn infer_shape(&self, in_shapes: &[Shape]) -> Result<Vec<Shape>, OpError> {
        infer_from_data(NAME, 1, in_shapes)
    }

    fn infer_type(&self, in_types: &[DataType]) -> Result<Vec<DataType>, OpError> {
        infer_f32(NAME, &["data"], in_types)
    }

    fn declare_backward_dependency(
        &self,
        out_grad: &[TensorId],
        _in_data: &[TensorId],
        _out_data: &[TensorId],
    ) -> Vec<TensorId> {
        select(&[(out_grad, OUT)])
    }

    fn forward_inplace_option(&self, in_data: &[TensorId], out_data: &[TensorId]) -> Vec<(TensorId, TensorId)> {
        inplace_pair(in_data, DATA, out_data, OUT)
    }

    fn backward_inplace_option(
        &self,
        out_grad: &[TensorId],
        _in_data: &[TensorId],
        _out_data: &[TensorId],
        in_grad: &[TensorId],
    ) -> Vec<(TensorId, TensorId)> {
        inplace_pair(out_grad, OUT, in_grad, DATA)
    }

    fn create_kernel(&self, device: &Device) -> Result<Box<dyn Kernel>, OpError> {
        self.kernels.create(&self.param, device)
    }

    fn box_clone(&self) -> Box<dyn OpDescriptor> {
        Box::new(self.clone())
    }
}
