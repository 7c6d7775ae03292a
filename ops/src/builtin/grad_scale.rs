//! `GradScale`: identity forward, gradient gated elementwise by an auxiliary
//! `scale` tensor backward.
//!
//! `scale` is carried through the forward pass untouched so the graph keeps it
//! alive for backward. It receives no gradient of its own.

use std::sync::Arc;

use core_types::{DataType, DeviceKind};
use gradops_core::{Device, GpuContext};
use tensor::{Shape, Tensor};

use super::{
    DATA, OUT, backward_operands, check_shape, f32_arg, forward_operands, infer_f32, infer_from_data, inplace_pair, select,
};
use crate::elementwise::{gpu_map, host_map};
use crate::op::{ArgInfo, Kernel, KernelCtor, KernelTable, OpContext, OpDescriptor, RegistrationInfo};
use crate::param::{FieldInfo, OpParam, format_f32, parse_f32, reject_unknown};
use crate::types::{OpError, ParamMap, TensorAny, TensorId, WriteReq, check_count};

const NAME: &str = "GradScale";
const SCALE: usize = 1;
const ARGS: [&str; 2] = ["data", "scale"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradScaleParam {
    pub base_scale: f32,
}

impl Default for GradScaleParam {
    fn default() -> Self {
        Self { base_scale: 1.0 }
    }
}

impl OpParam for GradScaleParam {
    const FIELDS: &'static [FieldInfo] = &[FieldInfo {
        name: "base_scale",
        type_info: "float, optional, default=1",
        default: Some("1"),
        description: "Scale the gradient by a float factor",
    }];

    fn init(op: &'static str, kwargs: &ParamMap) -> Result<Self, OpError> {
        reject_unknown(op, Self::FIELDS, kwargs)?;
        Ok(Self { base_scale: parse_f32(op, &Self::FIELDS[0], kwargs)? })
    }

    fn to_map(&self) -> ParamMap {
        ParamMap::from([("base_scale".to_string(), format_f32(self.base_scale))])
    }
}

/// `(out_grad, scale, in_grad[data], req)` after every shape check
fn scaled_operands<'a>(
    out_grad: &'a [TensorAny],
    in_data: &'a [TensorAny],
    req: &[WriteReq],
    in_grad: &'a [TensorAny],
) -> Result<(&'a Tensor<f32>, &'a Tensor<f32>, &'a Tensor<f32>, WriteReq), OpError> {
    let (grad, gdata, req) = backward_operands(NAME, ARGS.len(), out_grad, req, in_grad)?;
    check_count(NAME, "inputs", ARGS.len(), in_data.len())?;
    let scale = f32_arg(NAME, "scale", &in_data[SCALE])?;
    check_shape(NAME, "scale", grad, scale)?;
    Ok((grad, scale, gdata, req))
}

/* ------------------------------------------------------------------------- */
/* Kernels                                                                   */
/* ------------------------------------------------------------------------- */

pub struct CpuGradScale {
    param: GradScaleParam,
}

impl Kernel for CpuGradScale {
    fn forward(
        &self,
        ctx: &OpContext<'_>,
        in_data: &[TensorAny],
        req: &[WriteReq],
        out_data: &[TensorAny],
    ) -> Result<(), OpError> {
        let (data, out, req) = forward_operands(NAME, ARGS.len(), in_data, req, out_data)?;
        host_map(NAME, ctx.mem, ["data"], [data], out, req, |[x]| x)
    }

    fn backward(
        &self,
        ctx: &OpContext<'_>,
        out_grad: &[TensorAny],
        in_data: &[TensorAny],
        _out_data: &[TensorAny],
        req: &[WriteReq],
        in_grad: &[TensorAny],
    ) -> Result<(), OpError> {
        let (grad, scale, gdata, req) = scaled_operands(out_grad, in_data, req, in_grad)?;
        let base = self.param.base_scale;
        host_map(NAME, ctx.mem, ["output_grad", "scale"], [grad, scale], gdata, req, |[g, s]| base * g * s)
    }
}

pub struct GpuGradScale {
    param: GradScaleParam,
    gpu:   GpuContext,
}

impl Kernel for GpuGradScale {
    fn forward(
        &self,
        ctx: &OpContext<'_>,
        in_data: &[TensorAny],
        req: &[WriteReq],
        out_data: &[TensorAny],
    ) -> Result<(), OpError> {
        let (data, out, req) = forward_operands(NAME, ARGS.len(), in_data, req, out_data)?;
        gpu_map(NAME, &self.gpu, ctx.mem, ["data"], [data], out, req, 1.0, "x0")
    }

    fn backward(
        &self,
        ctx: &OpContext<'_>,
        out_grad: &[TensorAny],
        in_data: &[TensorAny],
        _out_data: &[TensorAny],
        req: &[WriteReq],
        in_grad: &[TensorAny],
    ) -> Result<(), OpError> {
        let (grad, scale, gdata, req) = scaled_operands(out_grad, in_data, req, in_grad)?;
        gpu_map(
            NAME,
            &self.gpu,
            ctx.mem,
            ["output_grad", "scale"],
            [grad, scale],
            gdata,
            req,
            self.param.base_scale,
            "P.scale * x0 * x1",
        )
    }
}

fn cpu_kernel(param: &GradScaleParam, _device: &Device) -> Result<Box<dyn Kernel>, OpError> {
    Ok(Box::new(CpuGradScale { param: *param }))
}

fn gpu_kernel(param: &GradScaleParam, device: &Device) -> Result<Box<dyn Kernel>, OpError> {
    let gpu = device
        .gpu()
        .ok_or(OpError::UnsupportedDevice { op: NAME, device: device.kind() })?;
    Ok(Box::new(GpuGradScale { param: *param, gpu: gpu.clone() }))
}

/// Builtin kernels: host and wgpu
pub fn kernel_table() -> KernelTable<GradScaleParam> {
    KernelTable::new(NAME)
        .with(DeviceKind::Cpu, cpu_kernel)
        .with(DeviceKind::Gpu, gpu_kernel)
}

/* ------------------------------------------------------------------------- */
/* Descriptor                                                                */
/* ------------------------------------------------------------------------- */

#[derive(Clone)]
pub struct GradScaleProp {
    param:   GradScaleParam,
    kernels: Arc<KernelTable<GradScaleParam>>,
}

impl GradScaleProp {
    pub fn new(param: GradScaleParam) -> Self {
        Self { param, kernels: Arc::new(kernel_table()) }
    }

    /// Add or replace the kernel used on `kind`, for this node only
    pub fn register_kernel(&mut self, kind: DeviceKind, ctor: KernelCtor<GradScaleParam>) {
        Arc::make_mut(&mut self.kernels).register(kind, ctor);
    }

    pub fn kernel_devices(&self) -> Vec<DeviceKind> {
        self.kernels.devices()
    }
}

impl RegistrationInfo for GradScaleProp {
    const NAME: &'static str = NAME;
    const DESCRIPTION: &'static str = "Scale gradient in this layer.";
    const ARGUMENTS: &'static [ArgInfo] = &[
        ArgInfo { name: "data", type_info: "Symbol", description: "Input data" },
        ArgInfo { name: "scale", type_info: "Symbol", description: "Scale gradient" },
    ];

    type Param = GradScaleParam;

    fn from_param(param: GradScaleParam) -> Self {
        Self::new(param)
    }
}

impl OpDescriptor for GradScaleProp {
    fn type_name(&self) -> &'static str {
        NAME
    }

    fn list_arguments(&self) -> Vec<&'static str> {
        ARGS.to_vec()
    }

    fn params(&self) -> ParamMap {
        self.param.to_map()
    }

    fn infer_shape(&self, in_shapes: &[Shape]) -> Result<Vec<Shape>, OpError> {
        infer_from_data(NAME, ARGS.len(), in_shapes)
    }

    fn infer_type(&self, in_types: &[DataType]) -> Result<Vec<DataType>, OpError> {
        infer_f32(NAME, &ARGS, in_types)
    }

    fn declare_backward_dependency(
        &self,
        out_grad: &[TensorId],
        in_data: &[TensorId],
        _out_data: &[TensorId],
    ) -> Vec<TensorId> {
        select(&[(out_grad, OUT), (in_data, SCALE)])
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

#[cfg(test)]
mod tests {
    use super::*;
    use memory::MemoryManager;
    use pollster::block_on;

    fn prop(base: f32) -> GradScaleProp {
        GradScaleProp::new(GradScaleParam { base_scale: base })
    }

    fn f32s(mm: &MemoryManager, data: &[f32]) -> TensorAny {
        Tensor::from_vec(mm, data, &[data.len()]).unwrap().into()
    }

    fn read(mm: &MemoryManager, t: &TensorAny) -> Vec<f32> {
        t.as_f32().unwrap().to_vec(mm).unwrap()
    }

    #[test]
    fn half_base_scenario() {
        let mm = MemoryManager::cpu();
        let ctx = OpContext::new(&mm);
        let param = GradScaleParam::init(NAME, &ParamMap::from([("base_scale".into(), "0.5".into())])).unwrap();
        let kernel = GradScaleProp::new(param).create_kernel(mm.device()).unwrap();

        let x = f32s(&mm, &[9.0, 9.0]);
        let s = f32s(&mm, &[1.0, 0.5]);
        let g = f32s(&mm, &[2.0, 4.0]);
        let gx = f32s(&mm, &[0.0, 0.0]);
        kernel.backward(&ctx, &[g], &[x, s], &[], &[WriteReq::WriteTo], &[gx.clone()]).unwrap();
        assert_eq!(read(&mm, &gx), vec![1.0, 1.0]);
    }

    #[test]
    fn forward_ignores_scale() {
        let mm = MemoryManager::cpu();
        let ctx = OpContext::new(&mm);
        let kernel = prop(3.0).create_kernel(mm.device()).unwrap();
        let x = f32s(&mm, &[1.0, -2.0]);
        let s = f32s(&mm, &[0.0, 0.0]);
        let y = f32s(&mm, &[0.0, 0.0]);
        kernel.forward(&ctx, &[x, s.clone()], &[WriteReq::WriteTo], &[y.clone()]).unwrap();
        assert_eq!(read(&mm, &y), vec![1.0, -2.0]);
        assert_eq!(read(&mm, &s), vec![0.0, 0.0]);
    }

    #[test]
    fn gradient_and_scale_commute() {
        let mm = MemoryManager::cpu();
        let ctx = OpContext::new(&mm);
        let kernel = prop(1.5).create_kernel(mm.device()).unwrap();
        let a = [0.25f32, -3.0, 8.0];
        let b = [4.0f32, 0.5, -0.125];

        let run = |g: &[f32], s: &[f32]| {
            let out = f32s(&mm, &[0.0; 3]);
            let inputs = [f32s(&mm, &[0.0; 3]), f32s(&mm, s)];
            kernel.backward(&ctx, &[f32s(&mm, g)], &inputs, &[], &[WriteReq::WriteTo], &[out.clone()]).unwrap();
            read(&mm, &out)
        };
        let gs = run(&a, &b);
        assert_eq!(gs, run(&b, &a));
        for i in 0..3 {
            assert_eq!(gs[i], 1.5 * a[i] * b[i]);
        }
    }

    #[test]
    fn in_place_matches_out_of_place() {
        let mm = MemoryManager::cpu();
        let ctx = OpContext::new(&mm);
        let kernel = prop(0.5).create_kernel(mm.device()).unwrap();
        let s = f32s(&mm, &[1.0, 0.5]);
        let g = f32s(&mm, &[2.0, 4.0]);
        kernel
            .backward(&ctx, &[g.clone()], &[f32s(&mm, &[0.0, 0.0]), s], &[], &[WriteReq::WriteInplace], &[g.clone()])
            .unwrap();
        assert_eq!(read(&mm, &g), vec![1.0, 1.0]);
    }

    #[test]
    fn scale_slot_in_grad_is_left_untouched() {
        let mm = MemoryManager::cpu();
        let ctx = OpContext::new(&mm);
        let kernel = prop(1.0).create_kernel(mm.device()).unwrap();
        let s = f32s(&mm, &[2.0]);
        let g = f32s(&mm, &[3.0]);
        let gx = f32s(&mm, &[0.0]);
        let gs = f32s(&mm, &[42.0]);
        kernel
            .backward(
                &ctx,
                &[g],
                &[f32s(&mm, &[0.0]), s],
                &[],
                &[WriteReq::WriteTo, WriteReq::WriteTo],
                &[gx.clone(), gs.clone()],
            )
            .unwrap();
        assert_eq!(read(&mm, &gx), vec![6.0]);
        assert_eq!(read(&mm, &gs), vec![42.0]);
    }

    #[test]
    fn mismatched_scale_is_a_shape_error() {
        let mm = MemoryManager::cpu();
        let ctx = OpContext::new(&mm);
        let kernel = prop(1.0).create_kernel(mm.device()).unwrap();
        let g = f32s(&mm, &[1.0, 2.0]);
        let gx = f32s(&mm, &[0.0, 0.0]);
        let s = f32s(&mm, &[1.0, 2.0, 3.0]);
        let err = kernel
            .backward(&ctx, &[g], &[f32s(&mm, &[0.0, 0.0]), s], &[], &[WriteReq::WriteTo], &[gx])
            .unwrap_err();
        assert!(matches!(err, OpError::ShapeMismatch { arg: "scale", .. }));
    }

    #[test]
    fn forward_requires_both_arguments() {
        let mm = MemoryManager::cpu();
        let ctx = OpContext::new(&mm);
        let kernel = prop(1.0).create_kernel(mm.device()).unwrap();
        let x = f32s(&mm, &[1.0]);
        let err = kernel.forward(&ctx, &[x.clone()], &[WriteReq::WriteTo], &[x]).unwrap_err();
        assert!(matches!(err, OpError::ArgumentCount { expected: 2, found: 1, .. }));
    }

    #[test]
    fn shape_inference_follows_data() {
        let p = prop(1.0);
        let shapes = vec![vec![4, 5], vec![]];
        assert_eq!(p.infer_shape(&shapes).unwrap(), vec![vec![4, 5]]);
        assert_eq!(p.infer_shape(&shapes).unwrap(), p.infer_shape(&shapes).unwrap());
        assert!(p.infer_shape(&[vec![], vec![4, 5]]).unwrap_err().is_retryable());
        assert!(matches!(p.infer_shape(&[vec![4, 5]]).unwrap_err(), OpError::ArgumentCount { .. }));
    }

    #[test]
    fn backward_keeps_only_gradient_and_scale() {
        let p = prop(1.0);
        // out_grad = 10, in_data = [1, 2], out_data = 3, in_grad = [11, 12]
        let mut deps = p.declare_backward_dependency(&[10], &[1, 2], &[3]);
        deps.sort();
        assert_eq!(deps, vec![2, 10]);
        assert!(!deps.contains(&1) && !deps.contains(&3));
        assert_eq!(p.forward_inplace_option(&[1, 2], &[3]), vec![(1, 3)]);
        assert_eq!(p.backward_inplace_option(&[10], &[1, 2], &[3], &[11, 12]), vec![(10, 11)]);
        assert_eq!(p.list_arguments(), vec!["data", "scale"]);
    }

    #[test]
    fn short_id_lists_drop_missing_slots() {
        let p = prop(1.0);
        assert_eq!(p.declare_backward_dependency(&[10], &[1], &[3]), vec![10]);
        assert!(p.declare_backward_dependency(&[], &[], &[]).is_empty());
        assert!(p.forward_inplace_option(&[1, 2], &[]).is_empty());
        assert!(p.backward_inplace_option(&[], &[1, 2], &[3], &[11]).is_empty());
    }

    #[test]
    fn params_roundtrip() {
        let p = GradScaleParam { base_scale: -1.25e-3 };
        assert_eq!(GradScaleParam::init(NAME, &p.to_map()).unwrap(), p);
        let err = GradScaleParam::init(NAME, &ParamMap::from([("grad_scale".into(), "1".into())])).unwrap_err();
        assert!(matches!(err, OpError::Parse { .. }));
    }

    #[test]
    fn gpu_matches_cpu() {
        let Ok(device) = block_on(Device::default_gpu()) else {
            eprintln!("no gpu adapter, skipping");
            return;
        };
        let mm = MemoryManager::new(device);
        let ctx = OpContext::new(&mm);
        let kernel = prop(0.5).create_kernel(mm.device()).unwrap();

        let x = f32s(&mm, &[7.0, 8.0]);
        let s = f32s(&mm, &[1.0, 0.5]);
        let y = f32s(&mm, &[0.0, 0.0]);
        kernel.forward(&ctx, &[x.clone(), s.clone()], &[WriteReq::WriteTo], &[y.clone()]).unwrap();
        assert_eq!(read(&mm, &y), vec![7.0, 8.0]);

        let g = f32s(&mm, &[2.0, 4.0]);
        let gx = f32s(&mm, &[0.0, 0.0]);
        kernel.backward(&ctx, &[g.clone()], &[x.clone(), s.clone()], &[y.clone()], &[WriteReq::WriteTo], &[gx.clone()]).unwrap();
        assert_eq!(read(&mm, &gx), vec![1.0, 1.0]);

        kernel.backward(&ctx, &[g.clone()], &[x, s], &[y], &[WriteReq::WriteInplace], &[g.clone()]).unwrap();
        assert_eq!(read(&mm, &g), vec![1.0, 1.0]);
    }
}
