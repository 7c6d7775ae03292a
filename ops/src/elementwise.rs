//! Elementwise maps shared by the builtin kernels.
//!
//! Both backends take flat `f32` views, honor [`WriteReq`] and tolerate an
//! output that shares its buffer with one or more sources.

use std::fmt::Write as _;
use std::ops::Range;

use anyhow::anyhow;
use bytemuck::{Pod, Zeroable, bytes_of, cast_slice, cast_slice_mut};
use core_types::BufferId;
use gradops_core::GpuContext;
use gradops_core::types::{BufferKind, HostWords};
use memory::{HostBuffer, MemoryManager};
use parking_lot::RwLockReadGuard;
use tensor::Tensor;

use crate::types::{OpError, WriteReq};

/// Threads per workgroup for every map shader
const WORKGROUP: u32 = 64;

/// Elements covered by a flat view
fn span(t: &Tensor<f32>) -> Range<usize> {
    let start = t.view().offset as usize;
    start..start + t.numel()
}

fn check_lengths<const N: usize>(
    op: &'static str,
    names: [&'static str; N],
    srcs: [&Tensor<f32>; N],
    dst: &Tensor<f32>,
) -> Result<(), OpError> {
    for (name, src) in names.into_iter().zip(srcs) {
        if src.numel() != dst.numel() {
            return Err(OpError::ShapeMismatch {
                op,
                arg: name,
                expected: dst.shape(),
                found: src.shape(),
            });
        }
    }
    Ok(())
}

fn host_buffer(op: &'static str, arg: &'static str, mem: &MemoryManager, t: &Tensor<f32>) -> Result<HostBuffer, OpError> {
    mem.host_buffer(t.buffer_id()).ok_or(OpError::MissingBuffer {
        op,
        arg,
        id: t.buffer_id(),
        device: mem.device_kind(),
    })
}

fn check_range(op: &'static str, id: BufferId, range: &Range<usize>, len: usize) -> Result<(), OpError> {
    if range.end > len {
        return Err(OpError::Device(anyhow!(
            "{op}: view {range:?} exceeds {id} ({len} elements)"
        )));
    }
    Ok(())
}

/// Where a source operand reads from
enum Lane {
    /// The destination itself, same offset: element `k` is read before it is written
    Dst,
    /// A read guard on a distinct buffer
    Read { guard: usize, start: usize },
    /// Snapshot of a source that overlaps the destination at another offset
    Copy(Vec<f32>),
}

/// `dst[k] (=|+=) f([src_0[k], .., src_n[k]])` on host memory.
pub fn host_map<const N: usize>(
    op: &'static str,
    mem: &MemoryManager,
    names: [&'static str; N],
    srcs: [&Tensor<f32>; N],
    dst: &Tensor<f32>,
    req: WriteReq,
    f: impl Fn([f32; N]) -> f32,
) -> Result<(), OpError> {
    check_lengths(op, names, srcs, dst)?;
    if req == WriteReq::Null {
        return Ok(());
    }

    let dst_id = dst.buffer_id();
    let dst_buf = host_buffer(op, "output", mem, dst)?;
    let dst_span = span(dst);

    // one handle per distinct source buffer, the destination excluded
    let mut handles: Vec<(BufferId, HostBuffer)> = Vec::new();
    let mut lanes: Vec<Lane> = Vec::with_capacity(N);
    for (name, src) in names.into_iter().zip(srcs) {
        let id = src.buffer_id();
        let src_span = span(src);
        if id == dst_id {
            if src_span.start == dst_span.start {
                lanes.push(Lane::Dst);
            } else {
                let words = dst_buf.read();
                let all: &[f32] = cast_slice(&words[..]);
                check_range(op, id, &src_span, all.len())?;
                lanes.push(Lane::Copy(all[src_span].to_vec()));
            }
            continue;
        }
        let guard = match handles.iter().position(|(h, _)| *h == id) {
            Some(i) => i,
            None => {
                handles.push((id, host_buffer(op, name, mem, src)?));
                handles.len() - 1
            }
        };
        lanes.push(Lane::Read { guard, start: src_span.start });
    }

    let guards: Vec<RwLockReadGuard<'_, HostWords>> = handles.iter().map(|(_, h)| h.read()).collect();
    let reads: Vec<&[f32]> = guards.iter().map(|g| cast_slice::<u32, f32>(&g[..])).collect();
    for (lane, src) in lanes.iter().zip(srcs) {
        if let Lane::Read { guard, .. } = lane {
            check_range(op, src.buffer_id(), &span(src), reads[*guard].len())?;
        }
    }

    let mut words = dst_buf.write();
    let out: &mut [f32] = cast_slice_mut(&mut words[..]);
    check_range(op, dst_id, &dst_span, out.len())?;

    for k in 0..dst_span.len() {
        let o = dst_span.start + k;
        let mut args = [0f32; N];
        for (arg, lane) in args.iter_mut().zip(&lanes) {
            *arg = match lane {
                Lane::Dst => out[o],
                Lane::Read { guard, start } => reads[*guard][start + k],
                Lane::Copy(v) => v[k],
            };
        }
        let v = f(args);
        out[o] = match req {
            WriteReq::AddTo => out[o] + v,
            _ => v,
        };
    }
    Ok(())
}

/// Uniform block read by every map shader
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MapParams {
    pub len:        u32,
    pub accumulate: u32,
    pub scale:      f32,
    pub out_offset: u32,
    pub src_offset: [u32; MAX_GPU_SOURCES],
}

/// Maximum operand count of a GPU map
pub const MAX_GPU_SOURCES: usize = 4;

/// WGSL source for `OUT[i] (=|+=) expr`, where `expr` reads operands `x0..xN`
/// and the scalar `P.scale`.
///
/// `bindings[j]` is the storage variable operand `j` reads from: `OUT` for an
/// operand aliasing the destination, `S<k>` for the k-th distinct source.
pub fn map_shader(expr: &str, bindings: &[String], n_distinct: usize) -> String {
    let mut src = format!(
        "struct Params {{\n    len: u32,\n    accumulate: u32,\n    scale: f32,\n    out_offset: u32,\n    src_offset: array<u32, {MAX_GPU_SOURCES}>,\n}}\n\n\
         @group(0) @binding(0) var<storage, read> P: Params;\n",
    );
    for k in 0..n_distinct {
        let _ = writeln!(src, "@group(0) @binding({}) var<storage, read> S{k}: array<f32>;", k + 1);
    }
    let _ = writeln!(src, "@group(0) @binding({}) var<storage, read_write> OUT: array<f32>;\n", n_distinct + 1);
    src.push_str(
        "@compute @workgroup_size(64)\nfn map_kernel(@builtin(global_invocation_id) gid: vec3<u32>) {\n    let i = gid.x;\n    if (i >= P.len) {\n        return;\n    }\n",
    );
    for (j, b) in bindings.iter().enumerate() {
        let _ = writeln!(src, "    let x{j} = {b}[P.src_offset[{j}] + i];");
    }
    let _ = write!(
        src,
        "    let v = {expr};\n    let o = P.out_offset + i;\n    if (P.accumulate != 0u) {{\n        OUT[o] = OUT[o] + v;\n    }} else {{\n        OUT[o] = v;\n    }}\n}}\n"
    );
    src
}

/// GPU counterpart of [`host_map`]: compiles (or reuses) a map shader for
/// `expr` and dispatches it over `dst`.
#[allow(clippy::too_many_arguments)]
pub fn gpu_map<const N: usize>(
    op: &'static str,
    ctx: &GpuContext,
    mem: &MemoryManager,
    names: [&'static str; N],
    srcs: [&Tensor<f32>; N],
    dst: &Tensor<f32>,
    req: WriteReq,
    scale: f32,
    expr: &str,
) -> Result<(), OpError> {
    const { assert!(N <= MAX_GPU_SOURCES) };
    check_lengths(op, names, srcs, dst)?;
    if req == WriteReq::Null || dst.numel() == 0 {
        return Ok(());
    }
    let len = u32::try_from(dst.numel())
        .map_err(|_| OpError::Device(anyhow!("{op}: {} elements exceed one dispatch", dst.numel())))?;

    let lookup = |arg: &'static str, t: &Tensor<f32>| {
        mem.gpu_buffer(t.buffer_id()).ok_or(OpError::MissingBuffer {
            op,
            arg,
            id: t.buffer_id(),
            device: mem.device_kind(),
        })
    };
    let out_buf = lookup("output", dst)?;

    let mut params = MapParams {
        len,
        accumulate: u32::from(req == WriteReq::AddTo),
        scale,
        out_offset: dst.view().offset,
        src_offset: [0; MAX_GPU_SOURCES],
    };
    let mut distinct: Vec<BufferId> = Vec::new();
    let mut inputs = Vec::new();
    let mut bindings = Vec::with_capacity(N);
    for (j, (name, src)) in names.into_iter().zip(srcs).enumerate() {
        params.src_offset[j] = src.view().offset;
        let id = src.buffer_id();
        if id == dst.buffer_id() {
            // invocations run concurrently, so only a same-offset overlap is race free
            if src.view().offset != dst.view().offset {
                return Err(OpError::Device(anyhow!(
                    "{op}: `{name}` partially overlaps the output in {id}"
                )));
            }
            bindings.push("OUT".to_string());
            continue;
        }
        let k = match distinct.iter().position(|d| *d == id) {
            Some(k) => k,
            None => {
                distinct.push(id);
                inputs.push(lookup(name, src)?);
                distinct.len() - 1
            }
        };
        bindings.push(format!("S{k}"));
    }

    let shader = map_shader(expr, &bindings, distinct.len());
    let bundle = ctx.pipeline(&shader, "map_kernel", distinct.len() + 1, 1);
    let param_buf = ctx.create_buffer_with_data(bytes_of(&params), BufferKind::Main);

    let mut input_refs = vec![&param_buf];
    input_refs.extend(inputs.iter().map(|b| b.as_ref()));
    ctx.dispatch_compute_1d(&bundle, &input_refs, &[out_buf.as_ref()], len, WORKGROUP)?;
    Ok(())
}
