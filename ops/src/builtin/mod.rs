pub mod grad_reverse;
pub mod grad_scale;

pub use grad_reverse::{GradReverseParam, GradReverseProp};
pub use grad_scale::{GradScaleParam, GradScaleProp};

use core_types::DataType;
use tensor::{Shape, Tensor};

use crate::types::{OpError, TensorAny, TensorId, WriteReq, check_count};

/// Index of the primary input in every builtin's argument list
pub(crate) const DATA: usize = 0;
/// Index of the single output
pub(crate) const OUT: usize = 0;

pub(crate) fn f32_arg<'a>(op: &'static str, arg: &'static str, t: &'a TensorAny) -> Result<&'a Tensor<f32>, OpError> {
    t.as_f32().ok_or(OpError::DtypeMismatch {
        op,
        arg,
        expected: vec![DataType::F32],
        found: t.dtype(),
    })
}

pub(crate) fn check_shape(op: &'static str, arg: &'static str, expected: &Tensor<f32>, found: &Tensor<f32>) -> Result<(), OpError> {
    if expected.shape() != found.shape() {
        return Err(OpError::ShapeMismatch {
            op,
            arg,
            expected: expected.shape(),
            found: found.shape(),
        });
    }
    Ok(())
}

/// Validated `(data, output, req)` of an identity forward pass
pub(crate) fn forward_operands<'a>(
    op: &'static str,
    n_args: usize,
    in_data: &'a [TensorAny],
    req: &[WriteReq],
    out_data: &'a [TensorAny],
) -> Result<(&'a Tensor<f32>, &'a Tensor<f32>, WriteReq), OpError> {
    check_count(op, "inputs", n_args, in_data.len())?;
    check_count(op, "outputs", 1, out_data.len())?;
    check_count(op, "write requests", out_data.len(), req.len())?;
    let data = f32_arg(op, "data", &in_data[DATA])?;
    let out = f32_arg(op, "output", &out_data[OUT])?;
    check_shape(op, "output", data, out)?;
    Ok((data, out, req[OUT]))
}

/// Validated `(out_grad, in_grad[data], req)` of a backward pass.
///
/// `max_in_grad` bounds how many input-gradient slots the caller may pass;
/// only the `data` slot is ever written.
pub(crate) fn backward_operands<'a>(
    op: &'static str,
    max_in_grad: usize,
    out_grad: &'a [TensorAny],
    req: &[WriteReq],
    in_grad: &'a [TensorAny],
) -> Result<(&'a Tensor<f32>, &'a Tensor<f32>, WriteReq), OpError> {
    check_count(op, "output gradients", 1, out_grad.len())?;
    if in_grad.is_empty() || in_grad.len() > max_in_grad {
        return Err(OpError::ArgumentCount {
            op,
            what: "input gradients",
            expected: max_in_grad,
            found: in_grad.len(),
        });
    }
    check_count(op, "write requests", in_grad.len(), req.len())?;
    let grad = f32_arg(op, "output_grad", &out_grad[OUT])?;
    let gdata = f32_arg(op, "data_grad", &in_grad[DATA])?;
    check_shape(op, "data_grad", grad, gdata)?;
    Ok((grad, gdata, req[DATA]))
}

/// Ids at `picks`; a slot the host did not supply is skipped
pub(crate) fn select(picks: &[(&[TensorId], usize)]) -> Vec<TensorId> {
    picks.iter().filter_map(|(ids, i)| ids.get(*i).copied()).collect()
}

/// `[(src[si], dst[di])]`, or nothing when either slot is missing
pub(crate) fn inplace_pair(src: &[TensorId], si: usize, dst: &[TensorId], di: usize) -> Vec<(TensorId, TensorId)> {
    src.get(si).zip(dst.get(di)).map(|(&s, &d)| (s, d)).into_iter().collect()
}

/// Output shape = primary input shape, or "not yet" while it is unknown
pub(crate) fn infer_from_data(op: &'static str, n_args: usize, in_shapes: &[Shape]) -> Result<Vec<Shape>, OpError> {
    check_count(op, "input shapes", n_args, in_shapes.len())?;
    let dshape = &in_shapes[DATA];
    if dshape.is_empty() {
        tracing::trace!(op, "data shape unknown, deferring");
        return Err(OpError::IncompleteShape { op, arg: "data" });
    }
    Ok(vec![dshape.clone()])
}

/// Every argument must be `f32`; the output takes the data type
pub(crate) fn infer_f32(op: &'static str, args: &[&'static str], in_types: &[DataType]) -> Result<Vec<DataType>, OpError> {
    check_count(op, "input types", args.len(), in_types.len())?;
    for (&arg, &found) in args.iter().zip(in_types) {
        if found != DataType::F32 {
            return Err(OpError::DtypeMismatch { op, arg, expected: vec![DataType::F32], found });
        }
    }
    Ok(vec![in_types[DATA]])
}
