//! Arithmetic on initializer tensors.
//!
//! Every operation is out-of-place: inputs are borrowed and a new [`Tensor`]
//! carrying the left operand's name, dims and data type is returned. Half
//! precision values are multiplied through `half`, which computes in f32 and
//! rounds once to the element type.

use std::ops::Mul;

use convfold_ir::{DataType, IrError, Tensor, TensorData};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, ShapeError, Zip};

/// Errors produced by initializer arithmetic.
#[derive(Debug, thiserror::Error)]
pub enum AlgebraError {
    #[error("tensor '{tensor}' has unsupported data type {dtype}")]
    UnsupportedDataType { tensor: String, dtype: DataType },

    #[error("data type mismatch: '{lhs}' is {lhs_type}, '{rhs}' is {rhs_type}")]
    DataTypeMismatch {
        lhs: String,
        lhs_type: DataType,
        rhs: String,
        rhs_type: DataType,
    },

    #[error("axis {axis} out of range for tensor '{tensor}' of rank {rank}")]
    AxisOutOfRange {
        tensor: String,
        axis: usize,
        rank: usize,
    },

    #[error("scale '{scale}' has {len} values but axis {axis} of '{tensor}' has size {dim}")]
    LengthMismatch {
        tensor: String,
        scale: String,
        axis: usize,
        dim: usize,
        len: usize,
    },

    #[error("cannot broadcast '{rhs}' {rhs_dims:?} onto '{lhs}' {lhs_dims:?}")]
    ShapeMismatch {
        lhs: String,
        lhs_dims: Vec<i64>,
        rhs: String,
        rhs_dims: Vec<i64>,
    },

    #[error(transparent)]
    Malformed(#[from] IrError),

    #[error("buffer does not fit its shape: {0}")]
    Shape(#[from] ShapeError),
}

/// Returns `true` for element types initializer arithmetic supports.
pub fn is_supported_data_type(dtype: DataType) -> bool {
    matches!(
        dtype,
        DataType::Float | DataType::Double | DataType::Float16 | DataType::BFloat16
    )
}

/// Multiplies every element of `tensor` by a factor chosen by its coordinate
/// along `axis`.
///
/// A rank-0 `scale` applies its single value everywhere. Otherwise `scale`
/// must hold exactly `tensor.dims[axis]` values and the element at coordinate
/// `i` along `axis` is multiplied by `scale[i]`, whatever the shape of `scale`.
pub fn scale_along_axis(
    tensor: &Tensor,
    scale: &Tensor,
    axis: usize,
) -> Result<Tensor, AlgebraError> {
    check_operands(tensor, scale)?;
    let shape = dims_of(tensor)?;

    if axis >= shape.len() {
        return Err(AlgebraError::AxisOutOfRange {
            tensor: tensor.name.clone(),
            axis,
            rank: shape.len(),
        });
    }

    let lane_axis = if scale.rank() == 0 {
        None
    } else {
        let len = scale.element_count().unwrap_or_default();
        if len != shape[axis] {
            return Err(AlgebraError::LengthMismatch {
                tensor: tensor.name.clone(),
                scale: scale.name.clone(),
                axis,
                dim: shape[axis],
                len,
            });
        }
        Some(Axis(axis))
    };

    let data = match (&tensor.data, &scale.data) {
        (TensorData::F32(x), TensorData::F32(s)) => {
            TensorData::F32(scale_lanes(x, &shape, s, lane_axis)?)
        }
        (TensorData::F64(x), TensorData::F64(s)) => {
            TensorData::F64(scale_lanes(x, &shape, s, lane_axis)?)
        }
        (TensorData::F16(x), TensorData::F16(s)) => {
            TensorData::F16(scale_lanes(x, &shape, s, lane_axis)?)
        }
        (TensorData::BF16(x), TensorData::BF16(s)) => {
            TensorData::BF16(scale_lanes(x, &shape, s, lane_axis)?)
        }
        _ => return Err(raw_buffer_error(tensor, scale)),
    };

    Ok(with_data(tensor, data))
}

/// Element-wise product of `lhs` and `rhs`, with `rhs` broadcast onto the
/// shape of `lhs` (a rank-0 `rhs` scales every element).
pub fn multiply(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, AlgebraError> {
    check_operands(lhs, rhs)?;
    let lhs_shape = dims_of(lhs)?;
    let rhs_shape = dims_of(rhs)?;

    let product = match (&lhs.data, &rhs.data) {
        (TensorData::F32(x), TensorData::F32(y)) => {
            broadcast_mul(x, &lhs_shape, y, &rhs_shape).map(TensorData::F32)
        }
        (TensorData::F64(x), TensorData::F64(y)) => {
            broadcast_mul(x, &lhs_shape, y, &rhs_shape).map(TensorData::F64)
        }
        (TensorData::F16(x), TensorData::F16(y)) => {
            broadcast_mul(x, &lhs_shape, y, &rhs_shape).map(TensorData::F16)
        }
        (TensorData::BF16(x), TensorData::BF16(y)) => {
            broadcast_mul(x, &lhs_shape, y, &rhs_shape).map(TensorData::BF16)
        }
        _ => return Err(raw_buffer_error(lhs, rhs)),
    };
    let data = product.ok_or_else(|| AlgebraError::ShapeMismatch {
        lhs: lhs.name.clone(),
        lhs_dims: lhs.dims.clone(),
        rhs: rhs.name.clone(),
        rhs_dims: rhs.dims.clone(),
    })?;

    Ok(with_data(lhs, data))
}

fn check_operands(lhs: &Tensor, rhs: &Tensor) -> Result<(), AlgebraError> {
    for t in [lhs, rhs] {
        if !is_supported_data_type(t.dtype) {
            return Err(AlgebraError::UnsupportedDataType {
                tensor: t.name.clone(),
                dtype: t.dtype,
            });
        }
    }
    if lhs.dtype != rhs.dtype {
        return Err(AlgebraError::DataTypeMismatch {
            lhs: lhs.name.clone(),
            lhs_type: lhs.dtype,
            rhs: rhs.name.clone(),
            rhs_type: rhs.dtype,
        });
    }
    lhs.validate()?;
    rhs.validate()?;
    Ok(())
}

/// Non-negative dims of a validated tensor.
fn dims_of(tensor: &Tensor) -> Result<Vec<usize>, AlgebraError> {
    tensor
        .shape()
        .ok_or_else(|| IrError::InvalidDims(tensor.name.clone(), tensor.dims.clone()).into())
}

fn raw_buffer_error(lhs: &Tensor, rhs: &Tensor) -> AlgebraError {
    let offender = if lhs.data.data_type().is_none() { lhs } else { rhs };
    AlgebraError::UnsupportedDataType {
        tensor: offender.name.clone(),
        dtype: offender.dtype,
    }
}

fn with_data(template: &Tensor, data: TensorData) -> Tensor {
    Tensor {
        name: template.name.clone(),
        dtype: template.dtype,
        dims: template.dims.clone(),
        data,
    }
}

/// `data` viewed with `shape`, each lane along `axis` scaled by its factor.
/// `axis == None` means `scale` holds a single factor for every element.
fn scale_lanes<T>(
    data: &[T],
    shape: &[usize],
    scale: &[T],
    axis: Option<Axis>,
) -> Result<Vec<T>, ShapeError>
where
    T: Copy + Mul<Output = T>,
{
    let mut out = ArrayD::from_shape_vec(IxDyn(shape), data.to_vec())?;

    match axis {
        None => {
            let factor = scale[0];
            out.mapv_inplace(|x| x * factor);
        }
        Some(axis) => {
            for (mut lane, &factor) in out.axis_iter_mut(axis).zip(scale) {
                lane.mapv_inplace(|x| x * factor);
            }
        }
    }

    Ok(out.into_raw_vec_and_offset().0)
}

/// `lhs * rhs` with `rhs` broadcast to `lhs_shape`, or `None` if it does not
/// broadcast.
fn broadcast_mul<T>(
    lhs: &[T],
    lhs_shape: &[usize],
    rhs: &[T],
    rhs_shape: &[usize],
) -> Option<Vec<T>>
where
    T: Copy + Mul<Output = T>,
{
    let mut out = ArrayD::from_shape_vec(IxDyn(lhs_shape), lhs.to_vec()).ok()?;
    let rhs = ArrayViewD::from_shape(IxDyn(rhs_shape), rhs).ok()?;
    let rhs = rhs.broadcast(out.raw_dim())?;

    Zip::from(&mut out).and(&rhs).for_each(|x, &y| *x = *x * y);

    Some(out.into_raw_vec_and_offset().0)
}
