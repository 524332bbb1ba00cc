//! Constant tensors (graph initializers).

use half::{bf16, f16};

use crate::error::IrError;

/// Element data type, numbered after ONNX `TensorProto.DataType`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum DataType {
    Float,
    Uint8,
    Int8,
    Uint16,
    Int16,
    Int32,
    Int64,
    String,
    Bool,
    Float16,
    Double,
    Uint32,
    Uint64,
    BFloat16,
    /// A data type code this crate does not name.
    Other(i32),
}

impl DataType {
    /// Maps an ONNX data type code.
    pub fn from_onnx(code: i32) -> Self {
        match code {
            1 => Self::Float,
            2 => Self::Uint8,
            3 => Self::Int8,
            4 => Self::Uint16,
            5 => Self::Int16,
            6 => Self::Int32,
            7 => Self::Int64,
            8 => Self::String,
            9 => Self::Bool,
            10 => Self::Float16,
            11 => Self::Double,
            12 => Self::Uint32,
            13 => Self::Uint64,
            16 => Self::BFloat16,
            other => Self::Other(other),
        }
    }

    /// Returns the ONNX data type code.
    pub fn onnx_code(self) -> i32 {
        match self {
            Self::Float => 1,
            Self::Uint8 => 2,
            Self::Int8 => 3,
            Self::Uint16 => 4,
            Self::Int16 => 5,
            Self::Int32 => 6,
            Self::Int64 => 7,
            Self::String => 8,
            Self::Bool => 9,
            Self::Float16 => 10,
            Self::Double => 11,
            Self::Uint32 => 12,
            Self::Uint64 => 13,
            Self::BFloat16 => 16,
            Self::Other(code) => code,
        }
    }

    /// Size of one element in bytes, or `None` for variable-width types.
    pub fn byte_width(self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 | Self::Bool => Some(1),
            Self::Uint16 | Self::Int16 | Self::Float16 | Self::BFloat16 => Some(2),
            Self::Float | Self::Int32 | Self::Uint32 => Some(4),
            Self::Double | Self::Int64 | Self::Uint64 => Some(8),
            Self::String | Self::Other(_) => None,
        }
    }

    /// Returns `true` for the floating-point types.
    pub fn is_float(self) -> bool {
        matches!(
            self,
            Self::Float | Self::Double | Self::Float16 | Self::BFloat16
        )
    }
}

/// Flat element buffer of a [`Tensor`], row-major.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    /// Little-endian bytes for element types without a typed variant.
    Raw(Vec<u8>),
}

impl TensorData {
    /// Number of elements, or `None` for raw buffers.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::F32(v) => Some(v.len()),
            Self::F64(v) => Some(v.len()),
            Self::F16(v) => Some(v.len()),
            Self::BF16(v) => Some(v.len()),
            Self::I32(v) => Some(v.len()),
            Self::I64(v) => Some(v.len()),
            Self::Raw(_) => None,
        }
    }

    /// The data type implied by a typed variant.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Self::F32(_) => Some(DataType::Float),
            Self::F64(_) => Some(DataType::Double),
            Self::F16(_) => Some(DataType::Float16),
            Self::BF16(_) => Some(DataType::BFloat16),
            Self::I32(_) => Some(DataType::Int32),
            Self::I64(_) => Some(DataType::Int64),
            Self::Raw(_) => None,
        }
    }
}

/// A named constant tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub dtype: DataType,
    /// Dimension sizes, outermost first. Empty for a scalar.
    pub dims: Vec<i64>,
    pub data: TensorData,
}

macro_rules! typed_ctor {
    ($ctor:ident, $ty:ty, $variant:ident, $dtype:ident) => {
        #[doc = concat!("Creates a `", stringify!($ty), "` tensor.")]
        pub fn $ctor(name: impl Into<String>, dims: Vec<i64>, data: Vec<$ty>) -> Self {
            Self {
                name: name.into(),
                dtype: DataType::$dtype,
                dims,
                data: TensorData::$variant(data),
            }
        }
    };
}

impl Tensor {
    typed_ctor!(from_f32, f32, F32, Float);
    typed_ctor!(from_f64, f64, F64, Double);
    typed_ctor!(from_f16, f16, F16, Float16);
    typed_ctor!(from_bf16, bf16, BF16, BFloat16);
    typed_ctor!(from_i32, i32, I32, Int32);
    typed_ctor!(from_i64, i64, I64, Int64);

    /// Creates a tensor backed by little-endian bytes.
    pub fn from_raw(
        name: impl Into<String>,
        dtype: DataType,
        dims: Vec<i64>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims,
            data: TensorData::Raw(bytes),
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements implied by `dims` (1 for a scalar).
    pub fn element_count(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| {
            let d = usize::try_from(d).ok()?;
            acc.checked_mul(d)
        })
    }

    /// `dims` as unsigned sizes, or `None` if any dimension is negative.
    pub fn shape(&self) -> Option<Vec<usize>> {
        self.dims.iter().map(|&d| usize::try_from(d).ok()).collect()
    }

    /// Returns the f32 buffer if this is an f32 tensor.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Checks that the buffer agrees with `dtype` and `dims`.
    pub fn validate(&self) -> Result<(), IrError> {
        let expected = self
            .element_count()
            .ok_or_else(|| IrError::InvalidDims(self.name.clone(), self.dims.clone()))?;

        if let Some(dtype) = self.data.data_type()
            && dtype != self.dtype
        {
            return Err(IrError::DataTypeMismatch {
                tensor: self.name.clone(),
                declared: self.dtype,
                stored: dtype,
            });
        }

        let (actual, exact) = match &self.data {
            TensorData::Raw(bytes) => match self.dtype.byte_width() {
                Some(width) => (bytes.len() / width, bytes.len() % width == 0),
                // Variable-width payloads cannot be checked here.
                None => return Ok(()),
            },
            typed => (typed.len().unwrap_or_default(), true),
        };

        if actual != expected || !exact {
            return Err(IrError::ElementCountMismatch {
                tensor: self.name.clone(),
                expected,
                actual,
            });
        }
        Ok(())
    }
}
