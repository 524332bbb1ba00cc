//! Operator identification: kind, since-version and domain.

use std::fmt;

/// The default ONNX operator domain.
pub const ONNX_DOMAIN: &str = "";

/// Alias under which the default ONNX domain is sometimes spelled.
pub const ONNX_DOMAIN_ALIAS: &str = "ai.onnx";

/// The operator kind for a graph node.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum OpKind {
    /// Convolution.
    Conv,
    /// Element-wise multiplication.
    Mul,
    /// Element-wise addition.
    Add,
    /// Element-wise subtraction.
    Sub,
    /// Element-wise division.
    Div,
    /// Matrix multiplication.
    MatMul,
    /// Rectified Linear Unit activation.
    Relu,
    /// Sigmoid activation.
    Sigmoid,
    /// Batch normalization.
    BatchNorm,
    /// Reshape/view.
    Reshape,
    /// Identity.
    Identity,
    /// Conditional with `then_branch` / `else_branch` bodies.
    If,
    /// Loop with a `body` graph.
    Loop,
    /// Scan with a `body` graph.
    Scan,
    /// Any operator not listed above.
    Custom(String),
}

impl OpKind {
    /// Parses an ONNX `op_type` string.
    pub fn from_onnx(op_type: &str) -> Self {
        match op_type {
            "Conv" => Self::Conv,
            "Mul" => Self::Mul,
            "Add" => Self::Add,
            "Sub" => Self::Sub,
            "Div" => Self::Div,
            "MatMul" => Self::MatMul,
            "Relu" => Self::Relu,
            "Sigmoid" => Self::Sigmoid,
            "BatchNormalization" => Self::BatchNorm,
            "Reshape" => Self::Reshape,
            "Identity" => Self::Identity,
            "If" => Self::If,
            "Loop" => Self::Loop,
            "Scan" => Self::Scan,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Returns the ONNX operator type string.
    pub fn onnx_op_type(&self) -> &str {
        match self {
            Self::Conv => "Conv",
            Self::Mul => "Mul",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Div => "Div",
            Self::MatMul => "MatMul",
            Self::Relu => "Relu",
            Self::Sigmoid => "Sigmoid",
            Self::BatchNorm => "BatchNormalization",
            Self::Reshape => "Reshape",
            Self::Identity => "Identity",
            Self::If => "If",
            Self::Loop => "Loop",
            Self::Scan => "Scan",
            Self::Custom(op_type) => op_type,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.onnx_op_type())
    }
}

/// Full operator identity of a node.
///
/// `since_version` is the opset version in which the operator's current
/// definition was introduced, not the opset the model imports.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OpType {
    pub kind: OpKind,
    pub since_version: u32,
    pub domain: String,
}

impl OpType {
    /// An operator from the default ONNX domain.
    pub fn onnx(kind: OpKind, since_version: u32) -> Self {
        Self {
            kind,
            since_version,
            domain: ONNX_DOMAIN.to_string(),
        }
    }

    /// Returns `true` if the operator lives in the default ONNX domain.
    pub fn is_onnx_domain(&self) -> bool {
        is_onnx_domain(&self.domain)
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_onnx_domain() {
            write!(f, "{}-{}", self.kind, self.since_version)
        } else {
            write!(f, "{}::{}-{}", self.domain, self.kind, self.since_version)
        }
    }
}

/// Returns `true` for both spellings of the default ONNX domain.
pub fn is_onnx_domain(domain: &str) -> bool {
    domain == ONNX_DOMAIN || domain == ONNX_DOMAIN_ALIAS
}
