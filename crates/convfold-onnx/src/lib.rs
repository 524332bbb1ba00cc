//! ONNX model import and export for convfold.
//!
//! Decodes `.onnx` files with prost into the convfold graph IR and writes the
//! (optimized) graph back out. Operator since-versions are resolved from the
//! model's opset imports at import time so that passes can match on exact
//! operator definitions.

mod export;
mod import;
#[doc(hidden)]
pub mod proto;
mod schema;

pub use export::{export_graph, export_model, save_model};
pub use import::{ImportOptions, import_graph, import_model, load_model};
pub use schema::{OpsetVersions, since_version};

/// IR version written when the model does not carry one.
pub const DEFAULT_IR_VERSION: i64 = 8;

/// Errors raised while reading an ONNX model.
#[derive(Debug, thiserror::Error)]
pub enum OnnxError {
    #[error("failed to decode ONNX protobuf: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("model has no graph")]
    MissingGraph,

    #[error("model does not import the default ONNX opset")]
    MissingDefaultOpset,

    /// A value is produced, declared or initialized more than once.
    #[error("value '{0}' is defined more than once")]
    Redefined(String),

    #[error("node '{node}': {message}")]
    InvalidNode { node: String, message: String },

    #[error("unsupported: {0}")]
    Unsupported(String),
}
