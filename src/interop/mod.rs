pub mod onnx;

use std::fmt;

use crate::session::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteropErrorKind {
    /// The bytes are not a valid ONNX protobuf.
    Decode,
    /// Valid ONNX that uses an op, attribute or dtype the importer does not handle.
    Unsupported,
    /// Structurally inconsistent model (dangling names, missing graph, bad payloads).
    Malformed,
    /// The session rejected an imported op, usually on shape grounds.
    Graph,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteropError {
    pub kind: InteropErrorKind,
    pub message: String,
}

impl InteropError {
    pub fn new(kind: InteropErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(InteropErrorKind::Unsupported, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(InteropErrorKind::Malformed, message)
    }
}

impl fmt::Display for InteropError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for InteropError {}

impl From<SessionError> for InteropError {
    fn from(err: SessionError) -> Self {
        InteropError::new(InteropErrorKind::Graph, err.to_string())
    }
}

impl From<prost::DecodeError> for InteropError {
    fn from(err: prost::DecodeError) -> Self {
        InteropError::new(InteropErrorKind::Decode, err.to_string())
    }
}

pub use onnx::{OnnxImport, import_onnx_bytes, import_onnx_model};
