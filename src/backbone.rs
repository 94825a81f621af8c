//! Pretrained feature extractor restored from an ONNX artifact.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::interop::{InteropError, InteropErrorKind, OnnxImport, import_onnx_bytes};
use crate::ir::ValueId;
use crate::session::{Session, SessionError, VariableOrigin};

/// File looked up when the backbone path is a directory.
pub const SAVED_MODEL_FILE: &str = "saved_model.onnx";

pub const IMAGE_INPUT: &str = "image_input";
pub const KEEP_PROB: &str = "keep_prob";
pub const LAYER3_OUT: &str = "layer3_out";
pub const LAYER4_OUT: &str = "layer4_out";
pub const LAYER7_OUT: &str = "layer7_out";

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error("cannot read backbone artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("backbone artifact is not valid ONNX: {0}")]
    Decode(String),
    #[error("backbone graph has no tensor named '{0}'")]
    NotFound(String),
    #[error("unsupported backbone graph: {0}")]
    Unsupported(String),
    #[error("backbone graph rejected: {0}")]
    Graph(String),
}

impl From<InteropError> for BackboneError {
    fn from(err: InteropError) -> Self {
        match err.kind {
            InteropErrorKind::Decode => BackboneError::Decode(err.message),
            InteropErrorKind::Unsupported | InteropErrorKind::Malformed => {
                BackboneError::Unsupported(err.message)
            }
            InteropErrorKind::Graph => BackboneError::Graph(err.message),
        }
    }
}

impl From<SessionError> for BackboneError {
    fn from(err: SessionError) -> Self {
        BackboneError::Graph(err.to_string())
    }
}

/// The five backbone tensors the decoder attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackboneTensors {
    pub image_input: ValueId,
    pub keep_prob: ValueId,
    /// Stride 8 feature map.
    pub layer3_out: ValueId,
    /// Stride 16 feature map.
    pub layer4_out: ValueId,
    /// Stride 32 feature map.
    pub layer7_out: ValueId,
}

/// Restores the backbone at `path` into `session`. `path` is either an
/// `.onnx` file or a directory holding [`SAVED_MODEL_FILE`].
pub fn load_backbone(session: &mut Session, path: &Path) -> Result<BackboneTensors, BackboneError> {
    let file = if path.is_dir() {
        path.join(SAVED_MODEL_FILE)
    } else {
        path.to_path_buf()
    };
    let bytes = std::fs::read(&file).map_err(|source| BackboneError::Io {
        path: file.clone(),
        source,
    })?;
    let tensors = load_backbone_bytes(session, &bytes)?;
    info!(path = %file.display(), "loaded backbone");
    Ok(tensors)
}

pub fn load_backbone_bytes(
    session: &mut Session,
    bytes: &[u8],
) -> Result<BackboneTensors, BackboneError> {
    let import = import_onnx_bytes(session, bytes, VariableOrigin::Backbone)?;
    let tensors = BackboneTensors {
        image_input: resolve(&import, IMAGE_INPUT)?,
        keep_prob: resolve(&import, KEEP_PROB)?,
        layer3_out: resolve(&import, LAYER3_OUT)?,
        layer4_out: resolve(&import, LAYER4_OUT)?,
        layer7_out: resolve(&import, LAYER7_OUT)?,
    };

    let image_rank = session.shape(tensors.image_input).map(<[usize]>::len);
    if image_rank != Some(4) {
        return Err(BackboneError::Unsupported(format!(
            "'{IMAGE_INPUT}' must be an image placeholder, got rank {image_rank:?}"
        )));
    }
    if session.shape(tensors.keep_prob) != Some(&[][..]) {
        return Err(BackboneError::Unsupported(format!(
            "'{KEEP_PROB}' must be a scalar placeholder"
        )));
    }
    for (name, value) in [
        (LAYER3_OUT, tensors.layer3_out),
        (LAYER4_OUT, tensors.layer4_out),
        (LAYER7_OUT, tensors.layer7_out),
    ] {
        let shape = session.static_shape(value)?;
        if shape.len() != 4 {
            return Err(BackboneError::Unsupported(format!(
                "'{name}' must be a feature map, got shape {shape:?}"
            )));
        }
    }
    Ok(tensors)
}

/// Graph exporters often keep the framework's `:0` output suffix.
fn resolve(import: &OnnxImport, name: &str) -> Result<ValueId, BackboneError> {
    import
        .value(name)
        .or_else(|| import.value(&format!("{name}:0")))
        .ok_or_else(|| BackboneError::NotFound(name.to_string()))
}
