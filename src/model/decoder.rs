//! Skip-connected upsampling decoder (FCN-8s).
//!
//! ```text
//! deep   (1/32) -- 1x1 conv --> num_classes -- up x2 --+
//! mid    (1/16) ---------------------------------------(+)-- up x2 --+
//! shallow (1/8) ----------------------------------------------------(+)-- up x8 --> logits
//! ```
//!
//! Each upsample is a learned transposed convolution with same padding, so
//! the three factors multiply back to the backbone's total stride.

use thiserror::Error;
use tracing::debug;

use crate::ir::{Op, ValueId};
use crate::model::{Conv2DLayer, Conv2DTransposeLayer, Layer, RegularizationLosses};
use crate::session::{Session, SessionError};

/// Upsampling factors applied after the deep, first fused and second fused maps.
pub const UPSAMPLE_FACTORS: [usize; 3] = [2, 2, 8];
/// Total downsampling between the input image and the deepest feature map.
pub const BACKBONE_STRIDE: usize = 32;

const _: () =
    assert!(UPSAMPLE_FACTORS[0] * UPSAMPLE_FACTORS[1] * UPSAMPLE_FACTORS[2] == BACKBONE_STRIDE);

pub const DEFAULT_L2_SCALE: f32 = 1e-4;

#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("decoder shape error: {0}")]
    Shape(String),
    #[error("num_classes must be at least 1")]
    NoClasses,
    #[error("decoder output is {actual:?} but the image shape is {expected:?}")]
    OutputSize {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error(transparent)]
    Session(SessionError),
}

impl From<SessionError> for DecoderError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Shape(shape) => DecoderError::Shape(shape.message),
            other => DecoderError::Session(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderConfig {
    /// `(height, width)` the logits must match.
    pub image_shape: (usize, usize),
    pub l2_scale: f32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            image_shape: (160, 576),
            l2_scale: DEFAULT_L2_SCALE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// `[batch, H, W, num_classes]`.
    pub logits: ValueId,
    /// One L2 penalty per decoder kernel.
    pub regularizers: RegularizationLosses,
}

/// Builds the decoder on the shallow (1/8), mid (1/16) and deep (1/32)
/// feature maps.
pub fn layers(
    session: &mut Session,
    shallow: ValueId,
    mid: ValueId,
    deep: ValueId,
    num_classes: usize,
    config: &DecoderConfig,
) -> Result<DecoderOutput, DecoderError> {
    if num_classes == 0 {
        return Err(DecoderError::NoClasses);
    }
    let mid_channels = channels(session, mid, "mid feature map")?;
    let shallow_channels = channels(session, shallow, "shallow feature map")?;
    let l2 = Some(config.l2_scale);
    let mut regularizers = RegularizationLosses::new();

    let score = Conv2DLayer {
        name: "decoder/score_deep".to_string(),
        filters: num_classes,
        kernel_size: 1,
        stride: 1,
        l2_scale: l2,
    }
    .build(session, deep, &mut regularizers)?;

    let up_deep = upsample("decoder/upsample_deep", mid_channels, UPSAMPLE_FACTORS[0], l2)
        .build(session, score, &mut regularizers)?;
    let fuse_mid = fuse(session, up_deep, mid, "decoder/fuse_mid")?;

    let up_mid = upsample("decoder/upsample_mid", shallow_channels, UPSAMPLE_FACTORS[1], l2)
        .build(session, fuse_mid, &mut regularizers)?;
    let fuse_shallow = fuse(session, up_mid, shallow, "decoder/fuse_shallow")?;

    let up_final = upsample("decoder/upsample_final", num_classes, UPSAMPLE_FACTORS[2], l2)
        .build(session, fuse_shallow, &mut regularizers)?;

    let (height, width) = config.image_shape;
    let out_shape = session.static_shape(up_final)?;
    let actual = (out_shape[1], out_shape[2]);
    if actual != config.image_shape {
        return Err(DecoderError::OutputSize {
            expected: config.image_shape,
            actual,
        });
    }

    let logits = session.add(Op::Reshape {
        input: up_final,
        shape: vec![-1, signed(height)?, signed(width)?, signed(num_classes)?],
    })?;
    session.set_name("decoder/logits", logits)?;
    debug!(
        ?out_shape,
        penalties = regularizers.len(),
        "built decoder"
    );

    Ok(DecoderOutput {
        logits,
        regularizers,
    })
}

/// Transposed conv with kernel `2 * factor`, which covers every output pixel
/// with same padding.
fn upsample(
    name: &str,
    filters: usize,
    factor: usize,
    l2_scale: Option<f32>,
) -> Conv2DTransposeLayer {
    Conv2DTransposeLayer {
        name: name.to_string(),
        filters,
        kernel_size: factor * 2,
        stride: factor,
        l2_scale,
    }
}

fn fuse(
    session: &mut Session,
    upsampled: ValueId,
    skip: ValueId,
    name: &str,
) -> Result<ValueId, DecoderError> {
    let up_shape = session.static_shape(upsampled)?;
    let skip_shape = session.static_shape(skip)?;
    if up_shape != skip_shape {
        return Err(DecoderError::Shape(format!(
            "{name}: upsampled {up_shape:?} does not match skip connection {skip_shape:?}"
        )));
    }
    let fused = session.add(Op::Add(upsampled, skip))?;
    session.set_name(name, fused)?;
    Ok(fused)
}

fn channels(session: &Session, value: ValueId, what: &str) -> Result<usize, DecoderError> {
    match session.static_shape(value)?.as_slice() {
        [_, _, _, c] => Ok(*c),
        other => Err(DecoderError::Shape(format!(
            "{what} must be [batch, h, w, c], got {other:?}"
        ))),
    }
}

fn signed(dim: usize) -> Result<isize, DecoderError> {
    isize::try_from(dim).map_err(|_| DecoderError::Shape(format!("dimension {dim} overflows")))
}
