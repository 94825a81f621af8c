use thiserror::Error;
use tracing::debug;

use crate::ir::{Op, OptimizerConfig, ValueId};
use crate::model::RegularizationLosses;
use crate::session::{Session, SessionError, TrainStep, VariableOrigin};

#[derive(Debug, Error)]
pub enum ObjectiveError {
    #[error("objective shape error: {0}")]
    Shape(String),
    #[error("'{name}' has {actual} classes on its last axis, expected {expected}")]
    ClassMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Session(SessionError),
}

impl From<SessionError> for ObjectiveError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Shape(shape) => ObjectiveError::Shape(shape.message),
            other => ObjectiveError::Session(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveConfig {
    /// Leave backbone variables out of the optimizer's variable list.
    pub freeze_backbone: bool,
    pub optimizer: OptimizerConfig,
}

impl Default for ObjectiveConfig {
    fn default() -> Self {
        Self {
            freeze_backbone: false,
            optimizer: OptimizerConfig::adam(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Objective {
    /// `[N * H * W, num_classes]`.
    pub logits: ValueId,
    pub train_op: TrainStep,
    /// Cross-entropy plus every registered penalty.
    pub loss: ValueId,
    /// Mean cross-entropy alone.
    pub cross_entropy: ValueId,
}

/// Defines the training objective on top of the decoder output and builds
/// the train step that minimizes it.
pub fn optimize(
    session: &mut Session,
    nn_last_layer: ValueId,
    correct_label: ValueId,
    learning_rate: ValueId,
    num_classes: usize,
    regularizers: &RegularizationLosses,
    config: &ObjectiveConfig,
) -> Result<Objective, ObjectiveError> {
    for (name, value) in [("nn_last_layer", nn_last_layer), ("correct_label", correct_label)] {
        let actual = session.static_shape(value)?.last().copied().unwrap_or(1);
        if actual != num_classes {
            return Err(ObjectiveError::ClassMismatch {
                name,
                expected: num_classes,
                actual,
            });
        }
    }
    let classes = isize::try_from(num_classes)
        .map_err(|_| ObjectiveError::Shape(format!("num_classes {num_classes} overflows")))?;

    let logits = session.add(Op::Reshape {
        input: nn_last_layer,
        shape: vec![-1, classes],
    })?;
    session.set_name("objective/logits", logits)?;
    let labels = session.add(Op::Reshape {
        input: correct_label,
        shape: vec![-1, classes],
    })?;
    let cross_entropy = session.add(Op::SoftmaxCrossEntropy { logits, labels })?;
    session.set_name("objective/cross_entropy", cross_entropy)?;

    let loss = match regularizers.total(session)? {
        Some(penalty) => session.add(Op::Add(cross_entropy, penalty))?,
        None => cross_entropy,
    };
    if loss != cross_entropy {
        session.set_name("objective/loss", loss)?;
    }

    let var_list: Vec<ValueId> = session
        .variables()
        .filter(|var| !config.freeze_backbone || var.origin != VariableOrigin::Backbone)
        .map(|var| var.value)
        .collect();
    debug!(
        trainable = var_list.len(),
        penalties = regularizers.len(),
        freeze_backbone = config.freeze_backbone,
        "building train step"
    );
    let train_op = session.minimize(loss, &var_list, learning_rate, config.optimizer)?;

    Ok(Objective {
        logits,
        train_op,
        loss,
        cross_entropy,
    })
}
