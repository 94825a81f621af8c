use thiserror::Error;
use tracing::{info, warn};

use crate::data::{BatchSource, DatasetError};
use crate::ir::{Tensor, ValueId};
use crate::session::{Session, SessionError, TrainStep};

#[derive(Debug, Error)]
pub enum TrainLoopError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("batch_size must be at least 1")]
    ZeroBatchSize,
    #[error("train step returned no loss value")]
    MissingLoss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainLoopConfig {
    pub epochs: usize,
    pub batch_size: usize,
}

impl Default for TrainLoopConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            batch_size: 32,
        }
    }
}

/// Values fed alongside every minibatch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepConfig {
    pub keep_prob: f32,
    pub learning_rate: f32,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            keep_prob: 0.6,
            learning_rate: 0.0005,
        }
    }
}

/// Chooses the per-step hyperparameters.
pub trait StepSchedule {
    fn step_config(&self, epoch: usize, step: u64) -> StepConfig;
}

impl StepSchedule for StepConfig {
    fn step_config(&self, _epoch: usize, _step: u64) -> StepConfig {
        *self
    }
}

/// Graph handles the loop feeds and fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainTensors {
    pub input_image: ValueId,
    pub correct_label: ValueId,
    pub keep_prob: ValueId,
    pub learning_rate: ValueId,
    pub train_op: TrainStep,
    pub loss: ValueId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub steps: usize,
    /// Mean over finite step losses; `NaN` when there were none.
    pub mean_loss: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    pub epochs: Vec<EpochSummary>,
    pub total_steps: u64,
}

impl TrainReport {
    #[must_use]
    pub fn final_loss(&self) -> Option<f32> {
        self.epochs.last().map(|epoch| epoch.mean_loss)
    }
}

/// Initializes every variable once, then runs one train step per minibatch
/// for `config.epochs` epochs.
pub fn train_nn(
    session: &mut Session,
    config: &TrainLoopConfig,
    batches: &mut dyn BatchSource,
    tensors: &TrainTensors,
    schedule: &dyn StepSchedule,
) -> Result<TrainReport, TrainLoopError> {
    if config.batch_size == 0 {
        return Err(TrainLoopError::ZeroBatchSize);
    }
    session.initialize_variables()?;

    let mut report = TrainReport::default();
    for epoch in 0..config.epochs {
        info!(epoch, "starting epoch");
        let mut steps = 0_usize;
        let mut loss_sum = 0.0_f64;
        let mut finite = 0_usize;

        for batch in batches.batches(config.batch_size)? {
            let batch = batch?;
            let step_config = schedule.step_config(epoch, session.global_step());
            let fetched = session.run_train_step(
                tensors.train_op,
                &[tensors.loss],
                vec![
                    (tensors.input_image, batch.images),
                    (tensors.correct_label, batch.labels),
                    (tensors.keep_prob, Tensor::scalar(step_config.keep_prob)),
                    (tensors.learning_rate, Tensor::scalar(step_config.learning_rate)),
                ],
            )?;
            let loss = fetched
                .first()
                .ok_or(TrainLoopError::MissingLoss)?
                .scalar_value()
                .map_err(SessionError::from)?;
            steps += 1;
            report.total_steps += 1;

            if loss.is_finite() {
                loss_sum += f64::from(loss);
                finite += 1;
                info!(epoch, step = report.total_steps, loss, "train step");
            } else {
                warn!(epoch, step = report.total_steps, loss, "non-finite loss");
            }
        }

        let mean_loss = if finite == 0 {
            f32::NAN
        } else {
            (loss_sum / finite as f64) as f32
        };
        info!(epoch, steps, mean_loss, "finished epoch");
        report.epochs.push(EpochSummary { steps, mean_loss });
    }
    Ok(report)
}
