//! End-to-end run: backbone, decoder, objective, training and inference
//! samples, wired from a [`RunConfig`].

use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::backbone::{BackboneError, BackboneTensors, load_backbone};
use crate::config::RunConfig;
use crate::data::{
    Dataset, DatasetError, InferenceTensors, KittiRoadDataset, ShuffledBatches,
    save_inference_samples,
};
use crate::ir::ValueId;
use crate::model::{
    DecoderConfig, DecoderError, Objective, ObjectiveConfig, ObjectiveError, StepConfig,
    TrainLoopConfig, TrainLoopError, TrainReport, TrainTensors, layers, optimize, train_nn,
};
use crate::session::{Session, SessionError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Backbone(#[from] BackboneError),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
    #[error(transparent)]
    Objective(#[from] ObjectiveError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Train(#[from] TrainLoopError),
}

/// Every handle of the assembled training graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Network {
    pub backbone: BackboneTensors,
    /// `[N, H, W, num_classes]` decoder output.
    pub nn_last_layer: ValueId,
    pub correct_label: ValueId,
    pub learning_rate: ValueId,
    pub objective: Objective,
}

impl Network {
    #[must_use]
    pub fn train_tensors(&self) -> TrainTensors {
        TrainTensors {
            input_image: self.backbone.image_input,
            correct_label: self.correct_label,
            keep_prob: self.backbone.keep_prob,
            learning_rate: self.learning_rate,
            train_op: self.objective.train_op,
            loss: self.objective.loss,
        }
    }

    #[must_use]
    pub fn inference_tensors(&self) -> InferenceTensors {
        InferenceTensors {
            logits: self.objective.logits,
            keep_prob: self.backbone.keep_prob,
            input_image: self.backbone.image_input,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub report: TrainReport,
    pub samples_dir: PathBuf,
}

pub fn validate(config: &RunConfig) -> Result<(), PipelineError> {
    if config.num_classes == 0 {
        return Err(PipelineError::Config("num_classes must be at least 1".to_string()));
    }
    if config.batch_size == 0 {
        return Err(PipelineError::Config("batch_size must be at least 1".to_string()));
    }
    if !(config.keep_prob > 0.0 && config.keep_prob <= 1.0) {
        return Err(PipelineError::Config(format!(
            "keep_prob must be in (0, 1], got {}",
            config.keep_prob
        )));
    }
    if !(config.learning_rate.is_finite() && config.learning_rate > 0.0) {
        return Err(PipelineError::Config(format!(
            "learning_rate must be positive, got {}",
            config.learning_rate
        )));
    }
    Ok(())
}

/// Attaches the decoder and the objective to an already restored backbone.
pub fn build_network(
    session: &mut Session,
    backbone: BackboneTensors,
    config: &RunConfig,
) -> Result<Network, PipelineError> {
    let decoder = layers(
        session,
        backbone.layer3_out,
        backbone.layer4_out,
        backbone.layer7_out,
        config.num_classes,
        &DecoderConfig {
            image_shape: config.image_shape,
            ..DecoderConfig::default()
        },
    )?;

    let learning_rate = session.placeholder("learning_rate", Vec::new())?;
    let (height, width) = config.image_shape;
    let correct_label =
        session.placeholder("correct_label", vec![1, height, width, config.num_classes])?;

    let objective = optimize(
        session,
        decoder.logits,
        correct_label,
        learning_rate,
        config.num_classes,
        &decoder.regularizers,
        &ObjectiveConfig {
            freeze_backbone: config.freeze_backbone,
            ..ObjectiveConfig::default()
        },
    )?;

    Ok(Network {
        backbone,
        nn_last_layer: decoder.logits,
        correct_label,
        learning_rate,
        objective,
    })
}

/// Trains on the KITTI road split under `config.data_dir` and writes
/// inference samples to `config.runs_dir`.
pub fn run(config: &RunConfig) -> Result<RunOutcome, PipelineError> {
    validate(config)?;
    let dataset = KittiRoadDataset::open(&config.training_dir(), config.image_shape)?;
    info!(examples = dataset.len(), "training set ready");

    let mut session = Session::new(config.seed);
    let backbone = load_backbone(&mut session, &config.vgg_path())?;
    let network = build_network(&mut session, backbone, config)?;

    let mut batches = ShuffledBatches::new(dataset, config.seed);
    let report = train_nn(
        &mut session,
        &TrainLoopConfig {
            epochs: config.epochs,
            batch_size: config.batch_size,
        },
        &mut batches,
        &network.train_tensors(),
        &StepConfig {
            keep_prob: config.keep_prob,
            learning_rate: config.learning_rate,
        },
    )?;

    let samples_dir = save_inference_samples(
        &config.runs_dir,
        &config.data_dir,
        &session,
        config.image_shape,
        &network.inference_tensors(),
    )?;
    Ok(RunOutcome {
        report,
        samples_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_settings_are_rejected_before_loading() {
        let config = RunConfig {
            keep_prob: 0.0,
            ..RunConfig::default()
        };
        assert!(matches!(validate(&config), Err(PipelineError::Config(_))));
        assert!(validate(&RunConfig::default()).is_ok());
    }

    #[test]
    fn missing_dataset_is_a_dataset_error() {
        let config = RunConfig {
            data_dir: PathBuf::from("/nonexistent/fcnseg-data"),
            ..RunConfig::default()
        };
        assert!(matches!(run(&config), Err(PipelineError::Dataset(_))));
    }
}
