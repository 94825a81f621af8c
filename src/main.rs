use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, ValueHint};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fcnseg::config::RunConfig;
use fcnseg::pipeline;

/// Trains the FCN-8s road segmenter on KITTI and writes inference samples.
///
/// Settings default to the built-in recipe, then `FCNSEG_*` environment
/// variables, then these flags.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Dataset root containing `data_road/`
    #[arg(long, value_hint = ValueHint::DirPath)]
    data_dir: Option<PathBuf>,

    /// Where inference samples are written
    #[arg(long, value_hint = ValueHint::DirPath)]
    runs_dir: Option<PathBuf>,

    /// Backbone directory holding `saved_model.onnx`, or the file itself
    #[arg(long, value_hint = ValueHint::AnyPath)]
    vgg_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f32>,

    /// Dropout keep probability during training
    #[arg(long)]
    keep_prob: Option<f32>,

    #[arg(long)]
    num_classes: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Exclude backbone variables from the optimizer
    #[arg(long, action = ArgAction::SetTrue)]
    freeze_backbone: bool,
}

impl Cli {
    fn apply(self, mut config: RunConfig) -> RunConfig {
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(dir) = self.runs_dir {
            config.runs_dir = dir;
        }
        if let Some(dir) = self.vgg_dir {
            config.vgg_dir = Some(dir);
        }
        config.epochs = self.epochs.unwrap_or(config.epochs);
        config.batch_size = self.batch_size.unwrap_or(config.batch_size);
        config.learning_rate = self.learning_rate.unwrap_or(config.learning_rate);
        config.keep_prob = self.keep_prob.unwrap_or(config.keep_prob);
        config.num_classes = self.num_classes.unwrap_or(config.num_classes);
        config.seed = self.seed.unwrap_or(config.seed);
        config.freeze_backbone |= self.freeze_backbone;
        config
    }
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Cli::parse().apply(RunConfig::from_env());
    info!(?config, "starting run");

    match pipeline::run(&config) {
        Ok(outcome) => {
            info!(
                steps = outcome.report.total_steps,
                final_loss = ?outcome.report.final_loss(),
                samples = %outcome.samples_dir.display(),
                "run complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(%err, "run failed");
            ExitCode::FAILURE
        }
    }
}
