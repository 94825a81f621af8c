mod common;

use approx::assert_relative_eq;
use common::{BackboneOptions, backbone_model, synthetic_dataset};
use fcnseg::backbone::load_backbone_bytes;
use fcnseg::config::RunConfig;
use fcnseg::data::{BatchSource, BatchStream, DatasetError, InMemoryDataset, ShuffledBatches};
use fcnseg::ir::Tensor;
use fcnseg::model::{StepConfig, StepSchedule, TrainLoopConfig, TrainLoopError, train_nn};
use fcnseg::pipeline::{Network, build_network};
use fcnseg::session::Session;
use prost::Message;

const SMALL_IMAGE: (usize, usize) = (32, 64);

fn small_config(seed: u64) -> RunConfig {
    RunConfig {
        image_shape: SMALL_IMAGE,
        seed,
        ..RunConfig::default()
    }
}

fn build(seed: u64) -> (Session, Network) {
    let config = small_config(seed);
    let model = backbone_model(SMALL_IMAGE, BackboneOptions::default());
    let mut session = Session::new(seed);
    let backbone =
        load_backbone_bytes(&mut session, &model.encode_to_vec()).expect("backbone should load");
    let network = build_network(&mut session, backbone, &config).expect("network should build");
    (session, network)
}

/// Counts how often the loop asks for a stream and how many batches it pulls.
struct CountingSource {
    inner: ShuffledBatches<InMemoryDataset>,
    calls: usize,
    requested_batch_sizes: Vec<usize>,
}

impl BatchSource for CountingSource {
    fn batches(&mut self, batch_size: usize) -> Result<BatchStream<'_>, DatasetError> {
        self.calls += 1;
        self.requested_batch_sizes.push(batch_size);
        self.inner.batches(batch_size)
    }
}

#[test]
fn objective_flattens_logits_and_yields_a_finite_scalar_loss() {
    let (mut session, network) = build(1);
    let (h, w) = SMALL_IMAGE;
    assert_eq!(
        session.shape(network.objective.logits),
        Some(&[h * w, 2][..])
    );
    assert_eq!(session.shape(network.objective.loss), Some(&[][..]));

    session.initialize_variables().expect("init");
    let example = common::synthetic_example(SMALL_IMAGE, 0);
    let images = Tensor::new(vec![1, h, w, 3], example.image.data).expect("images");
    let labels = Tensor::new(vec![1, h, w, 2], example.label.data).expect("labels");
    let out = session
        .run(
            &[network.objective.loss, network.objective.cross_entropy],
            vec![
                (network.backbone.image_input, images),
                (network.correct_label, labels),
                (network.backbone.keep_prob, Tensor::scalar(1.0)),
            ],
        )
        .expect("loss should evaluate");
    let loss = out[0].scalar_value().expect("scalar loss");
    let xent = out[1].scalar_value().expect("scalar cross-entropy");
    assert!(loss.is_finite());
    assert!(xent >= 0.0);
    // The L2 penalties only ever add to the loss.
    assert!(loss >= xent);
}

#[test]
fn generator_is_called_once_per_epoch_and_steps_once_per_batch() {
    let (mut session, network) = build(2);
    let mut source = CountingSource {
        inner: ShuffledBatches::new(synthetic_dataset(SMALL_IMAGE, 5), 2),
        calls: 0,
        requested_batch_sizes: Vec::new(),
    };
    let report = train_nn(
        &mut session,
        &TrainLoopConfig {
            epochs: 3,
            batch_size: 2,
        },
        &mut source,
        &network.train_tensors(),
        &StepConfig::default(),
    )
    .expect("training should run");

    assert_eq!(source.calls, 3);
    assert_eq!(source.requested_batch_sizes, vec![2, 2, 2]);
    // 5 examples in batches of 2: 2 + 2 + 1.
    assert_eq!(report.total_steps, 9);
    assert_eq!(session.global_step(), 9);
    assert!(report.epochs.iter().all(|epoch| epoch.steps == 3));
    assert!(report.epochs.iter().all(|epoch| epoch.mean_loss.is_finite()));
}

#[test]
fn zero_epochs_only_initializes() {
    let (mut session, network) = build(3);
    let mut source = ShuffledBatches::new(synthetic_dataset(SMALL_IMAGE, 2), 0);
    let report = train_nn(
        &mut session,
        &TrainLoopConfig {
            epochs: 0,
            batch_size: 1,
        },
        &mut source,
        &network.train_tensors(),
        &StepConfig::default(),
    )
    .expect("nothing to train");
    assert_eq!(report.total_steps, 0);
    assert!(session.is_initialized());
    assert_eq!(source.calls(), 0);
}

#[test]
fn zero_batch_size_is_rejected() {
    let (mut session, network) = build(3);
    let mut source = ShuffledBatches::new(synthetic_dataset(SMALL_IMAGE, 2), 0);
    let err = train_nn(
        &mut session,
        &TrainLoopConfig {
            epochs: 1,
            batch_size: 0,
        },
        &mut source,
        &network.train_tensors(),
        &StepConfig::default(),
    )
    .expect_err("batch size 0");
    assert!(matches!(err, TrainLoopError::ZeroBatchSize));
}

#[test]
fn same_seed_and_batches_give_identical_parameters() {
    let run = || {
        let (mut session, network) = build(7);
        let mut source = ShuffledBatches::new(synthetic_dataset(SMALL_IMAGE, 2), 4);
        let report = train_nn(
            &mut session,
            &TrainLoopConfig {
                epochs: 1,
                batch_size: 2,
            },
            &mut source,
            &network.train_tensors(),
            &StepConfig::default(),
        )
        .expect("training should run");
        let params = session
            .variables()
            .map(|var| {
                (
                    var.name.clone(),
                    session
                        .variable_value(&var.name)
                        .expect("initialized")
                        .data
                        .clone(),
                )
            })
            .collect::<Vec<_>>();
        (report, params)
    };

    let (first_report, first) = run();
    let (second_report, second) = run();
    assert_eq!(first_report, second_report);
    assert_eq!(first, second);
}

/// Halves the learning rate after the first step.
struct Decay;

impl StepSchedule for Decay {
    fn step_config(&self, _epoch: usize, step: u64) -> StepConfig {
        let base = StepConfig::default();
        StepConfig {
            learning_rate: if step == 0 {
                base.learning_rate
            } else {
                base.learning_rate / 2.0
            },
            ..base
        }
    }
}

#[test]
fn schedules_choose_per_step_hyperparameters() {
    let (mut session, network) = build(5);
    let mut source = ShuffledBatches::new(synthetic_dataset(SMALL_IMAGE, 2), 1);
    let report = train_nn(
        &mut session,
        &TrainLoopConfig {
            epochs: 1,
            batch_size: 1,
        },
        &mut source,
        &network.train_tensors(),
        &Decay,
    )
    .expect("training should run");
    assert_eq!(report.total_steps, 2);
    assert_relative_eq!(Decay.step_config(0, 1).learning_rate, 0.00025);
}
