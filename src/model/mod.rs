mod decoder;
mod layers;
mod objective;
mod regularization;
mod train_loop;

pub use decoder::{
    BACKBONE_STRIDE, DEFAULT_L2_SCALE, DecoderConfig, DecoderError, DecoderOutput,
    UPSAMPLE_FACTORS, layers,
};
pub use layers::{Conv2DLayer, Conv2DTransposeLayer, Layer};
pub use objective::{Objective, ObjectiveConfig, ObjectiveError, optimize};
pub use regularization::{RegularizationLosses, RegularizationTerm, l2_regularizer};
pub use train_loop::{
    EpochSummary, StepConfig, StepSchedule, TrainLoopConfig, TrainLoopError, TrainReport,
    TrainTensors, train_nn,
};
