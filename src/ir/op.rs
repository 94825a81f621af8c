use crate::ir::conv::{Conv2DSpec, PoolSpec};
use crate::ir::node::ValueId;

#[derive(Debug, Clone)]
pub enum Op {
    ConstTensor {
        shape: Vec<usize>,
        data: Vec<f32>,
    },
    Add(ValueId, ValueId),
    Scale {
        input: ValueId,
        factor: f32,
    },
    /// Tensor times a scalar tensor.
    ScaleBy {
        input: ValueId,
        scale: ValueId,
    },
    Relu(ValueId),
    ReluBackward(ValueId, ValueId),
    BiasAdd {
        input: ValueId,
        bias: ValueId,
    },
    BiasAddBackward(ValueId),
    Conv2D {
        input: ValueId,
        kernel: ValueId,
        spec: Conv2DSpec,
    },
    Conv2DBackpropInput {
        grad: ValueId,
        kernel: ValueId,
        spec: Conv2DSpec,
        input_hw: [usize; 2],
    },
    Conv2DBackpropFilter {
        input: ValueId,
        grad: ValueId,
        spec: Conv2DSpec,
        kernel_hw: [usize; 2],
    },
    Conv2DTranspose {
        input: ValueId,
        kernel: ValueId,
        spec: Conv2DSpec,
    },
    Conv2DTransposeBackpropInput {
        grad: ValueId,
        kernel: ValueId,
        spec: Conv2DSpec,
    },
    Conv2DTransposeBackpropFilter {
        input: ValueId,
        grad: ValueId,
        spec: Conv2DSpec,
        kernel_hw: [usize; 2],
    },
    MaxPool {
        input: ValueId,
        spec: PoolSpec,
    },
    MaxPoolBackward {
        input: ValueId,
        grad: ValueId,
        spec: PoolSpec,
    },
    /// Inverted dropout; `mask_key` identifies the mask so the backward pass
    /// regenerates the same one.
    Dropout {
        input: ValueId,
        keep_prob: ValueId,
        mask_key: usize,
    },
    DropoutBackward {
        grad: ValueId,
        keep_prob: ValueId,
        mask_key: usize,
    },
    Reshape {
        input: ValueId,
        shape: Vec<isize>,
    },
    /// Reshapes `input` to the runtime shape of `like`.
    ReshapeLike {
        input: ValueId,
        like: ValueId,
    },
    SoftmaxCrossEntropy {
        logits: ValueId,
        labels: ValueId,
    },
    SoftmaxCrossEntropyBackward {
        logits: ValueId,
        labels: ValueId,
        grad: ValueId,
    },
    L2Loss(ValueId),
    Parameter(String),
    Input(String),
    Output(ValueId),
}

impl Op {
    pub fn input_values(&self) -> Vec<ValueId> {
        match self {
            Op::Add(left, right) | Op::ReluBackward(left, right) => vec![*left, *right],
            Op::Scale { input, .. }
            | Op::Relu(input)
            | Op::BiasAddBackward(input)
            | Op::MaxPool { input, .. }
            | Op::Reshape { input, .. }
            | Op::L2Loss(input)
            | Op::Output(input) => vec![*input],
            Op::ScaleBy { input, scale } => vec![*input, *scale],
            Op::BiasAdd { input, bias } => vec![*input, *bias],
            Op::Conv2D { input, kernel, .. } | Op::Conv2DTranspose { input, kernel, .. } => {
                vec![*input, *kernel]
            }
            Op::Conv2DBackpropInput { grad, kernel, .. }
            | Op::Conv2DTransposeBackpropInput { grad, kernel, .. } => vec![*grad, *kernel],
            Op::Conv2DBackpropFilter { input, grad, .. }
            | Op::Conv2DTransposeBackpropFilter { input, grad, .. }
            | Op::MaxPoolBackward { input, grad, .. } => vec![*input, *grad],
            Op::Dropout {
                input, keep_prob, ..
            } => vec![*input, *keep_prob],
            Op::DropoutBackward {
                grad, keep_prob, ..
            } => vec![*grad, *keep_prob],
            Op::ReshapeLike { input, like } => vec![*input, *like],
            Op::SoftmaxCrossEntropy { logits, labels } => vec![*logits, *labels],
            Op::SoftmaxCrossEntropyBackward {
                logits,
                labels,
                grad,
            } => vec![*logits, *labels, *grad],
            Op::ConstTensor { .. } | Op::Parameter(_) | Op::Input(_) => Vec::new(),
        }
    }

    pub fn remap_inputs(&mut self, mut remap: impl FnMut(ValueId) -> ValueId) {
        match self {
            Op::Add(left, right) | Op::ReluBackward(left, right) => {
                *left = remap(*left);
                *right = remap(*right);
            }
            Op::Scale { input, .. }
            | Op::Relu(input)
            | Op::BiasAddBackward(input)
            | Op::MaxPool { input, .. }
            | Op::Reshape { input, .. }
            | Op::L2Loss(input)
            | Op::Output(input) => {
                *input = remap(*input);
            }
            Op::ScaleBy {
                input: a,
                scale: b,
            }
            | Op::BiasAdd { input: a, bias: b }
            | Op::Conv2D {
                input: a,
                kernel: b,
                ..
            }
            | Op::Conv2DTranspose {
                input: a,
                kernel: b,
                ..
            }
            | Op::Conv2DBackpropInput {
                grad: a, kernel: b, ..
            }
            | Op::Conv2DTransposeBackpropInput {
                grad: a, kernel: b, ..
            }
            | Op::Conv2DBackpropFilter {
                input: a, grad: b, ..
            }
            | Op::Conv2DTransposeBackpropFilter {
                input: a, grad: b, ..
            }
            | Op::MaxPoolBackward {
                input: a, grad: b, ..
            }
            | Op::Dropout {
                input: a,
                keep_prob: b,
                ..
            }
            | Op::DropoutBackward {
                grad: a,
                keep_prob: b,
                ..
            }
            | Op::ReshapeLike { input: a, like: b }
            | Op::SoftmaxCrossEntropy {
                logits: a,
                labels: b,
            } => {
                *a = remap(*a);
                *b = remap(*b);
            }
            Op::SoftmaxCrossEntropyBackward {
                logits,
                labels,
                grad,
            } => {
                *logits = remap(*logits);
                *labels = remap(*labels);
                *grad = remap(*grad);
            }
            Op::ConstTensor { .. } | Op::Parameter(_) | Op::Input(_) => {}
        }
    }

    /// Short mnemonic used by the printer and in error messages.
    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::ConstTensor { .. } => "const_tensor",
            Op::Add(..) => "add",
            Op::Scale { .. } => "scale",
            Op::ScaleBy { .. } => "scale_by",
            Op::Relu(_) => "relu",
            Op::ReluBackward(..) => "relu_backward",
            Op::BiasAdd { .. } => "bias_add",
            Op::BiasAddBackward(_) => "bias_add_backward",
            Op::Conv2D { .. } => "conv2d",
            Op::Conv2DBackpropInput { .. } => "conv2d_backprop_input",
            Op::Conv2DBackpropFilter { .. } => "conv2d_backprop_filter",
            Op::Conv2DTranspose { .. } => "conv2d_transpose",
            Op::Conv2DTransposeBackpropInput { .. } => "conv2d_transpose_backprop_input",
            Op::Conv2DTransposeBackpropFilter { .. } => "conv2d_transpose_backprop_filter",
            Op::MaxPool { .. } => "max_pool",
            Op::MaxPoolBackward { .. } => "max_pool_backward",
            Op::Dropout { .. } => "dropout",
            Op::DropoutBackward { .. } => "dropout_backward",
            Op::Reshape { .. } => "reshape",
            Op::ReshapeLike { .. } => "reshape_like",
            Op::SoftmaxCrossEntropy { .. } => "softmax_cross_entropy",
            Op::SoftmaxCrossEntropyBackward { .. } => "softmax_cross_entropy_backward",
            Op::L2Loss(_) => "l2_loss",
            Op::Parameter(_) => "parameter",
            Op::Input(_) => "input",
            Op::Output(_) => "output",
        }
    }
}
