use std::collections::HashMap;
use std::fmt;

use crate::ir::{Graph, Op, ShapeFact, ValueId, infer_shapes, verify_graph};

#[derive(Debug, Clone)]
pub struct AutogradError {
    pub message: String,
}

impl fmt::Display for AutogradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for AutogradError {}

/// A copy of the forward graph extended with gradient nodes. Forward values
/// keep their ids, so `gradients` maps a forward value to the backward value
/// holding d(loss)/d(value).
#[derive(Debug, Clone)]
pub struct GradientGraph {
    pub backward: Graph,
    pub gradients: HashMap<ValueId, ValueId>,
    pub loss: ValueId,
}

/// Builds the reverse-mode automatic differentiation graph for `loss`, a
/// scalar value of `forward`, and returns gradient values for every entry of
/// `wrt` that the loss depends on.
///
/// # Errors
///
/// Returns `Err(AutogradError)` if:
/// - `forward` fails graph verification or shape inference
/// - `loss` is not a scalar
/// - the loss depends on an op that has no gradient rule
pub fn build_reverse_graph(
    forward: &Graph,
    loss: ValueId,
    wrt: &[ValueId],
) -> Result<GradientGraph, AutogradError> {
    verify_graph(forward).map_err(|err| AutogradError {
        message: format!("Forward graph failed verification: {}", err.message),
    })?;
    let shape_facts = infer_shapes(forward).map_err(|err| AutogradError {
        message: format!("Forward shape inference failed: {}", err.message),
    })?;
    match shape_facts.get(&loss) {
        Some(ShapeFact::Tensor(shape)) if shape.is_empty() => {}
        other => {
            return Err(AutogradError {
                message: format!("Loss {loss:?} must be a scalar, got {other:?}"),
            });
        }
    }

    let mut backward = forward.clone();
    let seed = push(
        &mut backward,
        Op::ConstTensor {
            shape: Vec::new(),
            data: vec![1.0],
        },
        "loss seed",
    )?;

    let mut grad_map: HashMap<ValueId, ValueId> = HashMap::new();
    grad_map.insert(loss, seed);

    for node in forward.nodes.iter().rev() {
        let Some(upstream) = grad_map.get(&node.output).copied() else {
            continue;
        };

        match &node.op {
            Op::Output(input) => {
                accumulate_grad(&mut backward, &mut grad_map, *input, upstream)?;
            }
            Op::Add(a, b) => {
                accumulate_grad(&mut backward, &mut grad_map, *a, upstream)?;
                accumulate_grad(&mut backward, &mut grad_map, *b, upstream)?;
            }
            Op::Scale { input, factor } => {
                let grad_x = push(
                    &mut backward,
                    Op::Scale {
                        input: upstream,
                        factor: *factor,
                    },
                    "scale backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
            }
            Op::ScaleBy { input, scale } => {
                // The scalar operand is treated as a constant.
                let grad_x = push(
                    &mut backward,
                    Op::ScaleBy {
                        input: upstream,
                        scale: *scale,
                    },
                    "scale_by backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
            }
            Op::Relu(input) => {
                let grad_x = push(
                    &mut backward,
                    Op::ReluBackward(*input, upstream),
                    "relu backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
            }
            Op::BiasAdd { input, bias } => {
                let grad_b = push(
                    &mut backward,
                    Op::BiasAddBackward(upstream),
                    "bias_add backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, upstream)?;
                accumulate_grad(&mut backward, &mut grad_map, *bias, grad_b)?;
            }
            Op::Conv2D {
                input,
                kernel,
                spec,
            } => {
                let input_shape = tensor_shape_for(&shape_facts, *input)?;
                let kernel_shape = tensor_shape_for(&shape_facts, *kernel)?;
                let grad_x = push(
                    &mut backward,
                    Op::Conv2DBackpropInput {
                        grad: upstream,
                        kernel: *kernel,
                        spec: *spec,
                        input_hw: spatial(&input_shape, "conv2d input")?,
                    },
                    "conv2d backward (input)",
                )?;
                let grad_w = push(
                    &mut backward,
                    Op::Conv2DBackpropFilter {
                        input: *input,
                        grad: upstream,
                        spec: *spec,
                        kernel_hw: window(&kernel_shape, "conv2d kernel")?,
                    },
                    "conv2d backward (filter)",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
                accumulate_grad(&mut backward, &mut grad_map, *kernel, grad_w)?;
            }
            Op::Conv2DTranspose {
                input,
                kernel,
                spec,
            } => {
                let kernel_shape = tensor_shape_for(&shape_facts, *kernel)?;
                let grad_x = push(
                    &mut backward,
                    Op::Conv2DTransposeBackpropInput {
                        grad: upstream,
                        kernel: *kernel,
                        spec: *spec,
                    },
                    "conv2d_transpose backward (input)",
                )?;
                let grad_w = push(
                    &mut backward,
                    Op::Conv2DTransposeBackpropFilter {
                        input: *input,
                        grad: upstream,
                        spec: *spec,
                        kernel_hw: window(&kernel_shape, "conv2d_transpose kernel")?,
                    },
                    "conv2d_transpose backward (filter)",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
                accumulate_grad(&mut backward, &mut grad_map, *kernel, grad_w)?;
            }
            Op::MaxPool { input, spec } => {
                let grad_x = push(
                    &mut backward,
                    Op::MaxPoolBackward {
                        input: *input,
                        grad: upstream,
                        spec: *spec,
                    },
                    "max_pool backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
            }
            Op::Dropout {
                input,
                keep_prob,
                mask_key,
            } => {
                let grad_x = push(
                    &mut backward,
                    Op::DropoutBackward {
                        grad: upstream,
                        keep_prob: *keep_prob,
                        mask_key: *mask_key,
                    },
                    "dropout backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
            }
            Op::Reshape { input, .. } | Op::ReshapeLike { input, .. } => {
                let grad_x = push(
                    &mut backward,
                    Op::ReshapeLike {
                        input: upstream,
                        like: *input,
                    },
                    "reshape backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
            }
            Op::SoftmaxCrossEntropy { logits, labels } => {
                let grad_logits = push(
                    &mut backward,
                    Op::SoftmaxCrossEntropyBackward {
                        logits: *logits,
                        labels: *labels,
                        grad: upstream,
                    },
                    "softmax_cross_entropy backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *logits, grad_logits)?;
            }
            Op::L2Loss(input) => {
                let grad_x = push(
                    &mut backward,
                    Op::ScaleBy {
                        input: *input,
                        scale: upstream,
                    },
                    "l2_loss backward",
                )?;
                accumulate_grad(&mut backward, &mut grad_map, *input, grad_x)?;
            }
            Op::ConstTensor { .. } | Op::Parameter(_) | Op::Input(_) => {}
            Op::ReluBackward(..)
            | Op::BiasAddBackward(_)
            | Op::Conv2DBackpropInput { .. }
            | Op::Conv2DBackpropFilter { .. }
            | Op::Conv2DTransposeBackpropInput { .. }
            | Op::Conv2DTransposeBackpropFilter { .. }
            | Op::MaxPoolBackward { .. }
            | Op::DropoutBackward { .. }
            | Op::SoftmaxCrossEntropyBackward { .. } => {
                return Err(AutogradError {
                    message: format!(
                        "No gradient rule for '{}' (node {})",
                        node.op.mnemonic(),
                        node.id.0
                    ),
                });
            }
        }
    }

    let gradients = wrt
        .iter()
        .filter_map(|value| grad_map.get(value).map(|grad| (*value, *grad)))
        .collect();

    verify_graph(&backward).map_err(|err| AutogradError {
        message: format!("Backward graph failed verification: {}", err.message),
    })?;

    Ok(GradientGraph {
        backward,
        gradients,
        loss,
    })
}

fn push(graph: &mut Graph, op: Op, label: &str) -> Result<ValueId, AutogradError> {
    graph
        .add_op(op)
        .map(|(_, value)| value)
        .map_err(|err| AutogradError {
            message: format!("Failed to build {label}: {}", err.message),
        })
}

fn tensor_shape_for(
    shape_facts: &HashMap<ValueId, ShapeFact>,
    value: ValueId,
) -> Result<Vec<usize>, AutogradError> {
    match shape_facts.get(&value) {
        Some(ShapeFact::Tensor(shape)) => Ok(shape.clone()),
        Some(ShapeFact::Unknown) => Err(AutogradError {
            message: format!("Missing concrete tensor shape for value {value:?}"),
        }),
        None => Err(AutogradError {
            message: format!("Missing shape fact for value {value:?}"),
        }),
    }
}

fn spatial(shape: &[usize], label: &str) -> Result<[usize; 2], AutogradError> {
    match shape {
        [_, h, w, _] => Ok([*h, *w]),
        other => Err(AutogradError {
            message: format!("{label} expects an NHWC shape, got {other:?}"),
        }),
    }
}

fn window(shape: &[usize], label: &str) -> Result<[usize; 2], AutogradError> {
    match shape {
        [kh, kw, _, _] => Ok([*kh, *kw]),
        other => Err(AutogradError {
            message: format!("{label} expects a rank-4 kernel, got {other:?}"),
        }),
    }
}

fn accumulate_grad(
    graph: &mut Graph,
    grad_map: &mut HashMap<ValueId, ValueId>,
    target: ValueId,
    contribution: ValueId,
) -> Result<(), AutogradError> {
    if let Some(existing) = grad_map.get(&target).copied() {
        let sum = push(graph, Op::Add(existing, contribution), "gradient accumulation")?;
        grad_map.insert(target, sum);
    } else {
        grad_map.insert(target, contribution);
    }
    Ok(())
}
