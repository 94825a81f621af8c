use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::ir::conv::{
    conv2d, conv2d_backprop_filter, conv2d_backprop_input, conv2d_transpose,
    conv2d_transpose_backprop_filter, conv2d_transpose_backprop_input, max_pool,
    max_pool_backward,
};
use crate::ir::tensor::{Tensor, TensorError};
use crate::ir::{Graph, NodeId, Op, ValueId};

/// Values bound for one execution. `dropout_seed` selects the dropout masks;
/// two runs with the same seed draw identical masks.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub inputs: HashMap<String, Arc<Tensor>>,
    pub parameters: HashMap<String, Arc<Tensor>>,
    pub dropout_seed: u64,
}

#[derive(Debug, Clone)]
pub struct InterpreterError {
    pub message: String,
    pub node: Option<NodeId>,
}

impl fmt::Display for InterpreterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Some(node) => write!(f, "{} (node {})", self.message, node.0),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for InterpreterError {}

/// Evaluates `targets`, computing only the nodes they transitively depend on.
pub fn execute_values(
    graph: &Graph,
    targets: &[ValueId],
    context: &ExecutionContext,
) -> Result<Vec<Arc<Tensor>>, InterpreterError> {
    let live = live_nodes(graph, targets)?;
    let mut values: Vec<Option<Arc<Tensor>>> = vec![None; graph.value_count()];

    for node in &graph.nodes {
        if !live[node.id.0] {
            continue;
        }
        let output_index = node.output.0;
        if values[output_index].is_some() {
            return Err(error(
                format!("SSA violation: ValueId {output_index} assigned more than once"),
                Some(node.id),
            ));
        }
        let computed = evaluate_op(&node.op, &values, node.id, context)?;
        values[output_index] = Some(computed);
    }

    targets
        .iter()
        .map(|target| read_value(&values, *target, None))
        .collect()
}

pub fn execute_value(
    graph: &Graph,
    target: ValueId,
    context: &ExecutionContext,
) -> Result<Arc<Tensor>, InterpreterError> {
    let mut values = execute_values(graph, &[target], context)?;
    values
        .pop()
        .ok_or_else(|| error(format!("ValueId {} not computed", target.0), None))
}

fn live_nodes(graph: &Graph, targets: &[ValueId]) -> Result<Vec<bool>, InterpreterError> {
    let mut live = vec![false; graph.nodes.len()];
    let mut stack = Vec::with_capacity(targets.len());
    for target in targets {
        if target.0 >= graph.nodes.len() {
            return Err(error(format!("ValueId out of range: {}", target.0), None));
        }
        stack.push(*target);
    }
    while let Some(value) = stack.pop() {
        if std::mem::replace(&mut live[value.0], true) {
            continue;
        }
        stack.extend(graph.nodes[value.0].op.input_values());
    }
    Ok(live)
}

fn evaluate_op(
    op: &Op,
    values: &[Option<Arc<Tensor>>],
    node_id: NodeId,
    context: &ExecutionContext,
) -> Result<Arc<Tensor>, InterpreterError> {
    let read = |id: ValueId| read_value(values, id, Some(node_id));
    let wrap = |result: Result<Tensor, TensorError>| {
        result
            .map(Arc::new)
            .map_err(|err| error(err.message, Some(node_id)))
    };

    match op {
        Op::ConstTensor { shape, data } => wrap(Tensor::new(shape.clone(), data.clone())),
        Op::Parameter(name) => context
            .parameters
            .get(name)
            .cloned()
            .ok_or_else(|| error(format!("Missing parameter: '{name}'"), Some(node_id))),
        Op::Input(name) => context
            .inputs
            .get(name)
            .cloned()
            .ok_or_else(|| error(format!("Missing input: '{name}'"), Some(node_id))),
        Op::Output(value) => read(*value),
        Op::Add(left, right) => wrap(read(*left)?.add(&*read(*right)?)),
        Op::Scale { input, factor } => wrap(read(*input)?.scale(*factor)),
        Op::ScaleBy { input, scale } => wrap(read(*input)?.scale_by(&*read(*scale)?)),
        Op::Relu(value) => wrap(read(*value)?.relu()),
        Op::ReluBackward(input, grad) => wrap(read(*input)?.relu_backward(&*read(*grad)?)),
        Op::BiasAdd { input, bias } => wrap(read(*input)?.bias_add(&*read(*bias)?)),
        Op::BiasAddBackward(grad) => wrap(read(*grad)?.reduce_to_last_axis()),
        Op::Conv2D {
            input,
            kernel,
            spec,
        } => wrap(conv2d(&*read(*input)?, &*read(*kernel)?, spec)),
        Op::Conv2DBackpropInput {
            grad,
            kernel,
            spec,
            input_hw,
        } => wrap(conv2d_backprop_input(
            &*read(*grad)?,
            &*read(*kernel)?,
            spec,
            *input_hw,
        )),
        Op::Conv2DBackpropFilter {
            input,
            grad,
            spec,
            kernel_hw,
        } => wrap(conv2d_backprop_filter(
            &*read(*input)?,
            &*read(*grad)?,
            spec,
            *kernel_hw,
        )),
        Op::Conv2DTranspose {
            input,
            kernel,
            spec,
        } => wrap(conv2d_transpose(&*read(*input)?, &*read(*kernel)?, spec)),
        Op::Conv2DTransposeBackpropInput { grad, kernel, spec } => wrap(
            conv2d_transpose_backprop_input(&*read(*grad)?, &*read(*kernel)?, spec),
        ),
        Op::Conv2DTransposeBackpropFilter {
            input,
            grad,
            spec,
            kernel_hw,
        } => wrap(conv2d_transpose_backprop_filter(
            &*read(*input)?,
            &*read(*grad)?,
            spec,
            *kernel_hw,
        )),
        Op::MaxPool { input, spec } => wrap(max_pool(&*read(*input)?, spec)),
        Op::MaxPoolBackward { input, grad, spec } => {
            wrap(max_pool_backward(&*read(*input)?, &*read(*grad)?, spec))
        }
        Op::Dropout {
            input,
            keep_prob,
            mask_key,
        }
        | Op::DropoutBackward {
            grad: input,
            keep_prob,
            mask_key,
        } => {
            let x = read(*input)?;
            let keep = read(*keep_prob)?.scalar_value().map_err(|err| {
                error(format!("dropout keep_prob: {}", err.message), Some(node_id))
            })?;
            apply_dropout(x, keep, context.dropout_seed, *mask_key)
                .map_err(|err| error(err.message, Some(node_id)))
        }
        Op::Reshape { input, shape } => wrap(read(*input)?.reshape(shape)),
        Op::ReshapeLike { input, like } => {
            wrap(read(*input)?.reshape_exact(read(*like)?.shape.clone()))
        }
        Op::SoftmaxCrossEntropy { logits, labels } => {
            wrap(read(*logits)?.softmax_cross_entropy(&*read(*labels)?))
        }
        Op::SoftmaxCrossEntropyBackward {
            logits,
            labels,
            grad,
        } => wrap(read(*logits)?.softmax_cross_entropy_backward(&*read(*labels)?, &*read(*grad)?)),
        Op::L2Loss(value) => Ok(Arc::new(read(*value)?.l2_loss())),
    }
}

/// Inverted dropout: kept elements are scaled by `1 / keep_prob`. The mask is a
/// pure function of `(seed, mask_key)` and the element index.
fn apply_dropout(
    input: Arc<Tensor>,
    keep_prob: f32,
    seed: u64,
    mask_key: usize,
) -> Result<Arc<Tensor>, TensorError> {
    if !(keep_prob > 0.0 && keep_prob <= 1.0) {
        return Err(TensorError {
            message: format!("dropout keep_prob must be in (0, 1], got {keep_prob}"),
        });
    }
    if keep_prob == 1.0 {
        return Ok(input);
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(mask_key as u64);
    let scale = keep_prob.recip();
    let data = input
        .data
        .iter()
        .map(|value| {
            if rng.r#gen::<f32>() < keep_prob {
                *value * scale
            } else {
                0.0
            }
        })
        .collect();
    Tensor::new(input.shape.clone(), data).map(Arc::new)
}

fn read_value(
    values: &[Option<Arc<Tensor>>],
    id: ValueId,
    node: Option<NodeId>,
) -> Result<Arc<Tensor>, InterpreterError> {
    values
        .get(id.0)
        .ok_or_else(|| error(format!("ValueId out of range: {}", id.0), node))?
        .clone()
        .ok_or_else(|| error(format!("ValueId {} not computed", id.0), node))
}

fn error(message: String, node: Option<NodeId>) -> InterpreterError {
    InterpreterError { message, node }
}
