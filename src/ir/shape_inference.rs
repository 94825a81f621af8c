use std::collections::HashMap;
use std::fmt;

use crate::ir::conv::{Conv2DSpec, PoolSpec};
use crate::ir::tensor::resolve_reshape;
use crate::ir::{Graph, Op, ValueId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeFact {
    Unknown,
    Tensor(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct ShapeError {
    pub message: String,
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ShapeError {}

pub fn infer_shapes(graph: &Graph) -> Result<HashMap<ValueId, ShapeFact>, ShapeError> {
    let mut shapes = HashMap::new();

    for node in &graph.nodes {
        let inferred = infer_op_shape(graph, &node.op, &shapes).map_err(|message| ShapeError {
            message: format!("{} (at node {} '{}')", message, node.id.0, node.op.mnemonic()),
        })?;
        shapes.insert(node.output, inferred);
    }

    Ok(shapes)
}

/// Infers the output shape of a single op given the facts of its inputs.
pub fn infer_op_shape(
    graph: &Graph,
    op: &Op,
    shapes: &HashMap<ValueId, ShapeFact>,
) -> Result<ShapeFact, String> {
    match op {
        Op::ConstTensor { shape, .. } => Ok(ShapeFact::Tensor(shape.clone())),
        Op::Input(name) => Ok(graph
            .input_shape(name)
            .map_or(ShapeFact::Unknown, |shape| ShapeFact::Tensor(shape.to_vec()))),
        Op::Parameter(name) => Ok(graph
            .parameter_shape(name)
            .map_or(ShapeFact::Unknown, |shape| ShapeFact::Tensor(shape.to_vec()))),
        Op::Output(value)
        | Op::Relu(value)
        | Op::Scale { input: value, .. }
        | Op::ScaleBy { input: value, .. }
        | Op::Dropout { input: value, .. }
        | Op::DropoutBackward { grad: value, .. } => Ok(shape_of(*value, shapes)),
        Op::Add(left, right) => infer_same(*left, *right, shapes, "add"),
        Op::ReluBackward(input, grad) => infer_same(*input, *grad, shapes, "relu_backward"),
        Op::BiasAdd { input, bias } => infer_bias_add(*input, *bias, shapes),
        Op::BiasAddBackward(grad) => match shape_of(*grad, shapes) {
            ShapeFact::Tensor(shape) => shape
                .last()
                .map(|c| ShapeFact::Tensor(vec![*c]))
                .ok_or_else(|| "bias_add_backward expects rank >= 1".to_string()),
            ShapeFact::Unknown => Ok(ShapeFact::Unknown),
        },
        Op::Conv2D {
            input,
            kernel,
            spec,
        } => infer_conv2d(*input, *kernel, spec, shapes),
        Op::Conv2DTranspose {
            input,
            kernel,
            spec,
        } => infer_conv2d_transpose(*input, *kernel, spec, shapes),
        Op::Conv2DBackpropInput {
            grad,
            kernel,
            input_hw,
            ..
        } => match (shape_of(*grad, shapes), shape_of(*kernel, shapes)) {
            (ShapeFact::Tensor(g), ShapeFact::Tensor(k)) => {
                let [n, ..] = nhwc(&g, "conv2d_backprop_input grad")?;
                let [_, _, in_c, _] = nhwc(&k, "conv2d_backprop_input kernel")?;
                Ok(ShapeFact::Tensor(vec![n, input_hw[0], input_hw[1], in_c]))
            }
            _ => Ok(ShapeFact::Unknown),
        },
        Op::Conv2DBackpropFilter {
            input,
            grad,
            kernel_hw,
            ..
        } => match (shape_of(*input, shapes), shape_of(*grad, shapes)) {
            (ShapeFact::Tensor(x), ShapeFact::Tensor(g)) => {
                let [.., in_c] = nhwc(&x, "conv2d_backprop_filter input")?;
                let [.., out_c] = nhwc(&g, "conv2d_backprop_filter grad")?;
                Ok(ShapeFact::Tensor(vec![kernel_hw[0], kernel_hw[1], in_c, out_c]))
            }
            _ => Ok(ShapeFact::Unknown),
        },
        Op::Conv2DTransposeBackpropInput { grad, kernel, spec } => {
            infer_conv2d(*grad, *kernel, spec, shapes)
        }
        Op::Conv2DTransposeBackpropFilter {
            input,
            grad,
            kernel_hw,
            ..
        } => match (shape_of(*input, shapes), shape_of(*grad, shapes)) {
            (ShapeFact::Tensor(x), ShapeFact::Tensor(g)) => {
                let [.., in_c] = nhwc(&x, "conv2d_transpose_backprop_filter input")?;
                let [.., out_c] = nhwc(&g, "conv2d_transpose_backprop_filter grad")?;
                Ok(ShapeFact::Tensor(vec![kernel_hw[0], kernel_hw[1], out_c, in_c]))
            }
            _ => Ok(ShapeFact::Unknown),
        },
        Op::MaxPool { input, spec } => infer_pool(*input, spec, shapes),
        Op::MaxPoolBackward { input, .. } => Ok(shape_of(*input, shapes)),
        Op::Reshape { input, shape } => match shape_of(*input, shapes) {
            ShapeFact::Tensor(source) => resolve_reshape(&source, shape)
                .map(ShapeFact::Tensor)
                .map_err(|err| err.message),
            ShapeFact::Unknown => Ok(ShapeFact::Unknown),
        },
        Op::ReshapeLike { like, .. } => Ok(shape_of(*like, shapes)),
        Op::SoftmaxCrossEntropy { logits, labels } => {
            match infer_same(*logits, *labels, shapes, "softmax_cross_entropy")? {
                ShapeFact::Tensor(shape) if shape.len() != 2 => Err(format!(
                    "softmax_cross_entropy expects [rows, classes], got {shape:?}"
                )),
                _ => Ok(ShapeFact::Tensor(Vec::new())),
            }
        }
        Op::SoftmaxCrossEntropyBackward { logits, .. } => Ok(shape_of(*logits, shapes)),
        Op::L2Loss(_) => Ok(ShapeFact::Tensor(Vec::new())),
    }
}

fn shape_of(value: ValueId, shapes: &HashMap<ValueId, ShapeFact>) -> ShapeFact {
    shapes.get(&value).cloned().unwrap_or(ShapeFact::Unknown)
}

fn nhwc(shape: &[usize], label: &str) -> Result<[usize; 4], String> {
    match shape {
        [n, h, w, c] => Ok([*n, *h, *w, *c]),
        other => Err(format!("{label} expects an NHWC tensor, got {other:?}")),
    }
}

fn infer_same(
    left: ValueId,
    right: ValueId,
    shapes: &HashMap<ValueId, ShapeFact>,
    label: &str,
) -> Result<ShapeFact, String> {
    match (shape_of(left, shapes), shape_of(right, shapes)) {
        (ShapeFact::Tensor(a), ShapeFact::Tensor(b)) => {
            if a == b {
                Ok(ShapeFact::Tensor(a))
            } else {
                Err(format!("Shape mismatch in {label}: {a:?} vs {b:?}"))
            }
        }
        (ShapeFact::Unknown, known) | (known, ShapeFact::Unknown) => Ok(known),
    }
}

fn infer_bias_add(
    input: ValueId,
    bias: ValueId,
    shapes: &HashMap<ValueId, ShapeFact>,
) -> Result<ShapeFact, String> {
    match (shape_of(input, shapes), shape_of(bias, shapes)) {
        (ShapeFact::Tensor(x), ShapeFact::Tensor(b)) => {
            if x.last().is_some_and(|c| b == [*c]) {
                Ok(ShapeFact::Tensor(x))
            } else {
                Err(format!("Shape mismatch in bias_add: input {x:?}, bias {b:?}"))
            }
        }
        (fact, _) => Ok(fact),
    }
}

fn infer_conv2d(
    input: ValueId,
    kernel: ValueId,
    spec: &Conv2DSpec,
    shapes: &HashMap<ValueId, ShapeFact>,
) -> Result<ShapeFact, String> {
    let (ShapeFact::Tensor(x), ShapeFact::Tensor(k)) =
        (shape_of(input, shapes), shape_of(kernel, shapes))
    else {
        return Ok(ShapeFact::Unknown);
    };
    let [n, h, w, c] = nhwc(&x, "conv2d input")?;
    let [kh, kw, k_in, k_out] = nhwc(&k, "conv2d kernel")?;
    if k_in != c {
        return Err(format!(
            "Shape mismatch in conv2d: input {x:?} has {c} channels, kernel {k:?} expects {k_in}"
        ));
    }
    let geometry = spec.geometry([h, w], [kh, kw]).map_err(|err| err.message)?;
    Ok(ShapeFact::Tensor(vec![
        n,
        geometry.out_hw[0],
        geometry.out_hw[1],
        k_out,
    ]))
}

fn infer_conv2d_transpose(
    input: ValueId,
    kernel: ValueId,
    spec: &Conv2DSpec,
    shapes: &HashMap<ValueId, ShapeFact>,
) -> Result<ShapeFact, String> {
    let (ShapeFact::Tensor(x), ShapeFact::Tensor(k)) =
        (shape_of(input, shapes), shape_of(kernel, shapes))
    else {
        return Ok(ShapeFact::Unknown);
    };
    let [n, h, w, c] = nhwc(&x, "conv2d_transpose input")?;
    let [kh, kw, k_out, k_in] = nhwc(&k, "conv2d_transpose kernel")?;
    if k_in != c {
        return Err(format!(
            "Shape mismatch in conv2d_transpose: input {x:?} has {c} channels, kernel {k:?} expects {k_in}"
        ));
    }
    let geometry = spec
        .transpose_geometry([h, w], [kh, kw])
        .map_err(|err| err.message)?;
    Ok(ShapeFact::Tensor(vec![
        n,
        geometry.in_hw[0],
        geometry.in_hw[1],
        k_out,
    ]))
}

fn infer_pool(
    input: ValueId,
    spec: &PoolSpec,
    shapes: &HashMap<ValueId, ShapeFact>,
) -> Result<ShapeFact, String> {
    let ShapeFact::Tensor(x) = shape_of(input, shapes) else {
        return Ok(ShapeFact::Unknown);
    };
    let [n, h, w, c] = nhwc(&x, "max_pool input")?;
    let geometry = spec.geometry([h, w]).map_err(|err| err.message)?;
    Ok(ShapeFact::Tensor(vec![
        n,
        geometry.out_hw[0],
        geometry.out_hw[1],
        c,
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::conv::Conv2DSpec;

    #[test]
    fn transpose_conv_shape_doubles_spatial_extent() {
        let mut graph = Graph::new();
        graph.bind_input_shape("x", vec![1, 5, 18, 2]);
        graph.bind_parameter_shape("k", vec![4, 4, 6, 2]);
        let (_, x) = graph.add_op(Op::Input("x".to_string())).expect("add op");
        let (_, k) = graph.add_op(Op::Parameter("k".to_string())).expect("add op");
        let (_, up) = graph
            .add_op(Op::Conv2DTranspose {
                input: x,
                kernel: k,
                spec: Conv2DSpec::same(2),
            })
            .expect("add op");

        let shapes = infer_shapes(&graph).expect("inference should pass");
        assert_eq!(shapes.get(&up), Some(&ShapeFact::Tensor(vec![1, 10, 36, 6])));
    }

    #[test]
    fn mismatched_add_reports_both_shapes() {
        let mut graph = Graph::new();
        graph.bind_input_shape("a", vec![1, 10, 36, 6]);
        graph.bind_input_shape("b", vec![1, 10, 36, 5]);
        let (_, a) = graph.add_op(Op::Input("a".to_string())).expect("add op");
        let (_, b) = graph.add_op(Op::Input("b".to_string())).expect("add op");
        graph.add_op(Op::Add(a, b)).expect("add op");

        let err = infer_shapes(&graph).expect_err("mismatch must fail");
        assert!(err.message.contains("[1, 10, 36, 6] vs [1, 10, 36, 5]"));
    }

    #[test]
    fn unbound_inputs_stay_unknown() {
        let mut graph = Graph::new();
        let (_, x) = graph.add_op(Op::Input("x".to_string())).expect("add op");
        let (_, y) = graph.add_op(Op::Relu(x)).expect("add op");
        let shapes = infer_shapes(&graph).expect("inference should pass");
        assert_eq!(shapes.get(&y), Some(&ShapeFact::Unknown));
    }
}
