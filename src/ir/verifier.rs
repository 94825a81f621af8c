use std::collections::HashMap;
use std::fmt;

use crate::ir::tensor::element_count;
use crate::ir::{Graph, Op, ShapeFact, ValueId, infer_shapes};

#[derive(Debug, Clone)]
pub struct VerifyError {
    pub message: String,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for VerifyError {}

pub fn verify_graph(graph: &Graph) -> Result<(), VerifyError> {
    let mut value_producer: HashMap<ValueId, usize> = HashMap::new();

    for (index, node) in graph.nodes.iter().enumerate() {
        if node.id.0 != index {
            return Err(err(format!(
                "Node id mismatch at index {index}: node.id={}",
                node.id.0
            )));
        }

        if value_producer.insert(node.output, index).is_some() {
            return Err(err(format!(
                "SSA violation: ValueId {} assigned more than once",
                node.output.0
            )));
        }

        for input in node.op.input_values() {
            let Some(producer_index) = value_producer.get(&input).copied() else {
                return Err(err(format!(
                    "Use-before-def or missing ValueId {} in node {}",
                    input.0, node.id.0
                )));
            };
            if producer_index >= index {
                return Err(err(format!(
                    "ValueId {} used before producer is available in node {}",
                    input.0, node.id.0
                )));
            }
        }

        if let Op::ConstTensor { shape, data } = &node.op
            && element_count(shape) != Some(data.len())
        {
            return Err(err(format!(
                "const_tensor {shape:?} in node {} carries {} values",
                node.id.0,
                data.len()
            )));
        }

        if let Some(name) = &node.name
            && graph.value_by_name(name) != Some(node.output)
        {
            return Err(err(format!(
                "Node {} is named '{name}' but the name index disagrees",
                node.id.0
            )));
        }
    }

    let shapes = infer_shapes(graph).map_err(|shape_err| err(shape_err.message))?;

    for node in &graph.nodes {
        if let Op::Dropout { keep_prob, .. } | Op::DropoutBackward { keep_prob, .. } = &node.op
            && let Some(ShapeFact::Tensor(shape)) = shapes.get(keep_prob)
            && !shape.is_empty()
        {
            return Err(err(format!(
                "dropout keep_prob in node {} must be a scalar, got {shape:?}",
                node.id.0
            )));
        }
    }

    Ok(())
}

fn err(message: impl Into<String>) -> VerifyError {
    VerifyError {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::verify_graph;
    use crate::ir::node::{Node, NodeId, ValueId};
    use crate::ir::{Graph, Op};

    #[test]
    fn accepts_well_formed_graph() {
        let mut graph = Graph::new();
        graph.bind_input_shape("x", vec![1, 2, 2, 3]);
        let (_, x) = graph
            .add_op(Op::Input("x".to_string()))
            .expect("add op should succeed");
        graph.add_op(Op::Relu(x)).expect("add op should succeed");
        verify_graph(&graph).expect("graph should verify");
    }

    #[test]
    fn rejects_hand_built_forward_reference() {
        let mut graph = Graph::new();
        graph
            .nodes
            .push(Node::new(NodeId(0), Op::Relu(ValueId(1)), ValueId(0)));
        graph.nodes.push(Node::new(
            NodeId(1),
            Op::Input("x".to_string()),
            ValueId(1),
        ));
        let error = verify_graph(&graph).expect_err("forward reference must fail");
        assert!(error.message.contains("ValueId 1"));
    }

    #[test]
    fn rejects_const_tensor_with_wrong_payload() {
        let mut graph = Graph::new();
        graph
            .add_op(Op::ConstTensor {
                shape: vec![2, 2],
                data: vec![1.0],
            })
            .expect("add op should succeed");
        assert!(verify_graph(&graph).is_err());
    }

    #[test]
    fn rejects_non_scalar_keep_prob() {
        let mut graph = Graph::new();
        graph.bind_input_shape("x", vec![1, 2, 2, 3]);
        graph.bind_input_shape("keep_prob", vec![2]);
        let (_, x) = graph
            .add_op(Op::Input("x".to_string()))
            .expect("add op should succeed");
        let (_, keep) = graph
            .add_op(Op::Input("keep_prob".to_string()))
            .expect("add op should succeed");
        graph
            .add_op(Op::Dropout {
                input: x,
                keep_prob: keep,
                mask_key: 2,
            })
            .expect("add op should succeed");
        let error = verify_graph(&graph).expect_err("vector keep_prob must fail");
        assert!(error.message.contains("must be a scalar"));
    }
}
