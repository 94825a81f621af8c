use std::collections::BTreeMap;
use std::fmt;

use crate::ir::node::{Node, NodeId, ValueId};
use crate::ir::op::Op;

/// Static shapes bound to placeholders and variables. Placeholder shapes
/// record a nominal leading batch of 1.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct ShapeSignature {
    pub inputs: BTreeMap<String, Vec<usize>>,
    pub parameters: BTreeMap<String, Vec<usize>>,
}

/// Single-block SSA graph: every node produces exactly one value and may only
/// consume values produced by earlier nodes.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub shape_signature: ShapeSignature,
    names: BTreeMap<String, ValueId>,
}

#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for GraphError {}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_input_shape(&mut self, name: &str, shape: Vec<usize>) {
        self.shape_signature.inputs.insert(name.to_string(), shape);
    }

    pub fn bind_parameter_shape(&mut self, name: &str, shape: Vec<usize>) {
        self.shape_signature
            .parameters
            .insert(name.to_string(), shape);
    }

    #[must_use]
    pub fn input_shape(&self, name: &str) -> Option<&[usize]> {
        self.shape_signature
            .inputs
            .get(name)
            .map(std::vec::Vec::as_slice)
    }

    #[must_use]
    pub fn parameter_shape(&self, name: &str) -> Option<&[usize]> {
        self.shape_signature
            .parameters
            .get(name)
            .map(std::vec::Vec::as_slice)
    }

    pub fn add_op(&mut self, op: Op) -> Result<(NodeId, ValueId), GraphError> {
        for input in op.input_values() {
            if input.0 >= self.nodes.len() {
                return Err(GraphError {
                    message: format!(
                        "{} references undefined value %{}",
                        op.mnemonic(),
                        input.0
                    ),
                });
            }
        }
        let node_id = NodeId(self.nodes.len());
        let value_id = ValueId(self.nodes.len());
        self.nodes.push(Node::new(node_id, op, value_id));
        Ok((node_id, value_id))
    }

    /// Makes `value` addressable as `name`. Names are unique per graph.
    pub fn set_name(&mut self, name: &str, value: ValueId) -> Result<(), GraphError> {
        if let Some(existing) = self.names.get(name) {
            return Err(GraphError {
                message: format!("Tensor name '{name}' already bound to %{}", existing.0),
            });
        }
        let node = self.nodes.get_mut(value.0).ok_or_else(|| GraphError {
            message: format!("Cannot name undefined value %{}", value.0),
        })?;
        node.name = Some(name.to_string());
        self.names.insert(name.to_string(), value);
        Ok(())
    }

    #[must_use]
    pub fn value_by_name(&self, name: &str) -> Option<ValueId> {
        self.names.get(name).copied()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    #[must_use]
    pub fn producer(&self, value: ValueId) -> Option<&Node> {
        self.nodes.get(value.0)
    }

    #[must_use]
    pub fn value_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn last_value_id(&self) -> Option<ValueId> {
        self.nodes.last().map(|node| node.output)
    }
}
