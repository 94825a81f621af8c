use crate::ir::op::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub output: ValueId,
    /// Logical tensor name, when the value is addressable by name.
    pub name: Option<String>,
}

impl Node {
    pub fn new(id: NodeId, op: Op, output: ValueId) -> Self {
        Self {
            id,
            op,
            output,
            name: None,
        }
    }
}
