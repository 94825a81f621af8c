pub mod autograd;
pub mod conv;
pub mod graph;
pub mod interpreter;
pub mod node;
pub mod op;
pub mod optimizer;
pub mod printer;
pub mod shape_inference;
pub mod tensor;
pub mod verifier;

pub use autograd::{AutogradError, GradientGraph, build_reverse_graph};
pub use conv::{Conv2DSpec, Padding, PoolSpec};
pub use graph::{Graph, GraphError, ShapeSignature};
pub use interpreter::{ExecutionContext, InterpreterError, execute_value, execute_values};
pub use node::{Node, NodeId, ValueId};
pub use op::Op;
pub use optimizer::{OptimizerConfig, OptimizerError, OptimizerState, apply_gradients};
pub use printer::print_graph;
pub use shape_inference::{ShapeError, ShapeFact, infer_op_shape, infer_shapes};
pub use tensor::{Tensor, TensorError};
pub use verifier::{VerifyError, verify_graph};
