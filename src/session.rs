//! Execution context: owns the graph, the variables and their values, and
//! the optimizer state of every train step built on it.
//!
//! Shapes are inferred as ops are added, so a shape mismatch surfaces at the
//! call that builds the offending op rather than at run time.

use std::collections::HashMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ir::{
    AutogradError, ExecutionContext, GradientGraph, Graph, GraphError, InterpreterError, Op,
    OptimizerConfig, OptimizerError, OptimizerState, ShapeError, ShapeFact, Tensor, TensorError,
    ValueId, apply_gradients, build_reverse_graph, execute_values, infer_op_shape,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("shape error: {0}")]
    Shape(#[from] ShapeError),
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),
    #[error("autograd error: {0}")]
    Autograd(#[from] AutogradError),
    #[error("execution error: {0}")]
    Execution(#[from] InterpreterError),
    #[error("optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),
    #[error("value %{0} is not defined in this session")]
    UnknownValue(usize),
    #[error("value %{0} is not a placeholder")]
    NotAPlaceholder(usize),
    #[error("feed for '{name}' has shape {actual:?}, expected {expected:?} (leading axis free)")]
    FeedShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("placeholder '{0}' was not fed")]
    MissingFeed(String),
    #[error("variables must be initialized before running the graph")]
    Uninitialized,
    #[error("variable '{0}' already exists")]
    DuplicateVariable(String),
    #[error("none of the listed variables receives a gradient from the loss")]
    NoGradients,
    #[error("train step #{0} does not exist")]
    UnknownTrainStep(usize),
    #[error("value %{0} was added after the train step was built and cannot be fetched with it")]
    FetchAfterTrainStep(usize),
}

/// Where a variable came from; selects which variables a frozen backbone excludes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableOrigin {
    Backbone,
    Decoder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Initializer {
    Zeros,
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))` with the receptive field
    /// folded into both fans.
    GlorotUniform,
    /// A restored value, used for pretrained weights.
    Value(Tensor),
}

impl Initializer {
    fn materialize(&self, shape: &[usize], rng: &mut ChaCha8Rng) -> Result<Tensor, TensorError> {
        match self {
            Initializer::Zeros => Tensor::zeros(shape.to_vec()),
            Initializer::GlorotUniform => {
                let (fan_in, fan_out) = fans(shape);
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                let count = shape.iter().product::<usize>();
                let data = (0..count).map(|_| rng.gen_range(-limit..=limit)).collect();
                Tensor::new(shape.to_vec(), data)
            }
            Initializer::Value(tensor) => {
                if tensor.shape != shape {
                    return Err(TensorError {
                        message: format!(
                            "initial value has shape {:?}, variable expects {shape:?}",
                            tensor.shape
                        ),
                    });
                }
                Ok(tensor.clone())
            }
        }
    }
}

fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [rest @ .., fan_in, fan_out] => {
            let receptive = rest.iter().product::<usize>();
            (fan_in * receptive, fan_out * receptive)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub value: ValueId,
    pub shape: Vec<usize>,
    pub origin: VariableOrigin,
    initializer: Initializer,
}

/// Handle returned by [`Session::minimize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainStep(usize);

#[derive(Debug)]
struct TrainStepState {
    gradients: GradientGraph,
    /// Values defined in the forward graph when the step was built.
    forward_len: usize,
    /// `(variable name, gradient value)` in variable creation order.
    updates: Vec<(String, ValueId)>,
    learning_rate: ValueId,
    config: OptimizerConfig,
    optimizer: OptimizerState,
}

#[derive(Debug)]
pub struct Session {
    graph: Graph,
    shapes: HashMap<ValueId, ShapeFact>,
    variables: Vec<Variable>,
    values: HashMap<String, Arc<Tensor>>,
    train_steps: Vec<TrainStepState>,
    seed: u64,
    global_step: u64,
    initialized: bool,
}

impl Session {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            graph: Graph::new(),
            shapes: HashMap::new(),
            variables: Vec::new(),
            values: HashMap::new(),
            train_steps: Vec::new(),
            seed,
            global_step: 0,
            initialized: false,
        }
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of train steps run so far.
    #[must_use]
    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Adds an op after checking its static shape.
    pub fn add(&mut self, op: Op) -> Result<ValueId, SessionError> {
        let fact = infer_op_shape(&self.graph, &op, &self.shapes).map_err(|message| ShapeError {
            message: format!("{} (building '{}')", message, op.mnemonic()),
        })?;
        let (_, value) = self.graph.add_op(op)?;
        self.shapes.insert(value, fact);
        Ok(value)
    }

    /// Declares a named input. A non-empty `shape` has a free leading batch axis.
    pub fn placeholder(&mut self, name: &str, shape: Vec<usize>) -> Result<ValueId, SessionError> {
        if self.graph.value_by_name(name).is_some() {
            return Err(GraphError {
                message: format!("Tensor name '{name}' is already in use"),
            }
            .into());
        }
        self.graph.bind_input_shape(name, shape);
        let value = self.add(Op::Input(name.to_string()))?;
        self.graph.set_name(name, value)?;
        Ok(value)
    }

    pub fn variable(
        &mut self,
        name: &str,
        shape: Vec<usize>,
        initializer: Initializer,
        origin: VariableOrigin,
    ) -> Result<ValueId, SessionError> {
        if self.variables.iter().any(|var| var.name == name)
            || self.graph.value_by_name(name).is_some()
        {
            return Err(SessionError::DuplicateVariable(name.to_string()));
        }
        if let Initializer::Value(tensor) = &initializer
            && tensor.shape != shape
        {
            return Err(TensorError {
                message: format!(
                    "initial value for '{name}' has shape {:?}, variable expects {shape:?}",
                    tensor.shape
                ),
            }
            .into());
        }
        self.graph.bind_parameter_shape(name, shape.clone());
        let value = self.add(Op::Parameter(name.to_string()))?;
        self.graph.set_name(name, value)?;
        self.variables.push(Variable {
            name: name.to_string(),
            value,
            shape,
            origin,
            initializer,
        });
        Ok(value)
    }

    pub fn set_name(&mut self, name: &str, value: ValueId) -> Result<(), SessionError> {
        self.graph.set_name(name, value)?;
        Ok(())
    }

    #[must_use]
    pub fn value_by_name(&self, name: &str) -> Option<ValueId> {
        self.graph.value_by_name(name)
    }

    /// Static shape of `value`; placeholders report a nominal batch of 1.
    #[must_use]
    pub fn shape(&self, value: ValueId) -> Option<&[usize]> {
        match self.shapes.get(&value) {
            Some(ShapeFact::Tensor(shape)) => Some(shape.as_slice()),
            _ => None,
        }
    }

    pub fn static_shape(&self, value: ValueId) -> Result<Vec<usize>, SessionError> {
        self.shape(value)
            .map(<[usize]>::to_vec)
            .ok_or(SessionError::UnknownValue(value.0))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    #[must_use]
    pub fn variable_value(&self, name: &str) -> Option<&Tensor> {
        self.values.get(name).map(Arc::as_ref)
    }

    /// Runs every variable's initializer. Calling it again resets all values.
    pub fn initialize_variables(&mut self) -> Result<(), SessionError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut values = HashMap::with_capacity(self.variables.len());
        for var in &self.variables {
            let tensor = var.initializer.materialize(&var.shape, &mut rng)?;
            values.insert(var.name.clone(), Arc::new(tensor));
        }
        self.values = values;
        self.initialized = true;
        debug!(variables = self.variables.len(), "initialized variables");
        Ok(())
    }

    /// Evaluates `fetches` with the given placeholder feeds.
    pub fn run(
        &self,
        fetches: &[ValueId],
        feeds: Vec<(ValueId, Tensor)>,
    ) -> Result<Vec<Arc<Tensor>>, SessionError> {
        for fetch in fetches {
            if fetch.0 >= self.graph.value_count() {
                return Err(SessionError::UnknownValue(fetch.0));
            }
        }
        let context = self.context(feeds)?;
        Ok(execute_values(&self.graph, fetches, &context)?)
    }

    /// Builds a train step that minimizes the scalar `loss` over `var_list`,
    /// reading the learning rate from the scalar placeholder `learning_rate`.
    pub fn minimize(
        &mut self,
        loss: ValueId,
        var_list: &[ValueId],
        learning_rate: ValueId,
        config: OptimizerConfig,
    ) -> Result<TrainStep, SessionError> {
        let Some(Op::Input(_)) = self.graph.producer(learning_rate).map(|node| &node.op) else {
            return Err(SessionError::NotAPlaceholder(learning_rate.0));
        };
        let gradients = build_reverse_graph(&self.graph, loss, var_list)?;

        let mut updates = Vec::new();
        for var in &self.variables {
            if !var_list.contains(&var.value) {
                continue;
            }
            match gradients.gradients.get(&var.value) {
                Some(grad) => updates.push((var.name.clone(), *grad)),
                None => warn!(
                    variable = %var.name,
                    "variable does not affect the loss; it will not be updated"
                ),
            }
        }
        if updates.is_empty() {
            return Err(SessionError::NoGradients);
        }
        debug!(
            variables = updates.len(),
            backward_nodes = gradients.backward.nodes.len(),
            "built train step"
        );

        self.train_steps.push(TrainStepState {
            forward_len: self.graph.value_count(),
            gradients,
            updates,
            learning_rate,
            config,
            optimizer: OptimizerState::default(),
        });
        Ok(TrainStep(self.train_steps.len() - 1))
    }

    /// Runs one update of every variable in the step's list and returns the
    /// fetched values, computed before the update.
    pub fn run_train_step(
        &mut self,
        step: TrainStep,
        fetches: &[ValueId],
        feeds: Vec<(ValueId, Tensor)>,
    ) -> Result<Vec<Arc<Tensor>>, SessionError> {
        let context = self.context(feeds)?;
        let state = self
            .train_steps
            .get_mut(step.0)
            .ok_or(SessionError::UnknownTrainStep(step.0))?;
        let forward_len = state.forward_len;
        for fetch in fetches {
            if fetch.0 >= self.graph.value_count() {
                return Err(SessionError::UnknownValue(fetch.0));
            }
            if fetch.0 >= forward_len {
                return Err(SessionError::FetchAfterTrainStep(fetch.0));
            }
        }

        let learning_rate = {
            let name = match self.graph.producer(state.learning_rate).map(|node| &node.op) {
                Some(Op::Input(name)) => name,
                _ => return Err(SessionError::NotAPlaceholder(state.learning_rate.0)),
            };
            context
                .inputs
                .get(name)
                .ok_or_else(|| SessionError::MissingFeed(name.clone()))?
                .scalar_value()?
        };

        let mut targets = fetches.to_vec();
        targets.extend(state.updates.iter().map(|(_, grad)| *grad));
        let mut results = execute_values(&state.gradients.backward, &targets, &context)?;
        let grads = results.split_off(fetches.len());
        drop(context);

        let mut owned = Vec::with_capacity(grads.len());
        for ((name, _), grad) in state.updates.iter().zip(grads) {
            let current = self
                .values
                .remove(name)
                .ok_or(SessionError::Uninitialized)?;
            owned.push((name.as_str(), Arc::unwrap_or_clone(current), grad));
        }
        let applied = apply_gradients(
            owned
                .iter_mut()
                .map(|(name, value, grad)| (*name, value, &**grad)),
            &state.config,
            learning_rate,
            &mut state.optimizer,
        );
        for (name, value, _) in owned {
            self.values.insert(name.to_string(), Arc::new(value));
        }
        applied?;

        self.global_step += 1;
        Ok(results)
    }

    fn context(&self, feeds: Vec<(ValueId, Tensor)>) -> Result<ExecutionContext, SessionError> {
        if !self.initialized && !self.variables.is_empty() {
            return Err(SessionError::Uninitialized);
        }
        let mut inputs = HashMap::with_capacity(feeds.len());
        for (placeholder, tensor) in feeds {
            let name = match self.graph.producer(placeholder).map(|node| &node.op) {
                Some(Op::Input(name)) => name.clone(),
                Some(_) => return Err(SessionError::NotAPlaceholder(placeholder.0)),
                None => return Err(SessionError::UnknownValue(placeholder.0)),
            };
            if let Some(expected) = self.graph.input_shape(&name)
                && !feed_matches(expected, &tensor.shape)
            {
                return Err(SessionError::FeedShape {
                    name,
                    expected: expected.to_vec(),
                    actual: tensor.shape,
                });
            }
            inputs.insert(name, Arc::new(tensor));
        }
        Ok(ExecutionContext {
            inputs,
            parameters: self.values.clone(),
            dropout_seed: mix_seed(self.seed, self.global_step),
        })
    }
}

fn feed_matches(expected: &[usize], actual: &[usize]) -> bool {
    match (expected.split_first(), actual.split_first()) {
        (None, None) => true,
        (Some((_, expected_rest)), Some((batch, actual_rest))) => {
            *batch > 0 && expected_rest == actual_rest
        }
        _ => false,
    }
}

fn mix_seed(seed: u64, step: u64) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .rotate_left(17)
        ^ step
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glorot_limit_uses_receptive_field() {
        assert_eq!(fans(&[4, 4, 6, 2]), (96, 32));
        assert_eq!(fans(&[1, 1, 8, 2]), (8, 2));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let kernel = Initializer::GlorotUniform
            .materialize(&[1, 1, 8, 2], &mut rng)
            .expect("init");
        let limit = (6.0_f32 / 10.0).sqrt();
        assert!(kernel.data.iter().all(|v| v.abs() <= limit));
    }

    #[test]
    fn feeds_may_change_the_batch_axis_only() {
        assert!(feed_matches(&[1, 4, 4, 3], &[7, 4, 4, 3]));
        assert!(!feed_matches(&[1, 4, 4, 3], &[7, 4, 5, 3]));
        assert!(!feed_matches(&[1, 4, 4, 3], &[0, 4, 4, 3]));
        assert!(feed_matches(&[], &[]));
        assert!(!feed_matches(&[], &[1]));
    }

    #[test]
    fn shape_errors_surface_when_the_op_is_built() {
        let mut session = Session::new(0);
        let a = session.placeholder("a", vec![1, 2, 2, 3]).expect("placeholder");
        let b = session.placeholder("b", vec![1, 2, 2, 4]).expect("placeholder");
        let err = session.add(Op::Add(a, b)).expect_err("mismatch must fail");
        assert!(matches!(err, SessionError::Shape(_)));
        assert_eq!(session.graph().nodes.len(), 2);
    }

    #[test]
    fn running_before_initialization_fails() {
        let mut session = Session::new(0);
        let w = session
            .variable("w", vec![2], Initializer::Zeros, VariableOrigin::Decoder)
            .expect("variable");
        assert!(matches!(
            session.run(&[w], Vec::new()),
            Err(SessionError::Uninitialized)
        ));
        session.initialize_variables().expect("init");
        let out = session.run(&[w], Vec::new()).expect("run");
        assert_eq!(out[0].data, vec![0.0, 0.0]);
    }

    #[test]
    fn train_step_updates_listed_variables_once() {
        let mut session = Session::new(3);
        let w = session
            .variable(
                "w",
                vec![2],
                Initializer::Value(Tensor::new(vec![2], vec![1.0, -2.0]).expect("tensor")),
                VariableOrigin::Decoder,
            )
            .expect("variable");
        let frozen = session
            .variable(
                "frozen",
                vec![2],
                Initializer::Value(Tensor::new(vec![2], vec![5.0, 5.0]).expect("tensor")),
                VariableOrigin::Backbone,
            )
            .expect("variable");
        let lr = session.placeholder("learning_rate", Vec::new()).expect("lr");
        let sum = session.add(Op::Add(w, frozen)).expect("add");
        let loss = session.add(Op::L2Loss(sum)).expect("loss");
        let step = session
            .minimize(loss, &[w], lr, OptimizerConfig::Sgd)
            .expect("minimize");

        session.initialize_variables().expect("init");
        let fetched = session
            .run_train_step(step, &[loss], vec![(lr, Tensor::scalar(0.1))])
            .expect("train step");

        // loss = ((6)^2 + (3)^2) / 2; grad = w + frozen
        assert!((fetched[0].data[0] - 22.5).abs() < 1e-5);
        let w_after = session.variable_value("w").expect("w");
        assert!((w_after.data[0] - 0.4).abs() < 1e-6);
        assert!((w_after.data[1] + 2.3).abs() < 1e-6);
        assert_eq!(
            session.variable_value("frozen").expect("frozen").data,
            vec![5.0, 5.0]
        );
        assert_eq!(session.global_step(), 1);
    }

    #[test]
    fn values_added_after_minimize_cannot_be_fetched_by_the_step() {
        let mut session = Session::new(0);
        let w = session
            .variable(
                "w",
                vec![1],
                Initializer::Value(Tensor::new(vec![1], vec![3.0]).expect("tensor")),
                VariableOrigin::Decoder,
            )
            .expect("variable");
        let lr = session.placeholder("learning_rate", Vec::new()).expect("lr");
        let loss = session.add(Op::L2Loss(w)).expect("loss");
        let step = session
            .minimize(loss, &[w], lr, OptimizerConfig::Sgd)
            .expect("minimize");
        let doubled = session
            .add(Op::Scale {
                input: loss,
                factor: 2.0,
            })
            .expect("scale");
        session.initialize_variables().expect("init");

        let err = session
            .run_train_step(step, &[doubled], vec![(lr, Tensor::scalar(0.1))])
            .expect_err("value postdates the train step");
        assert!(matches!(err, SessionError::FetchAfterTrainStep(id) if id == doubled.0));
        assert_eq!(session.global_step(), 0);
        assert_eq!(session.variable_value("w").expect("w").data, vec![3.0]);

        // The plain run path still sees the new value.
        let out = session.run(&[doubled], Vec::new()).expect("run");
        assert!((out[0].data[0] - 9.0).abs() < 1e-6);
    }

    #[test]
    fn learning_rate_must_be_fed() {
        let mut session = Session::new(0);
        let w = session
            .variable("w", vec![1], Initializer::Zeros, VariableOrigin::Decoder)
            .expect("variable");
        let lr = session.placeholder("learning_rate", Vec::new()).expect("lr");
        let loss = session.add(Op::L2Loss(w)).expect("loss");
        let step = session
            .minimize(loss, &[w], lr, OptimizerConfig::Sgd)
            .expect("minimize");
        session.initialize_variables().expect("init");
        assert!(matches!(
            session.run_train_step(step, &[], Vec::new()),
            Err(SessionError::MissingFeed(name)) if name == "learning_rate"
        ));
    }
}
