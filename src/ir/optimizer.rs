use std::collections::HashMap;
use std::fmt;

use crate::ir::tensor::Tensor;

/// Update rule. The learning rate is not part of the config; it is supplied
/// with every step so a schedule can vary it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerConfig {
    Sgd,
    Adam {
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
}

impl OptimizerConfig {
    #[must_use]
    pub fn adam() -> Self {
        Self::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    step: usize,
    adam_m: HashMap<String, Tensor>,
    adam_v: HashMap<String, Tensor>,
}

impl OptimizerState {
    #[must_use]
    pub fn step(&self) -> usize {
        self.step
    }
}

#[derive(Debug, Clone)]
pub struct OptimizerError {
    pub message: String,
}

impl fmt::Display for OptimizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for OptimizerError {}

/// Applies one update to every `(name, parameter, gradient)` triple.
pub fn apply_gradients<'a>(
    updates: impl IntoIterator<Item = (&'a str, &'a mut Tensor, &'a Tensor)>,
    config: &OptimizerConfig,
    learning_rate: f32,
    state: &mut OptimizerState,
) -> Result<(), OptimizerError> {
    if !learning_rate.is_finite() || learning_rate < 0.0 {
        return Err(OptimizerError {
            message: format!("Learning rate must be finite and non-negative, got {learning_rate}"),
        });
    }
    state.step = state.step.saturating_add(1);

    for (name, parameter, gradient) in updates {
        if parameter.shape != gradient.shape {
            return Err(OptimizerError {
                message: format!(
                    "Shape mismatch in optimizer update for '{name}': {:?} vs {:?}",
                    parameter.shape, gradient.shape
                ),
            });
        }
        match config {
            OptimizerConfig::Sgd => apply_sgd(parameter, gradient, learning_rate),
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
            } => apply_adam(
                name,
                parameter,
                gradient,
                learning_rate,
                (*beta1, *beta2, *epsilon),
                state,
            )?,
        }
    }
    Ok(())
}

fn apply_sgd(parameter: &mut Tensor, gradient: &Tensor, lr: f32) {
    for (p, g) in parameter.data.iter_mut().zip(gradient.data.iter()) {
        *p -= lr * *g;
    }
}

fn apply_adam(
    name: &str,
    parameter: &mut Tensor,
    gradient: &Tensor,
    lr: f32,
    (beta1, beta2, epsilon): (f32, f32, f32),
    state: &mut OptimizerState,
) -> Result<(), OptimizerError> {
    let step_i32 = i32::try_from(state.step).map_err(|_| OptimizerError {
        message: "Optimizer step overflow for Adam bias correction".to_string(),
    })?;

    let zeros = || {
        Tensor::zeros(parameter.shape.clone()).map_err(|err| OptimizerError {
            message: format!("Failed to initialize Adam slots for '{name}': {}", err.message),
        })
    };
    if !state.adam_m.contains_key(name) {
        state.adam_m.insert(name.to_string(), zeros()?);
        state.adam_v.insert(name.to_string(), zeros()?);
    }
    let (Some(m), Some(v)) = (state.adam_m.get_mut(name), state.adam_v.get_mut(name)) else {
        return Err(OptimizerError {
            message: format!("Adam slots for '{name}' are missing"),
        });
    };

    let one_minus_beta1 = 1.0_f32 - beta1;
    let one_minus_beta2 = 1.0_f32 - beta2;
    let bias1 = 1.0_f32 - beta1.powi(step_i32);
    let bias2 = 1.0_f32 - beta2.powi(step_i32);

    for ((p, g), (m_i, v_i)) in parameter
        .data
        .iter_mut()
        .zip(gradient.data.iter())
        .zip(m.data.iter_mut().zip(v.data.iter_mut()))
    {
        *m_i = beta1 * *m_i + one_minus_beta1 * *g;
        *v_i = beta2 * *v_i + one_minus_beta2 * (*g * *g);

        let m_hat = *m_i / bias1;
        let v_hat = *v_i / bias2;
        *p -= lr * (m_hat / (v_hat.sqrt() + epsilon));
    }
    Ok(())
}
