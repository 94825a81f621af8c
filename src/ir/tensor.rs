use std::fmt;

/// Dense row-major `f32` tensor. A tensor with shape `[]` is a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct TensorError {
    pub message: String,
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TensorError {}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = element_count(&shape).ok_or_else(|| TensorError {
            message: "Invalid tensor shape: overflow while computing element count".to_string(),
        })?;
        if expected != data.len() {
            return Err(TensorError {
                message: format!(
                    "Tensor shape/data mismatch: shape implies {expected} elements, got {}",
                    data.len()
                ),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Result<Self, TensorError> {
        let count = element_count(&shape).ok_or_else(|| TensorError {
            message: "Invalid tensor shape: overflow while computing element count".to_string(),
        })?;
        Ok(Self {
            shape,
            data: vec![value; count],
        })
    }

    #[must_use]
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the single value of a one-element tensor.
    pub fn scalar_value(&self) -> Result<f32, TensorError> {
        if self.data.len() != 1 {
            return Err(TensorError {
                message: format!("Expected a scalar tensor, got shape {:?}", self.shape),
            });
        }
        Ok(self.data[0])
    }

    pub fn add(&self, other: &Self) -> Result<Self, TensorError> {
        if self.shape != other.shape {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in add: {:?} vs {:?}",
                    self.shape, other.shape
                ),
            });
        }
        let out = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| *a + *b)
            .collect();
        Self::new(self.shape.clone(), out)
    }

    pub fn scale(&self, factor: f32) -> Result<Self, TensorError> {
        let out = self.data.iter().map(|value| *value * factor).collect();
        Self::new(self.shape.clone(), out)
    }

    /// Multiplies every element by the value of a scalar tensor.
    pub fn scale_by(&self, scalar: &Self) -> Result<Self, TensorError> {
        let factor = scalar.scalar_value().map_err(|err| TensorError {
            message: format!("scale_by: {}", err.message),
        })?;
        self.scale(factor)
    }

    pub fn add_inplace_scaled(&mut self, grad: &Self, scale: f32) -> Result<(), TensorError> {
        if self.shape != grad.shape {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in add_inplace_scaled: {:?} vs {:?}",
                    self.shape, grad.shape
                ),
            });
        }
        for (value, delta) in self.data.iter_mut().zip(grad.data.iter()) {
            *value += *delta * scale;
        }
        Ok(())
    }

    pub fn relu(&self) -> Result<Self, TensorError> {
        let out = self.data.iter().map(|value| value.max(0.0)).collect();
        Self::new(self.shape.clone(), out)
    }

    pub fn relu_backward(&self, grad_output: &Self) -> Result<Self, TensorError> {
        if self.shape != grad_output.shape {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in relu_backward: {:?} vs {:?}",
                    self.shape, grad_output.shape
                ),
            });
        }
        let out = self
            .data
            .iter()
            .zip(grad_output.data.iter())
            .map(|(x, g)| if *x > 0.0 { *g } else { 0.0 })
            .collect();
        Self::new(self.shape.clone(), out)
    }

    /// Adds a per-channel bias along the last axis.
    pub fn bias_add(&self, bias: &Self) -> Result<Self, TensorError> {
        let channels = self.shape.last().copied().unwrap_or(0);
        if bias.shape != [channels] {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in bias_add: input {:?}, bias {:?}",
                    self.shape, bias.shape
                ),
            });
        }
        let mut out = self.data.clone();
        for row in out.chunks_mut(channels.max(1)) {
            for (value, b) in row.iter_mut().zip(bias.data.iter()) {
                *value += *b;
            }
        }
        Self::new(self.shape.clone(), out)
    }

    /// Sums over every axis except the last one.
    pub fn reduce_to_last_axis(&self) -> Result<Self, TensorError> {
        let Some(&channels) = self.shape.last() else {
            return Err(TensorError {
                message: "reduce_to_last_axis expects a tensor of rank >= 1".to_string(),
            });
        };
        let mut out = vec![0.0_f32; channels];
        if channels > 0 {
            for row in self.data.chunks(channels) {
                for (acc, value) in out.iter_mut().zip(row.iter()) {
                    *acc += *value;
                }
            }
        }
        Self::new(vec![channels], out)
    }

    /// Reshapes to `target`, where a single `-1` entry is inferred.
    pub fn reshape(&self, target: &[isize]) -> Result<Self, TensorError> {
        let shape = resolve_reshape(&self.shape, target)?;
        Self::new(shape, self.data.clone())
    }

    pub fn reshape_exact(&self, shape: Vec<usize>) -> Result<Self, TensorError> {
        Self::new(shape, self.data.clone())
    }

    /// `sum(x^2) / 2`.
    #[must_use]
    pub fn l2_loss(&self) -> Self {
        let sum = self.data.iter().map(|value| value * value).sum::<f32>();
        Self::scalar(sum * 0.5)
    }

    /// Row-wise softmax of a rank-2 `[rows, classes]` tensor.
    pub fn softmax_rows(&self) -> Result<Self, TensorError> {
        let (_, classes) = rank2_dims(&self.shape, "softmax_rows")?;
        let mut out = self.data.clone();
        if classes == 0 {
            return Self::new(self.shape.clone(), out);
        }
        for row in out.chunks_mut(classes) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0_f32;
            for value in row.iter_mut() {
                *value = (*value - max).exp();
                sum += *value;
            }
            for value in row.iter_mut() {
                *value /= sum;
            }
        }
        Self::new(self.shape.clone(), out)
    }

    /// Mean over rows of `-sum(labels * log_softmax(logits))`; returns a scalar.
    pub fn softmax_cross_entropy(&self, labels: &Self) -> Result<Self, TensorError> {
        let (rows, classes) = rank2_dims(&self.shape, "softmax_cross_entropy")?;
        if labels.shape != self.shape {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in softmax_cross_entropy: logits {:?} vs labels {:?}",
                    self.shape, labels.shape
                ),
            });
        }
        if rows == 0 || classes == 0 {
            return Err(TensorError {
                message: "softmax_cross_entropy expects a non-empty [rows, classes] tensor"
                    .to_string(),
            });
        }
        let mut total = 0.0_f64;
        for (row, label_row) in self.data.chunks(classes).zip(labels.data.chunks(classes)) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum = row.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
            for (logit, label) in row.iter().zip(label_row.iter()) {
                total += f64::from(*label * (log_sum - *logit));
            }
        }
        Ok(Self::scalar((total / rows as f64) as f32))
    }

    /// Gradient of [`Tensor::softmax_cross_entropy`] with respect to the logits.
    pub fn softmax_cross_entropy_backward(
        &self,
        labels: &Self,
        grad: &Self,
    ) -> Result<Self, TensorError> {
        let (rows, classes) = rank2_dims(&self.shape, "softmax_cross_entropy_backward")?;
        if labels.shape != self.shape {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in softmax_cross_entropy_backward: logits {:?} vs labels {:?}",
                    self.shape, labels.shape
                ),
            });
        }
        let upstream = grad.scalar_value()?;
        let probs = self.softmax_rows()?;
        let factor = upstream / rows.max(1) as f32;
        let mut out = probs.data;
        for (row, label_row) in out
            .chunks_mut(classes.max(1))
            .zip(labels.data.chunks(classes.max(1)))
        {
            let label_mass = label_row.iter().sum::<f32>();
            for (value, label) in row.iter_mut().zip(label_row.iter()) {
                *value = (*value * label_mass - *label) * factor;
            }
        }
        Self::new(self.shape.clone(), out)
    }

    #[must_use]
    pub fn all_finite(&self) -> bool {
        self.data.iter().all(|value| value.is_finite())
    }
}

pub(crate) fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
}

/// Resolves a reshape target with at most one `-1` wildcard against a concrete shape.
pub fn resolve_reshape(source: &[usize], target: &[isize]) -> Result<Vec<usize>, TensorError> {
    let total = element_count(source).ok_or_else(|| TensorError {
        message: format!("reshape: element count overflow for {source:?}"),
    })?;
    let mut wildcard = None;
    let mut known = 1usize;
    let mut shape = Vec::with_capacity(target.len());
    for (axis, dim) in target.iter().enumerate() {
        match *dim {
            -1 => {
                if wildcard.replace(axis).is_some() {
                    return Err(TensorError {
                        message: format!("reshape: more than one -1 in target {target:?}"),
                    });
                }
                shape.push(0);
            }
            d if d >= 0 => {
                let d = d as usize;
                known = known.checked_mul(d).ok_or_else(|| TensorError {
                    message: format!("reshape: target {target:?} overflows"),
                })?;
                shape.push(d);
            }
            _ => {
                return Err(TensorError {
                    message: format!("reshape: invalid dimension {dim} in target {target:?}"),
                });
            }
        }
    }
    if let Some(axis) = wildcard {
        if known == 0 || total % known != 0 {
            return Err(TensorError {
                message: format!("reshape: cannot reshape {source:?} into {target:?}"),
            });
        }
        shape[axis] = total / known;
    } else if known != total {
        return Err(TensorError {
            message: format!("reshape: cannot reshape {source:?} into {target:?}"),
        });
    }
    Ok(shape)
}

fn rank2_dims(shape: &[usize], op: &str) -> Result<(usize, usize), TensorError> {
    if shape.len() != 2 {
        return Err(TensorError {
            message: format!("{op} expects a rank-2 tensor, got {shape:?}"),
        });
    }
    Ok((shape[0], shape[1]))
}
