use crate::ir::{Op, ValueId};
use crate::session::{Session, SessionError};

#[derive(Debug, Clone, PartialEq)]
pub struct RegularizationTerm {
    /// Variable the penalty is computed from.
    pub variable: String,
    /// Scalar penalty value.
    pub loss: ValueId,
}

/// Penalties registered while building layers, handed to the objective
/// explicitly instead of living in a graph-wide collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegularizationLosses {
    terms: Vec<RegularizationTerm>,
}

impl RegularizationLosses {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, variable: impl Into<String>, loss: ValueId) {
        self.terms.push(RegularizationTerm {
            variable: variable.into(),
            loss,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegularizationTerm> {
        self.terms.iter()
    }

    #[must_use]
    pub fn losses(&self) -> Vec<ValueId> {
        self.terms.iter().map(|term| term.loss).collect()
    }

    /// Builds the sum of all penalties, or `None` when nothing is registered.
    pub fn total(&self, session: &mut Session) -> Result<Option<ValueId>, SessionError> {
        let mut total: Option<ValueId> = None;
        for term in &self.terms {
            total = Some(match total {
                Some(acc) => session.add(Op::Add(acc, term.loss))?,
                None => term.loss,
            });
        }
        Ok(total)
    }
}

/// `scale * sum(w^2) / 2`, the usual L2 weight penalty.
pub fn l2_regularizer(
    session: &mut Session,
    weight: ValueId,
    scale: f32,
) -> Result<ValueId, SessionError> {
    let l2 = session.add(Op::L2Loss(weight))?;
    session.add(Op::Scale {
        input: l2,
        factor: scale,
    })
}
