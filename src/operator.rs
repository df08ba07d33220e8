//! Operator input.
//!
//! Some engine requests need a human decision. Handlers ask through [`OperatorPrompt`];
//! cancelling the prompt aborts the run with [`WorkflowError::OperatorAbort`].

use crate::error::{WorkflowError, WorkflowResult};
use crate::protocol::{ChooseLattice, SelectedLattice};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

/// Source of operator decisions.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Pick one of the offered lattice solutions.
    async fn choose_lattice(&self, request: &ChooseLattice) -> WorkflowResult<SelectedLattice>;
}

/// One scripted answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorChoice {
    /// Pick the solution at this index
    Solution(usize),
    /// Dismiss the dialog
    Cancel,
}

/// Operator that answers from a script, then keeps picking the first solution.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    choices: Mutex<VecDeque<OperatorChoice>>,
}

impl ScriptedOperator {
    /// Always picks the first solution.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator that answers prompts with `choices` in order.
    pub fn with_choices(choices: impl IntoIterator<Item = OperatorChoice>) -> Self {
        Self {
            choices: Mutex::new(choices.into_iter().collect()),
        }
    }

    fn next_choice(&self) -> OperatorChoice {
        self.choices
            .lock()
            .ok()
            .and_then(|mut choices| choices.pop_front())
            .unwrap_or(OperatorChoice::Solution(0))
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedOperator {
    async fn choose_lattice(&self, request: &ChooseLattice) -> WorkflowResult<SelectedLattice> {
        let index = match self.next_choice() {
            OperatorChoice::Solution(index) => index,
            OperatorChoice::Cancel => {
                return Err(WorkflowError::OperatorAbort(
                    "lattice selection cancelled".into(),
                ))
            }
        };
        let solution = request.solutions.get(index).ok_or_else(|| {
            WorkflowError::OperatorAbort(format!(
                "no lattice solution #{index} among {} offered",
                request.solutions.len()
            ))
        })?;
        info!(solution = %solution, "Operator selected lattice");
        Ok(SelectedLattice {
            lattice_format: request.lattice_format.clone(),
            solution: solution.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ChooseLattice {
        ChooseLattice {
            lattice_format: "IDXREF".into(),
            solutions: vec!["P 2 2 2".into(), "C 2".into()],
        }
    }

    #[tokio::test]
    async fn follows_the_script() {
        let operator = ScriptedOperator::with_choices([
            OperatorChoice::Solution(1),
            OperatorChoice::Cancel,
        ]);
        let selected = operator.choose_lattice(&request()).await.unwrap();
        assert_eq!(selected.solution, "C 2");
        assert_eq!(selected.lattice_format, "IDXREF");

        assert!(matches!(
            operator.choose_lattice(&request()).await,
            Err(WorkflowError::OperatorAbort(_))
        ));
        // script exhausted: first solution
        let selected = operator.choose_lattice(&request()).await.unwrap();
        assert_eq!(selected.solution, "P 2 2 2");
    }

    #[tokio::test]
    async fn empty_offer_is_an_abort() {
        let operator = ScriptedOperator::new();
        let request = ChooseLattice {
            lattice_format: "IDXREF".into(),
            solutions: Vec::new(),
        };
        assert!(operator.choose_lattice(&request).await.is_err());
    }
}
