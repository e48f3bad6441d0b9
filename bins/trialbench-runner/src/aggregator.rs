/// Result Aggregator - the only shared mutable state of a batch
///
/// Owns, per task, the map from variant identifier to its outcome. Safe under
/// concurrent recording; the duplicate check and the completion transition
/// happen under the same lock, so two racing completions for one key cannot
/// both succeed and exactly one caller observes a task becoming complete.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::debug;
use trialbench_common::types::{RunOutcome, Task, TaskSummary};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("duplicate result for task {task_id} variant {variant_id}: unit dispatched twice")]
    DuplicateResult { task_id: String, variant_id: String },
    #[error("task {0} is not registered")]
    UnknownTask(String),
    #[error("task {task_id} has no variant {variant_id}")]
    UnknownVariant { task_id: String, variant_id: String },
    #[error("task {task_id} is incomplete: {recorded} of {expected} outcomes recorded")]
    Incomplete {
        task_id: String,
        recorded: usize,
        expected: usize,
    },
}

#[derive(Debug)]
struct Ledger {
    expected: Vec<String>,
    outcomes: BTreeMap<String, RunOutcome>,
}

impl Ledger {
    fn is_complete(&self) -> bool {
        self.outcomes.len() == self.expected.len()
    }
}

#[derive(Debug, Default)]
pub struct ResultAggregator {
    ledgers: Mutex<HashMap<String, Ledger>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledgers(&self) -> MutexGuard<'_, HashMap<String, Ledger>> {
        // Ledger updates are single inserts; a panicking holder cannot leave one half-written
        self.ledgers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare the variants a task must report before it can be summarized
    pub fn register(&self, task: &Task) {
        self.ledgers().insert(
            task.id.clone(),
            Ledger {
                expected: task.variant_ids().map(str::to_string).collect(),
                outcomes: BTreeMap::new(),
            },
        );
    }

    /// Record one outcome. Returns true when this outcome completed its task.
    pub fn record(&self, outcome: RunOutcome) -> Result<bool, AggregateError> {
        let mut ledgers = self.ledgers();
        let ledger = ledgers
            .get_mut(&outcome.task_id)
            .ok_or_else(|| AggregateError::UnknownTask(outcome.task_id.clone()))?;

        if !ledger.expected.iter().any(|id| *id == outcome.variant_id) {
            return Err(AggregateError::UnknownVariant {
                task_id: outcome.task_id,
                variant_id: outcome.variant_id,
            });
        }
        if ledger.outcomes.contains_key(&outcome.variant_id) {
            return Err(AggregateError::DuplicateResult {
                task_id: outcome.task_id,
                variant_id: outcome.variant_id,
            });
        }

        debug!(
            task_id = %outcome.task_id,
            variant_id = %outcome.variant_id,
            classification = %outcome.classification,
            "Outcome recorded"
        );
        ledger.outcomes.insert(outcome.variant_id.clone(), outcome);
        Ok(ledger.is_complete())
    }

    /// Summary of a task; defined only once every expected variant reported
    pub fn summarize(&self, task_id: &str) -> Result<TaskSummary, AggregateError> {
        let ledgers = self.ledgers();
        let ledger = ledgers
            .get(task_id)
            .ok_or_else(|| AggregateError::UnknownTask(task_id.to_string()))?;

        if !ledger.is_complete() {
            return Err(AggregateError::Incomplete {
                task_id: task_id.to_string(),
                recorded: ledger.outcomes.len(),
                expected: ledger.expected.len(),
            });
        }
        Ok(TaskSummary::build(task_id, &ledger.outcomes))
    }

    /// Number of outcomes recorded so far across all tasks
    pub fn recorded(&self) -> usize {
        self.ledgers().values().map(|l| l.outcomes.len()).sum()
    }
}
