/// Unit Executor - High-Level Orchestration of one (task, variant)
///
/// **Responsibility:**
/// Coordinate materializer, runner, evaluator and sweeper to produce exactly
/// one `RunOutcome` per unit of work.
///
/// **Architecture:**
/// 1. Materialize a private workspace (materializer.rs)
/// 2. Run the build tool inside it (engine.rs)
/// 3. Classify the raw output (evaluator.rs)
/// 4. Release the workspace (sweeper.rs)
///
/// This module is the glue layer. It never fails: every problem becomes a
/// classified outcome so sibling units are unaffected.

use crate::config::HarnessConfigManager;
use crate::engine::IsolatedRunner;
use crate::evaluator;
use crate::materializer::Materializer;
use crate::sweeper::Sweeper;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use trialbench_common::layout;
use trialbench_common::types::{Classification, RunOutcome, Task, Variant};

pub struct UnitExecutor {
    materializer: Arc<Materializer>,
    runner: IsolatedRunner,
    sweeper: Arc<Sweeper>,
    timeout: Duration,
}

impl UnitExecutor {
    pub fn new(config: &HarnessConfigManager, sweeper: Arc<Sweeper>) -> Self {
        Self {
            materializer: Arc::new(Materializer::new(config)),
            runner: IsolatedRunner::new(config),
            sweeper,
            timeout: config.timeout(),
        }
    }

    pub fn sweeper(&self) -> &Arc<Sweeper> {
        &self.sweeper
    }

    /// Execute one unit of work to completion.
    #[tracing::instrument(
        skip(self, task, variant, shutdown),
        fields(task_id = %variant.task_id, variant_id = %variant.id)
    )]
    pub async fn execute(
        &self,
        task: Arc<Task>,
        variant: Variant,
        mut shutdown: watch::Receiver<bool>,
    ) -> RunOutcome {
        if *shutdown.borrow() {
            return RunOutcome::infrastructure_error(&variant, "interrupted");
        }

        let token = layout::run_token();
        let materializer = Arc::clone(&self.materializer);
        let sweeper = Arc::clone(&self.sweeper);
        let unit = variant.clone();
        let materialized = tokio::task::spawn_blocking(move || {
            materializer.materialize(&task, &unit, &token, &sweeper)
        })
        .await;

        let guard = match materialized {
            Ok(Ok(guard)) => guard,
            Ok(Err(e)) => {
                warn!(error = %e, "Materialization failed");
                return RunOutcome::infrastructure_error(&variant, format!("materialization failed: {}", e));
            }
            Err(e) => {
                warn!(error = %e, "Materialization task aborted");
                return RunOutcome::infrastructure_error(&variant, format!("materialization aborted: {}", e));
            }
        };

        let output = self.runner.run(&guard, self.timeout, &mut shutdown).await;
        let outcome = evaluator::evaluate(&variant, output);

        // Deletion can be slow on large build trees
        if let Err(e) = tokio::task::spawn_blocking(move || guard.release()).await {
            warn!(error = %e, "Workspace release task failed");
        }

        match outcome.classification {
            Classification::Pass => info!(
                classification = %outcome.classification,
                elapsed_ms = outcome.elapsed_ms,
                "Variant passed"
            ),
            _ => info!(
                classification = %outcome.classification,
                elapsed_ms = outcome.elapsed_ms,
                exit_code = ?outcome.exit_code,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "Variant did not pass"
            ),
        }
        outcome
    }
}
