/// Batch Scheduler - bounded, batched dispatch of (task, variant) units
///
/// **Dispatch Rules:**
/// - At most `concurrency` units run at once (semaphore permits)
/// - Units are taken in batches of `batch_size`; a batch starts only once
///   enough permits are free for it, but each unit reports the moment it ends
/// - Units never observe each other; a failing or panicking unit becomes an
///   infrastructure-error outcome and siblings carry on
///
/// **Collection:**
/// A single collector owns the outcome stream, persists reports, records into
/// the aggregator and emits a `TaskSummary` as soon as a task's last variant
/// reports. A duplicate result halts the batch.
///
/// **Shutdown:**
/// Once the shutdown signal flips, no new unit is dispatched. In-flight units
/// see the same signal, kill their tool and release their workspace before
/// reporting as interrupted.

use crate::aggregator::{AggregateError, ResultAggregator};
use crate::engine::shutdown_requested;
use crate::executor::UnitExecutor;
use crate::reporting::ReportWriter;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use trialbench_common::types::{RunOutcome, Task, TaskSummary, Variant};

/// One schedulable unit of work
pub trait UnitWork: Send + Sync + 'static {
    fn execute(
        &self,
        task: Arc<Task>,
        variant: Variant,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = RunOutcome> + Send;
}

impl UnitWork for UnitExecutor {
    fn execute(
        &self,
        task: Arc<Task>,
        variant: Variant,
        shutdown: watch::Receiver<bool>,
    ) -> impl Future<Output = RunOutcome> + Send {
        UnitExecutor::execute(self, task, variant, shutdown)
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("result collector failed: {0}")]
    Collector(#[from] tokio::task::JoinError),
}

/// Counters describing how a batch ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub units: usize,
    pub dispatched: usize,
    pub recorded: usize,
    pub tasks_completed: usize,
    pub interrupted: bool,
}

pub struct BatchScheduler<W: UnitWork> {
    worker: Arc<W>,
    aggregator: Arc<ResultAggregator>,
    reports: Option<Arc<ReportWriter>>,
    concurrency: usize,
    batch_size: usize,
}

impl<W: UnitWork> BatchScheduler<W> {
    pub fn new(worker: Arc<W>, concurrency: usize, batch_size: usize) -> Self {
        Self {
            worker,
            aggregator: Arc::new(ResultAggregator::new()),
            reports: None,
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Persist variant reports and task summaries as they arrive
    pub fn with_reports(mut self, writer: ReportWriter) -> Self {
        self.reports = Some(Arc::new(writer));
        self
    }

    /// Run every variant of every task. Summaries stream out of the receiver
    /// in completion order; the handle resolves once the batch is over.
    pub fn run_all(
        self,
        tasks: Vec<Task>,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<TaskSummary>, JoinHandle<Result<BatchStats, SchedulerError>>) {
        let (summary_tx, summary_rx) = mpsc::channel(tasks.len().max(1));
        let handle = tokio::spawn(self.drive(tasks, shutdown, summary_tx));
        (summary_rx, handle)
    }

    async fn drive(
        self,
        tasks: Vec<Task>,
        shutdown: watch::Receiver<bool>,
        summaries: mpsc::Sender<TaskSummary>,
    ) -> Result<BatchStats, SchedulerError> {
        let tasks: Vec<Arc<Task>> = tasks.into_iter().map(Arc::new).collect();
        for task in &tasks {
            self.aggregator.register(task);
        }

        let units: Vec<(Arc<Task>, Variant)> = tasks
            .iter()
            .flat_map(|task| task.variants.iter().map(move |v| (Arc::clone(task), v.clone())))
            .collect();
        let mut stats = BatchStats {
            units: units.len(),
            ..Default::default()
        };

        // Halts on operator shutdown or on a fatal collector error
        let (halt_tx, halt_rx) = watch::channel(*shutdown.borrow());
        let halt_tx = Arc::new(halt_tx);
        let forwarder = {
            let halt_tx = Arc::clone(&halt_tx);
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                shutdown_requested(&mut shutdown).await;
                halt_tx.send_replace(true);
            })
        };

        let (outcome_tx, outcome_rx) = mpsc::channel::<RunOutcome>(self.concurrency * 2);
        let collector = tokio::spawn(collect(
            outcome_rx,
            Arc::clone(&self.aggregator),
            tasks.iter().map(|t| (t.id.clone(), Arc::clone(t))).collect(),
            self.reports.clone(),
            summaries,
            Arc::clone(&halt_tx),
        ));

        info!(
            tasks = tasks.len(),
            units = units.len(),
            concurrency = self.concurrency,
            batch_size = self.batch_size,
            "Dispatching batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();
        let mut halt = halt_rx.clone();

        'dispatch: for (batch_no, batch) in units.chunks(self.batch_size).enumerate() {
            let needed = batch.len().min(self.concurrency) as u32;
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut halt) => break 'dispatch,
                gate = Arc::clone(&semaphore).acquire_many_owned(needed) => match gate {
                    Ok(gate) => drop(gate),
                    Err(_) => break 'dispatch,
                },
            }
            debug!(batch = batch_no, units = batch.len(), "Starting batch");

            for (task, variant) in batch {
                let permit = tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut halt) => break 'dispatch,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'dispatch,
                    },
                };

                let worker = Arc::clone(&self.worker);
                let task = Arc::clone(task);
                let variant = variant.clone();
                let unit_halt = halt_rx.clone();
                let tx = outcome_tx.clone();
                in_flight.spawn(async move {
                    let fallback = variant.clone();
                    let run = tokio::spawn(async move { worker.execute(task, variant, unit_halt).await });
                    let outcome = match run.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(
                                task_id = %fallback.task_id,
                                variant_id = %fallback.id,
                                error = %e,
                                "Worker crashed"
                            );
                            RunOutcome::infrastructure_error(&fallback, format!("worker crashed: {}", e))
                        }
                    };
                    let _ = tx.send(outcome).await;
                    drop(permit);
                });
                stats.dispatched += 1;
            }
        }
        drop(outcome_tx);

        if stats.dispatched < stats.units {
            warn!(
                skipped = stats.units - stats.dispatched,
                "Dispatch stopped early, remaining units were not run"
            );
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Unit supervisor failed");
            }
        }

        let collected = collector.await;
        forwarder.abort();
        stats.tasks_completed = collected??;
        stats.recorded = self.aggregator.recorded();
        stats.interrupted = *halt_rx.borrow();
        Ok(stats)
    }
}

/// Drain outcomes into the aggregator; returns the number of tasks completed
async fn collect(
    mut outcomes: mpsc::Receiver<RunOutcome>,
    aggregator: Arc<ResultAggregator>,
    tasks: HashMap<String, Arc<Task>>,
    reports: Option<Arc<ReportWriter>>,
    summaries: mpsc::Sender<TaskSummary>,
    halt: Arc<watch::Sender<bool>>,
) -> Result<usize, AggregateError> {
    let mut completed = 0;

    while let Some(outcome) = outcomes.recv().await {
        let task = tasks.get(&outcome.task_id);
        let task_id = outcome.task_id.clone();
        // Persist only what the aggregator accepts
        let accepted = reports.as_ref().zip(task).map(|(writer, task)| (writer, task, outcome.clone()));

        let done = match aggregator.record(outcome) {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "Fatal aggregation error, halting batch");
                halt.send_replace(true);
                return Err(e);
            }
        };
        if let Some((writer, task, outcome)) = accepted {
            if let Err(e) = writer.write_variant(&task.dir, &outcome) {
                warn!(task_id = %task_id, variant_id = %outcome.variant_id, error = %e, "Failed to write variant report");
            }
        }

        if done {
            let summary = aggregator.summarize(&task_id)?;
            completed += 1;
            if let (Some(writer), Some(task)) = (&reports, task) {
                if let Err(e) = writer.write_task_summary(&task.dir, &summary) {
                    warn!(task_id = %task_id, error = %e, "Failed to write task summary");
                }
            }
            info!(
                task_id = %task_id,
                total = summary.total,
                passed = summary.counts.pass,
                timeouts = summary.counts.timeout,
                infrastructure_errors = summary.counts.infrastructure_error,
                "Task complete"
            );
            if summaries.send(summary).await.is_err() {
                debug!(task_id = %task_id, "Summary receiver dropped");
            }
        }
    }
    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use trialbench_common::types::{Classification, VariantKind};

    /// Records peak parallelism; classification is chosen by variant id
    #[derive(Default)]
    struct FakeWork {
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
        delay_ms: u64,
    }

    impl UnitWork for FakeWork {
        fn execute(
            &self,
            _task: Arc<Task>,
            variant: Variant,
            mut shutdown: watch::Receiver<bool>,
        ) -> impl Future<Output = RunOutcome> + Send {
            async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                self.started.lock().unwrap().push(format!("{}/{}", variant.task_id, variant.id));

                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(self.delay_ms)) => false,
                    _ = shutdown_requested(&mut shutdown) => true,
                };
                self.active.fetch_sub(1, Ordering::SeqCst);

                if variant.id == "P" {
                    panic!("simulated worker crash");
                }
                if interrupted {
                    return RunOutcome::infrastructure_error(&variant, "interrupted");
                }
                let classification = match variant.id.as_str() {
                    "base" => Classification::Fail,
                    "F" => Classification::Timeout,
                    _ => Classification::Pass,
                };
                RunOutcome {
                    task_id: variant.task_id.clone(),
                    variant_id: variant.id.clone(),
                    group: variant.group.clone(),
                    classification,
                    exit_code: Some(0),
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed_ms: self.delay_ms,
                    timestamp: Utc::now(),
                    test_counts: None,
                    detail: None,
                }
            }
        }
    }

    fn task(id: &str, variants: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            dir: PathBuf::from(format!("/nonexistent/{}", id)),
            test_file: PathBuf::from("SolutionTest.java"),
            solution: PathBuf::from("Solution.java"),
            baseline: None,
            manifest: None,
            variants: variants
                .iter()
                .map(|v| Variant {
                    task_id: id.to_string(),
                    id: v.to_string(),
                    kind: VariantKind::Alternate,
                    group: None,
                    source: PathBuf::from(format!("{}.java", v)),
                })
                .collect(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<TaskSummary>) -> Vec<TaskSummary> {
        let mut out = Vec::new();
        while let Some(summary) = rx.recv().await {
            out.push(summary);
        }
        out
    }

    #[tokio::test]
    async fn test_every_task_reports_once() {
        let work = Arc::new(FakeWork { delay_ms: 5, ..Default::default() });
        let tasks = vec![
            task("000001", &["solution", "base", "A", "F"]),
            task("000002", &["solution", "A", "B"]),
        ];
        let (_tx, shutdown) = watch::channel(false);

        let (rx, handle) = BatchScheduler::new(Arc::clone(&work), 3, 2).run_all(tasks, shutdown);
        let summaries = drain(rx).await;
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.units, 7);
        assert_eq!(stats.dispatched, 7);
        assert_eq!(stats.recorded, 7);
        assert_eq!(stats.tasks_completed, 2);
        assert!(!stats.interrupted);

        let first = summaries.iter().find(|s| s.task_id == "000001").unwrap();
        assert_eq!(first.total, 4);
        assert_eq!(first.counts.pass, 2);
        assert_eq!(first.counts.fail, 1);
        assert_eq!(first.counts.timeout, 1);
        assert_eq!(summaries.iter().filter(|s| s.task_id == "000002").count(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let work = Arc::new(FakeWork { delay_ms: 20, ..Default::default() });
        let ids: Vec<String> = (0..12).map(|i| ((b'A' + i) as char).to_string()).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let (_tx, shutdown) = watch::channel(false);

        let (rx, handle) = BatchScheduler::new(Arc::clone(&work), 3, 5).run_all(vec![task("000001", &refs)], shutdown);
        drain(rx).await;
        handle.await.unwrap().unwrap();

        assert!(work.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(work.started.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_crashed_worker_is_contained() {
        let work = Arc::new(FakeWork { delay_ms: 1, ..Default::default() });
        let (_tx, shutdown) = watch::channel(false);

        let (rx, handle) =
            BatchScheduler::new(Arc::clone(&work), 2, 2).run_all(vec![task("000001", &["P", "A", "B"])], shutdown);
        let summaries = drain(rx).await;
        handle.await.unwrap().unwrap();

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].counts.pass, 2);
        assert_eq!(summaries[0].counts.infrastructure_error, 1);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_dispatches_nothing() {
        let work = Arc::new(FakeWork { delay_ms: 1, ..Default::default() });
        let (_tx, shutdown) = watch::channel(true);

        let (rx, handle) = BatchScheduler::new(Arc::clone(&work), 2, 2).run_all(vec![task("000001", &["A", "B"])], shutdown);
        let summaries = drain(rx).await;
        let stats = handle.await.unwrap().unwrap();

        assert!(summaries.is_empty());
        assert_eq!(stats.dispatched, 0);
        assert!(stats.interrupted);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_in_flight_units() {
        let work = Arc::new(FakeWork { delay_ms: 10_000, ..Default::default() });
        let (tx, shutdown) = watch::channel(false);

        let (rx, handle) =
            BatchScheduler::new(Arc::clone(&work), 2, 2).run_all(vec![task("000001", &["A", "B", "C", "D"])], shutdown);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let summaries = drain(rx).await;
        let stats = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap().unwrap();

        assert!(stats.interrupted);
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.recorded, 2);
        assert!(summaries.is_empty());
    }

    /// Passes on its first call and fails on every later one
    #[derive(Default)]
    struct FlipWork {
        calls: AtomicUsize,
    }

    impl UnitWork for FlipWork {
        fn execute(
            &self,
            _task: Arc<Task>,
            variant: Variant,
            _shutdown: watch::Receiver<bool>,
        ) -> impl Future<Output = RunOutcome> + Send {
            let first = self.calls.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                let mut outcome = RunOutcome::infrastructure_error(&variant, "unused");
                outcome.classification = if first { Classification::Pass } else { Classification::Fail };
                outcome.detail = None;
                outcome
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_duplicate_keeps_accepted_report() {
        let scratch = tempfile::tempdir().unwrap();
        let mut doubled = task("000001", &["A", "A"]);
        doubled.dir = scratch.path().join("000001");
        let (_tx, shutdown) = watch::channel(false);

        let (rx, handle) = BatchScheduler::new(Arc::new(FlipWork::default()), 1, 1)
            .with_reports(ReportWriter::new("test_results"))
            .run_all(vec![doubled], shutdown);
        drain(rx).await;
        let result = handle.await.unwrap();
        assert!(matches!(
            result,
            Err(SchedulerError::Aggregate(AggregateError::DuplicateResult { .. }))
        ));

        let report = std::fs::read_to_string(scratch.path().join("000001/test_results/A.txt")).unwrap();
        assert!(report.contains("Classification: pass"), "{}", report);
        assert!(!report.contains("Classification: fail"));
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_is_fatal() {
        let work = Arc::new(FakeWork { delay_ms: 1, ..Default::default() });
        let (_tx, shutdown) = watch::channel(false);

        let (rx, handle) = BatchScheduler::new(Arc::clone(&work), 1, 1).run_all(vec![task("000001", &["A", "A"])], shutdown);
        drain(rx).await;
        let result = handle.await.unwrap();

        assert!(matches!(
            result,
            Err(SchedulerError::Aggregate(AggregateError::DuplicateResult { .. }))
        ));
    }
}
