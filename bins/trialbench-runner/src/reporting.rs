// Persists outcomes and summaries into the input tree
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use trialbench_common::layout;
use trialbench_common::report;
use trialbench_common::types::{OverallSummary, RunOutcome, TaskSummary};

pub struct ReportWriter {
    results_dir_name: String,
}

impl ReportWriter {
    pub fn new(results_dir_name: impl Into<String>) -> Self {
        Self {
            results_dir_name: results_dir_name.into(),
        }
    }

    fn results_dir(&self, task_dir: &Path) -> Result<PathBuf> {
        let dir = layout::results_dir(task_dir, &self.results_dir_name);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Write `<variant>.txt` for one outcome
    pub fn write_variant(&self, task_dir: &Path, outcome: &RunOutcome) -> Result<PathBuf> {
        let path = layout::variant_report_path(&self.results_dir(task_dir)?, &outcome.variant_id);
        fs::write(&path, report::render_variant_report(outcome))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(task_id = %outcome.task_id, variant_id = %outcome.variant_id, path = %path.display(), "Variant report written");
        Ok(path)
    }

    /// Write the text and JSON summaries of a completed task
    pub fn write_task_summary(&self, task_dir: &Path, summary: &TaskSummary) -> Result<()> {
        let dir = self.results_dir(task_dir)?;

        let text = dir.join(layout::SUMMARY_TEXT);
        fs::write(&text, report::render_task_summary(summary))
            .with_context(|| format!("Failed to write {}", text.display()))?;

        let json = dir.join(layout::SUMMARY_JSON);
        let body = serde_json::to_string_pretty(summary).context("Failed to serialize task summary")?;
        fs::write(&json, body).with_context(|| format!("Failed to write {}", json.display()))?;
        Ok(())
    }

    /// Write `overall_summary.txt` at the tasks root
    pub fn write_overall(&self, root: &Path, summary: &OverallSummary) -> Result<PathBuf> {
        let path = root.join(layout::OVERALL_SUMMARY);
        fs::write(&path, report::render_overall_summary(summary))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
