use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const SOLUTION_ID: &str = "solution";
pub const BASE_ID: &str = "base";

/// Scored outcome of one variant run.
///
/// `Pass`, `Fail`, `BuildError` and `Timeout` are legitimate verdicts about the
/// code under test. `InfrastructureError` means the harness itself could not
/// produce a verdict and is always reported separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Pass,
    Fail,
    BuildError,
    Timeout,
    InfrastructureError,
}

impl Classification {
    pub const ALL: [Classification; 5] = [
        Classification::Pass,
        Classification::Fail,
        Classification::BuildError,
        Classification::Timeout,
        Classification::InfrastructureError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Pass => "pass",
            Classification::Fail => "fail",
            Classification::BuildError => "build-error",
            Classification::Timeout => "timeout",
            Classification::InfrastructureError => "infrastructure-error",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
    Solution,
    Base,
    Alternate,
}

/// One candidate implementation submitted against a task's tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub task_id: String,
    pub id: String,
    pub kind: VariantKind,
    /// None for the ground truth, the baseline and unmapped identifiers
    pub group: Option<String>,
    pub source: PathBuf,
}

/// One benchmark problem. Read-only after discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub dir: PathBuf,
    pub test_file: PathBuf,
    pub solution: PathBuf,
    pub baseline: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    /// Ordered: solution, base, then alternates by identifier
    pub variants: Vec<Variant>,
}

impl Task {
    pub fn variant_ids(&self) -> impl Iterator<Item = &str> {
        self.variants.iter().map(|v| v.id.as_str())
    }

    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }
}

/// Counts parsed from the build tool's machine-readable test report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub tests: u32,
    pub failures: u32,
    pub errors: u32,
    pub skipped: u32,
}

impl TestCounts {
    pub fn unsuccessful(&self) -> u32 {
        self.failures + self.errors
    }
}

/// Result of one isolated run. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub task_id: String,
    pub variant_id: String,
    pub group: Option<String>,
    pub classification: Classification,
    /// Absent on timeout and when the process never started
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub test_counts: Option<TestCounts>,
    pub detail: Option<String>,
}

impl RunOutcome {
    /// Outcome for a unit the harness could not score
    pub fn infrastructure_error(variant: &Variant, detail: impl Into<String>) -> Self {
        Self {
            task_id: variant.task_id.clone(),
            variant_id: variant.id.clone(),
            group: variant.group.clone(),
            classification: Classification::InfrastructureError,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            timestamp: Utc::now(),
            test_counts: None,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationCounts {
    pub pass: usize,
    pub fail: usize,
    pub build_error: usize,
    pub timeout: usize,
    pub infrastructure_error: usize,
}

impl ClassificationCounts {
    pub fn add(&mut self, classification: Classification) {
        *self.slot(classification) += 1;
    }

    pub fn get(&self, classification: Classification) -> usize {
        match classification {
            Classification::Pass => self.pass,
            Classification::Fail => self.fail,
            Classification::BuildError => self.build_error,
            Classification::Timeout => self.timeout,
            Classification::InfrastructureError => self.infrastructure_error,
        }
    }

    pub fn total(&self) -> usize {
        Classification::ALL.iter().map(|c| self.get(*c)).sum()
    }

    pub fn merge(&mut self, other: &ClassificationCounts) {
        for c in Classification::ALL {
            *self.slot(c) += other.get(c);
        }
    }

    fn slot(&mut self, classification: Classification) -> &mut usize {
        match classification {
            Classification::Pass => &mut self.pass,
            Classification::Fail => &mut self.fail,
            Classification::BuildError => &mut self.build_error,
            Classification::Timeout => &mut self.timeout,
            Classification::InfrastructureError => &mut self.infrastructure_error,
        }
    }
}

/// Pass rate as a fraction in [0, 1]; None when nothing was counted
pub fn pass_rate(passed: usize, total: usize) -> Option<f64> {
    if total == 0 {
        None
    } else {
        Some(passed as f64 / total as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStats {
    pub label: String,
    pub total: usize,
    pub passed: usize,
    pub pass_rate: f64,
}

fn group_stats(tally: BTreeMap<String, (usize, usize)>) -> Vec<GroupStats> {
    tally
        .into_iter()
        .filter_map(|(label, (total, passed))| {
            pass_rate(passed, total).map(|rate| GroupStats {
                label,
                total,
                passed,
                pass_rate: rate,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantLine {
    pub variant_id: String,
    pub group: Option<String>,
    pub classification: Classification,
    pub elapsed_ms: u64,
}

/// Aggregated view over every outcome of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub counts: ClassificationCounts,
    pub pass_rate: Option<f64>,
    /// Only groups with at least one variant, ordered by label
    pub groups: Vec<GroupStats>,
    /// Ordered by variant identifier
    pub variants: Vec<VariantLine>,
}

impl TaskSummary {
    /// Build a summary from a complete outcome map keyed by variant identifier.
    pub fn build(task_id: &str, outcomes: &BTreeMap<String, RunOutcome>) -> Self {
        let mut counts = ClassificationCounts::default();
        let mut tally: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        let mut variants = Vec::with_capacity(outcomes.len());

        for (variant_id, outcome) in outcomes {
            counts.add(outcome.classification);

            if let Some(label) = &outcome.group {
                let entry = tally.entry(label.clone()).or_default();
                entry.0 += 1;
                if outcome.classification == Classification::Pass {
                    entry.1 += 1;
                }
            }

            variants.push(VariantLine {
                variant_id: variant_id.clone(),
                group: outcome.group.clone(),
                classification: outcome.classification,
                elapsed_ms: outcome.elapsed_ms,
            });
        }

        let total = outcomes.len();
        TaskSummary {
            task_id: task_id.to_string(),
            generated_at: Utc::now(),
            total,
            counts,
            pass_rate: pass_rate(counts.pass, total),
            groups: group_stats(tally),
            variants,
        }
    }
}

/// Cross-task rollup written once the batch finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallSummary {
    pub generated_at: DateTime<Utc>,
    pub tasks: usize,
    pub variants: usize,
    pub counts: ClassificationCounts,
    pub pass_rate: Option<f64>,
    pub groups: Vec<GroupStats>,
    /// Tasks with at least one variant that did not pass
    pub tasks_with_failures: Vec<String>,
    pub resource_leaks: Vec<String>,
}

impl OverallSummary {
    pub fn build(summaries: &[TaskSummary], resource_leaks: Vec<String>) -> Self {
        let mut counts = ClassificationCounts::default();
        let mut tally: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        let mut tasks_with_failures = Vec::new();

        for summary in summaries {
            counts.merge(&summary.counts);
            for group in &summary.groups {
                let entry = tally.entry(group.label.clone()).or_default();
                entry.0 += group.total;
                entry.1 += group.passed;
            }
            if summary.counts.pass < summary.total {
                tasks_with_failures.push(summary.task_id.clone());
            }
        }
        tasks_with_failures.sort();

        let variants = counts.total();
        OverallSummary {
            generated_at: Utc::now(),
            tasks: summaries.len(),
            variants,
            counts,
            pass_rate: pass_rate(counts.pass, variants),
            groups: group_stats(tally),
            tasks_with_failures,
            resource_leaks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(variant_id: &str, group: Option<&str>, classification: Classification) -> RunOutcome {
        RunOutcome {
            task_id: "000001".to_string(),
            variant_id: variant_id.to_string(),
            group: group.map(str::to_string),
            classification,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 10,
            timestamp: Utc::now(),
            test_counts: None,
            detail: None,
        }
    }

    fn outcomes(entries: &[(&str, Option<&str>, Classification)]) -> BTreeMap<String, RunOutcome> {
        entries
            .iter()
            .map(|(id, group, c)| (id.to_string(), outcome(id, *group, *c)))
            .collect()
    }

    #[test]
    fn test_classification_serializes_kebab_case() {
        let json = serde_json::to_string(&Classification::InfrastructureError).unwrap();
        assert_eq!(json, "\"infrastructure-error\"");
        assert_eq!(Classification::BuildError.to_string(), "build-error");
    }

    #[test]
    fn test_summary_mixed_outcomes() {
        let map = outcomes(&[
            ("solution", None, Classification::Pass),
            ("base", None, Classification::Fail),
            ("A", Some("claude"), Classification::Pass),
            ("F", Some("llama"), Classification::Timeout),
        ]);

        let summary = TaskSummary::build("000001", &map);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.counts.pass, 2);
        assert_eq!(summary.counts.fail, 1);
        assert_eq!(summary.counts.timeout, 1);
        assert_eq!(summary.counts.build_error, 0);
        assert_eq!(summary.counts.total(), summary.total);
        assert_eq!(summary.pass_rate, Some(0.5));

        assert_eq!(summary.groups.len(), 2);
        assert_eq!(summary.groups[0].label, "claude");
        assert_eq!(summary.groups[0].pass_rate, 1.0);
        assert_eq!(summary.groups[1].label, "llama");
        assert_eq!(summary.groups[1].pass_rate, 0.0);

        let ids: Vec<&str> = summary.variants.iter().map(|v| v.variant_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "F", "base", "solution"]);
    }

    #[test]
    fn test_summary_omits_empty_groups() {
        let map = outcomes(&[("solution", None, Classification::Pass)]);
        let summary = TaskSummary::build("000002", &map);
        assert!(summary.groups.is_empty());
    }

    #[test]
    fn test_pass_rate_never_divides_by_zero() {
        assert_eq!(pass_rate(0, 0), None);
        assert_eq!(pass_rate(1, 4), Some(0.25));
    }

    #[test]
    fn test_overall_summary_rolls_up_groups() {
        let first = TaskSummary::build(
            "000001",
            &outcomes(&[
                ("A", Some("claude"), Classification::Pass),
                ("F", Some("llama"), Classification::Fail),
            ]),
        );
        let second = TaskSummary::build(
            "000002",
            &outcomes(&[
                ("A", Some("claude"), Classification::Pass),
                ("B", Some("claude"), Classification::InfrastructureError),
            ]),
        );

        let overall = OverallSummary::build(&[first, second], vec![]);

        assert_eq!(overall.tasks, 2);
        assert_eq!(overall.variants, 4);
        assert_eq!(overall.counts.pass, 2);
        assert_eq!(overall.counts.infrastructure_error, 1);
        assert_eq!(overall.groups[0].label, "claude");
        assert_eq!(overall.groups[0].total, 3);
        assert_eq!(overall.groups[0].passed, 2);
        assert_eq!(overall.tasks_with_failures, vec!["000001", "000002"]);
    }
}
