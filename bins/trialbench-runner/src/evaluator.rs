/// Outcome Evaluator - Tool-Agnostic Classification
///
/// **Core Responsibility:**
/// Turn the raw result of one build-tool invocation into a classified
/// `RunOutcome`.
///
/// **Critical Properties:**
/// - Knows nothing about processes or workspaces
/// - Pass/fail comes from the machine-readable JUnit XML report, never from
///   console text
/// - Pure function: (raw execution output) → classification
///
/// **Classification Rules (first match wins):**
/// - Launch failure → infrastructure-error
/// - Deadline elapsed → timeout, whatever the child printed
/// - Operator interrupt → infrastructure-error
/// - Report with failures or errors → fail
/// - Report, no failures, tests ran, exit 0 → pass
/// - Report, no failures, but non-zero exit or zero tests → fail
/// - No report, non-zero exit → build-error
/// - No report, exit 0, or killed by a signal → infrastructure-error

use chrono::{DateTime, Utc};
use regex::Regex;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;
use trialbench_common::types::{Classification, RunOutcome, TestCounts, Variant};

/// Raw result of one isolated run
/// Produced by the IsolatedRunner, consumed by the evaluator
#[derive(Debug, Clone)]
pub struct ToolExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub timed_out: bool,
    pub interrupted: bool,
    pub launch_error: Option<String>,
    /// Parsed test report, None when the tool wrote none
    pub report: Option<TestCounts>,
    /// How the process ended when it did not exit normally
    pub termination: Option<String>,
}

impl ToolExecutionOutput {
    pub fn launch_failure(error: impl Into<String>, started_at: DateTime<Utc>, elapsed_ms: u64) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            elapsed_ms,
            started_at,
            timed_out: false,
            interrupted: false,
            launch_error: Some(error.into()),
            report: None,
            termination: None,
        }
    }
}

fn testsuite_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<testsuite\b([^>]*)>").expect("testsuite regex is valid"))
}

fn attribute_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b(tests|failures|errors|skipped)\s*=\s*["'](\d+)["']"#)
            .expect("attribute regex is valid")
    })
}

/// Sum the counters of every `<testsuite>` element in a JUnit XML document.
/// Returns None if the document contains no test suite.
pub fn parse_junit_report(xml: &str) -> Option<TestCounts> {
    let mut counts = TestCounts::default();
    let mut found = false;

    for suite in testsuite_regex().captures_iter(xml) {
        found = true;
        let attrs = suite.get(1).map(|m| m.as_str()).unwrap_or_default();
        for attr in attribute_regex().captures_iter(attrs) {
            let value: u32 = attr[2].parse().unwrap_or(0);
            match &attr[1] {
                "tests" => counts.tests += value,
                "failures" => counts.failures += value,
                "errors" => counts.errors += value,
                "skipped" => counts.skipped += value,
                _ => {}
            }
        }
    }

    found.then_some(counts)
}

/// Merge every `TEST-*.xml` report in `dir`. Ok(None) if there are none.
pub fn read_report_dir(dir: &Path) -> io::Result<Option<TestCounts>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            name.starts_with("TEST-") && name.ends_with(".xml")
        })
        .collect();
    files.sort();

    let mut total: Option<TestCounts> = None;
    for file in files {
        let xml = fs::read_to_string(&file)?;
        match parse_junit_report(&xml) {
            Some(counts) => {
                let acc = total.get_or_insert_with(TestCounts::default);
                acc.tests += counts.tests;
                acc.failures += counts.failures;
                acc.errors += counts.errors;
                acc.skipped += counts.skipped;
            }
            None => warn!(file = %file.display(), "Test report has no <testsuite> element"),
        }
    }
    Ok(total)
}

/// Determine the classification and an optional explanation
pub fn classify(output: &ToolExecutionOutput) -> (Classification, Option<String>) {
    if let Some(error) = &output.launch_error {
        return (
            Classification::InfrastructureError,
            Some(format!("failed to launch build tool: {}", error)),
        );
    }
    if output.timed_out {
        return (
            Classification::Timeout,
            Some(format!("killed after {} ms", output.elapsed_ms)),
        );
    }
    if output.interrupted {
        return (Classification::InfrastructureError, Some("interrupted".to_string()));
    }

    match (&output.report, output.exit_code) {
        (Some(counts), _) if counts.unsuccessful() > 0 => (
            Classification::Fail,
            Some(format!(
                "{} of {} tests failed ({} failures, {} errors)",
                counts.unsuccessful(),
                counts.tests,
                counts.failures,
                counts.errors
            )),
        ),
        (Some(counts), Some(0)) if counts.tests > 0 => (Classification::Pass, None),
        (Some(counts), Some(0)) => {
            debug_assert_eq!(counts.tests, 0);
            (Classification::Fail, Some("no tests were executed".to_string()))
        }
        (Some(_), code) => (
            Classification::Fail,
            Some(match code {
                Some(code) => format!("tests passed but the build exited with code {}", code),
                None => "tests passed but the build did not exit normally".to_string(),
            }),
        ),
        (None, Some(0)) => (
            Classification::InfrastructureError,
            Some("build tool exited successfully but produced no test report".to_string()),
        ),
        (None, Some(code)) => (
            Classification::BuildError,
            Some(format!("build failed with exit code {} before tests ran", code)),
        ),
        (None, None) => (
            Classification::InfrastructureError,
            Some(
                output
                    .termination
                    .clone()
                    .unwrap_or_else(|| "build tool terminated abnormally".to_string()),
            ),
        ),
    }
}

/// Evaluate a raw execution output into the immutable outcome record
pub fn evaluate(variant: &Variant, output: ToolExecutionOutput) -> RunOutcome {
    let (classification, detail) = classify(&output);
    RunOutcome {
        task_id: variant.task_id.clone(),
        variant_id: variant.id.clone(),
        group: variant.group.clone(),
        classification,
        exit_code: if output.timed_out { None } else { output.exit_code },
        stdout: output.stdout,
        stderr: output.stderr,
        elapsed_ms: output.elapsed_ms,
        timestamp: output.started_at,
        test_counts: output.report,
        detail,
    }
}
