// Plain-text renderings of outcomes and summaries
use crate::types::{Classification, GroupStats, OverallSummary, RunOutcome, TaskSummary};
use std::fmt::Write as _;

fn percent(rate: Option<f64>) -> String {
    match rate {
        Some(rate) => format!("{:.2}%", rate * 100.0),
        None => "n/a".to_string(),
    }
}

fn heading(out: &mut String, title: &str, underline: char) {
    let _ = writeln!(out, "{}", title);
    let _ = writeln!(out, "{}", underline.to_string().repeat(title.chars().count()));
}

fn label(classification: Classification) -> &'static str {
    match classification {
        Classification::Pass => "Passed",
        Classification::Fail => "Failed",
        Classification::BuildError => "Build errors",
        Classification::Timeout => "Timed out",
        Classification::InfrastructureError => "Infrastructure errors",
    }
}

fn marker(classification: Classification) -> &'static str {
    match classification {
        Classification::Pass => "PASS",
        Classification::Fail => "FAIL",
        Classification::BuildError => "BUILD",
        Classification::Timeout => "TIME",
        Classification::InfrastructureError => "INFRA",
    }
}

fn groups_section(out: &mut String, groups: &[GroupStats]) {
    heading(out, "Group Comparison:", '-');
    if groups.is_empty() {
        let _ = writeln!(out, "No grouped variants");
    }
    for group in groups {
        let _ = writeln!(out);
        let _ = writeln!(out, "{}:", group.label);
        let _ = writeln!(out, "Total: {}", group.total);
        let _ = writeln!(out, "Passed: {}", group.passed);
        let _ = writeln!(out, "Pass Rate: {}", percent(Some(group.pass_rate)));
    }
    let _ = writeln!(out);
}

/// Per-variant report: verdict, timing and captured output
pub fn render_variant_report(outcome: &RunOutcome) -> String {
    let mut out = String::new();
    heading(&mut out, &format!("Test Results for {}", outcome.variant_id), '=');
    let _ = writeln!(out);
    let _ = writeln!(out, "Task: {}", outcome.task_id);
    let _ = writeln!(
        out,
        "Group: {}",
        outcome.group.as_deref().unwrap_or("(ungrouped)")
    );
    let _ = writeln!(out, "Timestamp: {}", outcome.timestamp.to_rfc3339());
    let _ = writeln!(out, "Classification: {}", outcome.classification);
    match outcome.exit_code {
        Some(code) => {
            let _ = writeln!(out, "Exit code: {}", code);
        }
        None => {
            let _ = writeln!(out, "Exit code: none");
        }
    }
    let _ = writeln!(out, "Elapsed: {} ms", outcome.elapsed_ms);
    if let Some(counts) = &outcome.test_counts {
        let _ = writeln!(
            out,
            "Tests: {} run, {} failed, {} errors, {} skipped",
            counts.tests, counts.failures, counts.errors, counts.skipped
        );
    }
    if let Some(detail) = &outcome.detail {
        let _ = writeln!(out, "Detail: {}", detail);
    }

    let _ = writeln!(out);
    heading(&mut out, "Standard Output:", '-');
    let _ = writeln!(out, "{}", outcome.stdout);
    heading(&mut out, "Standard Error:", '-');
    let _ = writeln!(out, "{}", outcome.stderr);
    out
}

pub fn render_task_summary(summary: &TaskSummary) -> String {
    let mut out = String::new();
    heading(&mut out, "Test Execution Summary", '=');
    let _ = writeln!(out);
    let _ = writeln!(out, "Task: {}", summary.task_id);
    let _ = writeln!(out, "Generated: {}", summary.generated_at.to_rfc3339());
    let _ = writeln!(out);

    heading(&mut out, "Overall Results:", '-');
    let _ = writeln!(out, "Total variants tested: {}", summary.total);
    for c in Classification::ALL {
        let _ = writeln!(out, "{}: {}", label(c), summary.counts.get(c));
    }
    let _ = writeln!(out, "Pass Rate: {}", percent(summary.pass_rate));
    let _ = writeln!(out);

    groups_section(&mut out, &summary.groups);

    heading(&mut out, "Detailed Results:", '-');
    for line in &summary.variants {
        let _ = writeln!(
            out,
            "[{}] {}: {} ({} ms)",
            marker(line.classification),
            line.variant_id,
            line.classification,
            line.elapsed_ms
        );
    }
    out
}

pub fn render_overall_summary(summary: &OverallSummary) -> String {
    let mut out = String::new();
    heading(&mut out, "Overall Test Execution Summary", '=');
    let _ = writeln!(out);
    let _ = writeln!(out, "Generated: {}", summary.generated_at.to_rfc3339());
    let _ = writeln!(out);

    heading(&mut out, "General Statistics:", '-');
    let _ = writeln!(out, "Total tasks processed: {}", summary.tasks);
    let _ = writeln!(out, "Total variants tested: {}", summary.variants);
    for c in Classification::ALL {
        let _ = writeln!(out, "{}: {}", label(c), summary.counts.get(c));
    }
    let _ = writeln!(out, "Overall pass rate: {}", percent(summary.pass_rate));
    let _ = writeln!(out);

    groups_section(&mut out, &summary.groups);

    if !summary.tasks_with_failures.is_empty() {
        heading(&mut out, "Tasks With Non-Passing Variants:", '-');
        for task_id in &summary.tasks_with_failures {
            let _ = writeln!(out, "- {}", task_id);
        }
        let _ = writeln!(out);
    }

    if !summary.resource_leaks.is_empty() {
        heading(&mut out, "Resource Leak Warnings:", '-');
        for leak in &summary.resource_leaks {
            let _ = writeln!(out, "- {}", leak);
        }
    }
    out
}
