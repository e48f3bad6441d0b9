// CLI commands for managing a trialbench checkout
use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use trialbench_common::config::{HarnessConfig, DEFAULT_CONFIG_PATH};
use trialbench_common::layout;
use trialbench_common::report;
use trialbench_common::types::{OverallSummary, TaskSummary};

/// Load the harness configuration, falling back to defaults
fn load_config(path: &Path) -> Result<HarnessConfig> {
    let (config, loaded) = HarnessConfig::load_or_default(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    if !loaded {
        println!("ℹ️  {} not found, using defaults", path.display());
    }
    Ok(config)
}

/// Initialize a new trialbench project
pub async fn init_project(path: &Path, force: bool) -> Result<()> {
    println!("🚀 Initializing trialbench project at: {}", path.display());

    let config_path = path.join(DEFAULT_CONFIG_PATH);
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let default_config = HarnessConfig::default();
    let json_content = serde_json::to_string_pretty(&default_config)?;
    fs::write(&config_path, json_content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;
    println!("  ✅ Created: {}", config_path.display());

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Adjust tool, groups and timeout in {}", DEFAULT_CONFIG_PATH);
    println!("  2. Run the batch: trialbench-runner <tasks-root>");
    println!("  3. Rebuild the overall summary any time: trialbench-cli summarize --root <tasks-root>");

    Ok(())
}

/// Read every `<task>/<results>/summary.json` under `root`, in task order
pub fn load_task_summaries(root: &Path, results_dir_name: &str) -> Result<Vec<TaskSummary>> {
    let mut task_dirs: Vec<PathBuf> = fs::read_dir(root)
        .with_context(|| format!("Failed to read {}", root.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    task_dirs.sort();

    let mut summaries = Vec::new();
    for dir in task_dirs {
        let path = layout::results_dir(&dir, results_dir_name).join(layout::SUMMARY_JSON);
        if !path.is_file() {
            continue;
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let summary: TaskSummary = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Rebuild `overall_summary.txt` from the per-task summaries on disk
pub async fn summarize(root: &Path, config_path: &Path) -> Result<()> {
    println!("📊 Summarizing results under: {}", root.display());

    let config = load_config(config_path)?;
    let summaries = load_task_summaries(root, &config.layout.results_dir)?;
    if summaries.is_empty() {
        println!("⚠️  No task summaries found - has the runner been run?");
        return Ok(());
    }

    let overall = OverallSummary::build(&summaries, Vec::new());
    let output = root.join(layout::OVERALL_SUMMARY);
    fs::write(&output, report::render_overall_summary(&overall))
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("  Tasks: {}", overall.tasks);
    println!("  Variants: {}", overall.variants);
    println!("  Passed: {}", overall.counts.pass);
    println!(
        "  Timeouts / infrastructure errors: {} / {}",
        overall.counts.timeout, overall.counts.infrastructure_error
    );
    println!("✅ Wrote {}", output.display());
    Ok(())
}

/// Workspace directories and config roots a previous run failed to reclaim
pub fn stale_workspaces(work_root: &Path) -> Result<Vec<PathBuf>> {
    if !work_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut stale: Vec<PathBuf> = fs::read_dir(work_root)
        .with_context(|| format!("Failed to read {}", work_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(layout::is_workspace_entry)
                .unwrap_or(false)
        })
        .map(|entry| entry.path())
        .collect();
    stale.sort();
    Ok(stale)
}

/// Remove leftover workspaces under the work root
pub async fn clean(work_root: Option<&Path>, config_path: &Path, yes: bool) -> Result<()> {
    let work_root = match work_root {
        Some(path) => path.to_path_buf(),
        None => load_config(config_path)?.work_root,
    };
    println!("🧹 Scanning for stale workspaces in: {}", work_root.display());

    let stale = stale_workspaces(&work_root)?;
    if stale.is_empty() {
        println!("✅ Nothing to clean");
        return Ok(());
    }

    // Confirm deletion
    if !yes {
        print!("⚠️  This will remove {} directories:\n", stale.len());
        for path in &stale {
            print!("  - {}\n", path.display());
        }
        print!("\nContinue? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("❌ Aborted");
            return Ok(());
        }
    }

    let mut failed = 0;
    for path in &stale {
        match fs::remove_dir_all(path) {
            Ok(()) => println!("  🗑️  Removed {}", path.display()),
            Err(e) => {
                failed += 1;
                eprintln!("  ⚠️  Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} workspaces could not be removed", failed, stale.len());
    }
    println!("✅ Removed {} stale workspaces", stale.len());
    Ok(())
}
