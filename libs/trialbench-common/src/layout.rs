// File-system naming shared by the runner and the CLI. Naming only, no I/O:
// every path derives from task id, variant id and run token.
use std::path::{Path, PathBuf};

pub const SUMMARY_TEXT: &str = "summary.txt";
pub const SUMMARY_JSON: &str = "summary.json";
pub const OVERALL_SUMMARY: &str = "overall_summary.txt";
pub const CONFIG_ROOT_SUFFIX: &str = ".home";

/// Token unique to this process and call, so that two runs of the same
/// (task, variant) never collide, even across concurrent harness processes
pub fn run_token() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", std::process::id(), &id[..8])
}

/// Directory name of one workspace
pub fn workspace_name(task_id: &str, variant_id: &str, token: &str) -> String {
    format!("{}_{}_{}", task_id, variant_id, token)
}

/// Private tool configuration root that sits beside its workspace
pub fn config_root_name(workspace_name: &str) -> String {
    format!("{}{}", workspace_name, CONFIG_ROOT_SUFFIX)
}

/// Whether a directory entry under the work root was created by `workspace_name`
pub fn is_workspace_entry(name: &str) -> bool {
    let name = name.strip_suffix(CONFIG_ROOT_SUFFIX).unwrap_or(name);
    let Some((prefix, token)) = name.rsplit_once('_') else {
        return false;
    };
    if !prefix.contains('_') {
        return false;
    }
    let Some((pid, hex)) = token.split_once('-') else {
        return false;
    };
    !pid.is_empty()
        && pid.chars().all(|c| c.is_ascii_digit())
        && hex.len() == 8
        && hex.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn results_dir(task_dir: &Path, results_dir_name: &str) -> PathBuf {
    task_dir.join(results_dir_name)
}

pub fn variant_report_path(results_dir: &Path, variant_id: &str) -> PathBuf {
    results_dir.join(format!("{}.txt", variant_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_naming() {
        assert_eq!(workspace_name("000001", "A", "42-deadbeef"), "000001_A_42-deadbeef");
        assert_eq!(config_root_name("000001_A_42-deadbeef"), "000001_A_42-deadbeef.home");
    }

    #[test]
    fn test_run_tokens_are_unique() {
        let first = run_token();
        let second = run_token();
        assert_ne!(first, second);
        assert!(first.starts_with(&format!("{}-", std::process::id())));
    }

    #[test]
    fn test_workspace_entry_detection() {
        let name = workspace_name("000001", "solution", &run_token());
        assert!(is_workspace_entry(&name));
        assert!(is_workspace_entry(&config_root_name(&name)));
        assert!(!is_workspace_entry("000001"));
        assert!(!is_workspace_entry("notes_draft"));
        assert!(!is_workspace_entry("000001_A_x-deadbeef"));
    }

    #[test]
    fn test_report_paths() {
        let dir = results_dir(Path::new("/tasks/000001"), "test_results");
        assert_eq!(dir, PathBuf::from("/tasks/000001/test_results"));
        assert_eq!(
            variant_report_path(&dir, "base"),
            PathBuf::from("/tasks/000001/test_results/base.txt")
        );
    }
}
