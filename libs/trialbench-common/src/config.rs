// Harness configuration schema shared by the runner and the CLI
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/harness.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the catalog finds each input inside a task directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLayout {
    /// Regex a directory name must match to be treated as a task
    pub task_pattern: String,
    pub test_file: PathBuf,
    pub solution_file: PathBuf,
    pub baseline_file: PathBuf,
    pub manifest_file: PathBuf,
    pub alternates_dir: PathBuf,
    pub source_extension: String,
    pub results_dir: String,
}

impl Default for TaskLayout {
    fn default() -> Self {
        Self {
            task_pattern: r"^\d{6}$".to_string(),
            test_file: PathBuf::from("src/test/java/SolutionTest.java"),
            solution_file: PathBuf::from("src/main/java/Solution.java"),
            baseline_file: PathBuf::from("base_code.java"),
            manifest_file: PathBuf::from("installed_packages.txt"),
            alternates_dir: PathBuf::from("alternate_responses"),
            source_extension: "java".to_string(),
            results_dir: "test_results".to_string(),
        }
    }
}

/// Shape of the throwaway project generated for each run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectTemplate {
    pub descriptor_name: String,
    /// `{dependencies}` is replaced by the rendered dependency block
    pub descriptor_template: String,
    pub source_dir: PathBuf,
    pub test_dir: PathBuf,
    /// Candidate names the test file may import, first match wins
    pub target_type_names: Vec<String>,
    pub default_dependencies: Vec<String>,
    /// Coordinates never copied from a task manifest
    pub excluded_dependencies: Vec<String>,
}

const DEFAULT_DESCRIPTOR_TEMPLATE: &str = r#"plugins {
    id 'java'
}

repositories {
    mavenLocal()
    mavenCentral()
}

{dependencies}

test {
    useJUnitPlatform()
    testLogging {
        events 'passed', 'skipped', 'failed'
        exceptionFormat 'full'
        showExceptions true
        showCauses true
    }
}
"#;

impl Default for ProjectTemplate {
    fn default() -> Self {
        Self {
            descriptor_name: "build.gradle".to_string(),
            descriptor_template: DEFAULT_DESCRIPTOR_TEMPLATE.to_string(),
            source_dir: PathBuf::from("src/main/java"),
            test_dir: PathBuf::from("src/test/java"),
            target_type_names: vec!["Solution".to_string(), "Main".to_string()],
            default_dependencies: vec![
                "testImplementation 'org.junit.jupiter:junit-jupiter-engine:5.9.2'".to_string(),
                "testImplementation 'org.junit.jupiter:junit-jupiter-api:5.9.2'".to_string(),
            ],
            excluded_dependencies: vec!["org.nd4j:nd4j-native-platform:1.0.0-M2.1".to_string()],
        }
    }
}

/// How the external build/test tool is invoked.
///
/// `args` and `env` values may contain `{project}`, `{config_root}` and
/// `{report_dir}`, substituted per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Directory of JUnit XML reports, relative to the project root
    pub report_dir: PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("GRADLE_USER_HOME".to_string(), "{config_root}".to_string());
        Self {
            program: "gradle".to_string(),
            args: vec![
                "test".to_string(),
                "--no-daemon".to_string(),
                "--project-dir".to_string(),
                "{project}".to_string(),
                "--gradle-user-home".to_string(),
                "{config_root}".to_string(),
                "--project-cache-dir".to_string(),
                "{config_root}/project-cache".to_string(),
            ],
            env,
            report_dir: PathBuf::from("build/test-results/test"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub batch_size: usize,
    pub output_limit_bytes: usize,
    pub kill_grace_ms: u64,
    pub work_root: PathBuf,
    pub layout: TaskLayout,
    pub project: ProjectTemplate,
    pub tool: ToolConfig,
    /// Group label -> variant identifiers belonging to it
    pub groups: BTreeMap<String, Vec<String>>,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

fn letters(range: std::ops::RangeInclusive<char>) -> Vec<String> {
    range.map(|c| c.to_string()).collect()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert("claude".to_string(), letters('A'..='E'));
        groups.insert("llama".to_string(), letters('F'..='J'));

        Self {
            timeout_secs: 60,
            concurrency: default_concurrency(),
            batch_size: 5,
            output_limit_bytes: 64 * 1024,
            kill_grace_ms: 2000,
            work_root: std::env::temp_dir().join("trialbench-work"),
            layout: TaskLayout::default(),
            project: ProjectTemplate::default(),
            tool: ToolConfig::default(),
            groups,
        }
    }
}

impl HarnessConfig {
    /// Load from a JSON file. Missing fields fall back to their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HarnessConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise return the defaults.
    /// The flag reports whether a file was actually read.
    pub fn load_or_default(path: &Path) -> Result<(Self, bool), ConfigError> {
        if path.exists() {
            Ok((Self::load(path)?, true))
        } else {
            Ok((Self::default(), false))
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeout_secs must be positive".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".into()));
        }
        if self.project.target_type_names.is_empty() {
            return Err(ConfigError::Invalid(
                "project.target_type_names must not be empty".into(),
            ));
        }
        if self.tool.program.trim().is_empty() {
            return Err(ConfigError::Invalid("tool.program must not be empty".into()));
        }

        let mut seen = BTreeMap::new();
        for (label, ids) in &self.groups {
            for id in ids {
                if let Some(previous) = seen.insert(id.as_str(), label.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "variant '{}' is mapped to both '{}' and '{}'",
                        id, previous, label
                    )));
                }
            }
        }
        Ok(())
    }

    /// Identifier -> group label lookup table
    pub fn group_index(&self) -> BTreeMap<String, String> {
        self.groups
            .iter()
            .flat_map(|(label, ids)| ids.iter().map(move |id| (id.clone(), label.clone())))
            .collect()
    }
}
