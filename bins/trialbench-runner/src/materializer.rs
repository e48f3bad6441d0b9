/// Workspace Materializer - Disposable Build Directories
///
/// **Core Responsibility:**
/// Turn one (task, variant) pair into a self-contained project the build tool
/// can run: test file, unit under test, project descriptor and a private
/// configuration root nobody else touches.
///
/// **Isolation Rules:**
/// - Paths derive from task id + variant id + a per-call token
/// - Nothing is shared with other calls; every call creates its own dirs
/// - The returned guard reclaims everything it created, including on failure
///   halfway through materialization

use crate::config::HarnessConfigManager;
use crate::sweeper::{Sweeper, WorkspaceGuard};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};
use trialbench_common::config::ProjectTemplate;
use trialbench_common::layout;
use trialbench_common::types::{Task, Variant};

#[derive(Debug, Error)]
pub enum MaterializationError {
    #[error("{path}: found {} top-level public types ({}), expected exactly one", .names.len(), .names.join(", "))]
    MultipleDeclarations { path: PathBuf, names: Vec<String> },
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> MaterializationError {
    let path = path.to_path_buf();
    move |source| MaterializationError::Io { action, path, source }
}

/// Paths of one exclusively-owned execution environment
#[derive(Debug, Clone)]
pub struct Workspace {
    pub task_id: String,
    pub variant_id: String,
    /// Project root and working directory of the build tool
    pub root: PathBuf,
    /// Private configuration/cache root handed to the build tool
    pub config_root: PathBuf,
    /// Where the tool writes its machine-readable test report
    pub report_dir: PathBuf,
}

/// Gradle configurations a manifest line may already start with
const DEPENDENCY_CONFIGURATIONS: &[&str] = &[
    "implementation",
    "testImplementation",
    "api",
    "testApi",
    "compileOnly",
    "testCompileOnly",
    "runtimeOnly",
    "testRuntimeOnly",
    "compile",
    "testCompile",
    "runtime",
    "testRuntime",
    "annotationProcessor",
    "testAnnotationProcessor",
];

fn declaration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\bpublic\s+(?:(?:abstract|final|static|sealed|non-sealed|strictfp)\s+)*(?:class|interface|enum|record|@interface)\s+([A-Za-z_$][A-Za-z0-9_$]*)",
        )
        .expect("declaration regex is valid")
    })
}

fn coordinate_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.\-]+:[A-Za-z0-9_.\-]+:[A-Za-z0-9_.\-+]+$")
            .expect("coordinate regex is valid")
    })
}

/// Blank out comments, literals and everything nested inside braces, so
/// only top-level code survives. Byte offsets are preserved.
fn top_level_code(source: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        LineComment,
        BlockComment,
        Str,
        TextBlock,
        Char,
    }

    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut depth: usize = 0;
    let mut chars = source.char_indices();

    let blank = |out: &mut String, c: char| {
        if c == '\n' {
            out.push('\n');
        } else {
            out.extend(std::iter::repeat(' ').take(c.len_utf8()));
        }
    };

    while let Some((i, c)) = chars.next() {
        let rest = &source[i + c.len_utf8()..];
        match state {
            State::Code => {
                if c == '/' && rest.starts_with('/') {
                    state = State::LineComment;
                    blank(&mut out, c);
                } else if c == '/' && rest.starts_with('*') {
                    state = State::BlockComment;
                    blank(&mut out, c);
                    blank(&mut out, '*');
                    chars.next();
                } else if c == '"' && rest.starts_with("\"\"") {
                    state = State::TextBlock;
                    out.push_str("   ");
                    chars.next();
                    chars.next();
                } else if c == '"' {
                    state = State::Str;
                    blank(&mut out, c);
                } else if c == '\'' {
                    state = State::Char;
                    blank(&mut out, c);
                } else if c == '{' {
                    depth += 1;
                    blank(&mut out, c);
                } else if c == '}' {
                    depth = depth.saturating_sub(1);
                    blank(&mut out, c);
                } else if depth == 0 {
                    out.push(c);
                } else {
                    blank(&mut out, c);
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                }
                blank(&mut out, c);
            }
            State::BlockComment => {
                blank(&mut out, c);
                if c == '*' && rest.starts_with('/') {
                    blank(&mut out, '/');
                    chars.next();
                    state = State::Code;
                }
            }
            State::Str | State::Char => {
                blank(&mut out, c);
                if c == '\\' {
                    if let Some((_, escaped)) = chars.next() {
                        blank(&mut out, escaped);
                    }
                } else if (state == State::Str && c == '"') || (state == State::Char && c == '\'') {
                    state = State::Code;
                }
            }
            State::TextBlock => {
                if c == '"' && rest.starts_with("\"\"") {
                    out.push_str("   ");
                    chars.next();
                    chars.next();
                    state = State::Code;
                } else {
                    blank(&mut out, c);
                }
            }
        }
    }
    out
}

/// Names of the public types declared at the top level of a source file
pub fn top_level_public_types(source: &str) -> Vec<String> {
    declaration_regex()
        .captures_iter(&top_level_code(source))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Rename the single top-level public type of `source` to `target`.
///
/// Zero declarations leaves the source untouched; more than one is ambiguous
/// and rejected.
pub fn rename_public_type(source: &str, target: &str, path: &Path) -> Result<String, MaterializationError> {
    let names = top_level_public_types(source);
    match names.as_slice() {
        [] => {
            warn!(file = %path.display(), "No top-level public type found, installing source unchanged");
            Ok(source.to_string())
        }
        [name] if name == target => Ok(source.to_string()),
        [name] => {
            let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(name)))
                .expect("escaped identifier is a valid regex");
            debug!(file = %path.display(), from = %name, to = %target, "Renaming public type");
            Ok(pattern.replace_all(source, target).into_owned())
        }
        _ => Err(MaterializationError::MultipleDeclarations {
            path: path.to_path_buf(),
            names,
        }),
    }
}

/// Pick the type name the test file expects to import
pub fn detect_target_type<'a>(test_source: &str, candidates: &'a [String]) -> &'a str {
    candidates
        .iter()
        .find(|name| {
            Regex::new(&format!(r"\b{}\b", regex::escape(name)))
                .map(|re| re.is_match(test_source))
                .unwrap_or(false)
        })
        .or_else(|| candidates.first())
        .map(String::as_str)
        .unwrap_or("Main")
}

/// Dependency lines contributed by a task manifest, in order, deduplicated
pub fn manifest_dependencies(content: &str, excluded: &[String]) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty()
            || line.starts_with("//")
            || line.starts_with('#')
            || line == "}"
            || line.starts_with("dependencies")
        {
            continue;
        }

        let keyword = line
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default();

        let dep = if DEPENDENCY_CONFIGURATIONS.contains(&keyword) {
            line.to_string()
        } else if coordinate_regex().is_match(line) {
            format!("implementation '{}'", line)
        } else {
            warn!(line = %line, "Unrecognised manifest line, ignoring");
            continue;
        };

        let lower = dep.to_lowercase();
        if (lower.contains("junit") || lower.contains("jupiter")) && !lower.contains("mockito") {
            continue;
        }
        if excluded.iter().any(|coordinate| dep.contains(coordinate.as_str())) {
            continue;
        }
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }
    deps
}

/// Render the project descriptor from the template and dependency lines
pub fn render_descriptor(template: &str, dependencies: &[String]) -> String {
    let block = if dependencies.is_empty() {
        "dependencies {\n}".to_string()
    } else {
        format!("dependencies {{\n    {}\n}}", dependencies.join("\n    "))
    };
    template.replace("{dependencies}", &block)
}

pub struct Materializer {
    project: ProjectTemplate,
    source_extension: String,
    report_dir: PathBuf,
    work_root: PathBuf,
}

impl Materializer {
    pub fn new(config: &HarnessConfigManager) -> Self {
        let config = config.config();
        Self {
            project: config.project.clone(),
            source_extension: config.layout.source_extension.clone(),
            report_dir: config.tool.report_dir.clone(),
            work_root: config.work_root.clone(),
        }
    }

    /// Derive the workspace paths for one execution without touching disk
    pub fn plan(&self, task: &Task, variant: &Variant, token: &str) -> Workspace {
        let name = layout::workspace_name(&task.id, &variant.id, token);
        let root = self.work_root.join(&name);
        Workspace {
            task_id: task.id.clone(),
            variant_id: variant.id.clone(),
            report_dir: root.join(&self.report_dir),
            config_root: self.work_root.join(layout::config_root_name(&name)),
            root,
        }
    }

    /// Build the workspace on disk. The guard is armed before the first
    /// directory is created, so a failure at any step still reclaims it.
    pub fn materialize(
        &self,
        task: &Task,
        variant: &Variant,
        token: &str,
        sweeper: &Arc<Sweeper>,
    ) -> Result<WorkspaceGuard, MaterializationError> {
        let guard = sweeper.track(self.plan(task, variant, token));
        self.populate(&guard, task, variant)?;
        Ok(guard)
    }

    fn populate(&self, workspace: &Workspace, task: &Task, variant: &Variant) -> Result<(), MaterializationError> {
        let source_dir = workspace.root.join(&self.project.source_dir);
        let test_dir = workspace.root.join(&self.project.test_dir);
        for dir in [&source_dir, &test_dir, &workspace.config_root] {
            fs::create_dir_all(dir).map_err(io_error("create", dir))?;
        }

        let test_source = fs::read_to_string(&task.test_file).map_err(io_error("read", &task.test_file))?;
        let target = detect_target_type(&test_source, &self.project.target_type_names);

        let test_name = match top_level_public_types(&test_source).as_slice() {
            [name] => format!("{}.{}", name, self.source_extension),
            _ => task
                .test_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{}Test.{}", target, self.source_extension)),
        };
        let test_dest = test_dir.join(test_name);
        fs::write(&test_dest, &test_source).map_err(io_error("write", &test_dest))?;

        let variant_source = fs::read_to_string(&variant.source).map_err(io_error("read", &variant.source))?;
        let renamed = rename_public_type(&variant_source, target, &variant.source)?;
        let unit_dest = source_dir.join(format!("{}.{}", target, self.source_extension));
        fs::write(&unit_dest, renamed).map_err(io_error("write", &unit_dest))?;

        let mut dependencies = self.project.default_dependencies.clone();
        if let Some(manifest) = &task.manifest {
            let content = fs::read_to_string(manifest).map_err(io_error("read", manifest))?;
            for dep in manifest_dependencies(&content, &self.project.excluded_dependencies) {
                if !dependencies.contains(&dep) {
                    dependencies.push(dep);
                }
            }
        }
        let descriptor = workspace.root.join(&self.project.descriptor_name);
        fs::write(&descriptor, render_descriptor(&self.project.descriptor_template, &dependencies))
            .map_err(io_error("write", &descriptor))?;

        debug!(
            task_id = %workspace.task_id,
            variant_id = %workspace.variant_id,
            workspace = %workspace.root.display(),
            target_type = %target,
            dependencies = dependencies.len(),
            "Workspace materialized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use trialbench_common::config::HarnessConfig;
    use trialbench_common::types::VariantKind;

    const TWO_CLASSES: &str = "public class Foo {}\npublic class Bar {}\n";

    fn fixture(root: &Path, source: &str) -> (HarnessConfigManager, Task, Variant) {
        let task_dir = root.join("tasks/000001");
        fs::create_dir_all(task_dir.join("src/test/java")).unwrap();
        fs::create_dir_all(task_dir.join("src/main/java")).unwrap();
        let test_file = task_dir.join("src/test/java/SolutionTest.java");
        fs::write(
            &test_file,
            "public class SolutionTest {\n    private final Solution s = new Solution();\n}\n",
        )
        .unwrap();
        let solution = task_dir.join("src/main/java/Solution.java");
        fs::write(&solution, source).unwrap();
        let manifest = task_dir.join("installed_packages.txt");
        fs::write(&manifest, "org.json:json:20230227\n").unwrap();

        let mut config = HarnessConfig::default();
        config.work_root = root.join("work");
        let manager = HarnessConfigManager::from_config(config).unwrap();

        let variant = Variant {
            task_id: "000001".to_string(),
            id: "A".to_string(),
            kind: VariantKind::Alternate,
            group: Some("claude".to_string()),
            source: solution.clone(),
        };
        let task = Task {
            id: "000001".to_string(),
            dir: task_dir,
            test_file,
            solution,
            baseline: None,
            manifest: Some(manifest),
            variants: vec![variant.clone()],
        };
        (manager, task, variant)
    }

    #[test]
    fn test_top_level_detection_ignores_nested_and_comments() {
        let source = r#"
// public class Commented {}
/* public class Blocked {} */
import java.util.*;

public final class Outer {
    public static class Inner {}
    String s = "public class InString {";
    char c = '{';
}

class PackagePrivate {}
"#;
        assert_eq!(top_level_public_types(source), vec!["Outer"]);
    }

    #[test]
    fn test_top_level_code_keeps_byte_offsets() {
        let source = "/* déjà vu */ public record Point(int x) {\n    String t = \"\"\"\n        public class Hidden {}\n        \"\"\";\n    String u = \"ünï\";\n}\npublic enum Mode {}\n";
        let code = top_level_code(source);

        assert_eq!(code.len(), source.len());
        assert_eq!(code.matches('\n').count(), source.matches('\n').count());
        let at = source.find("public record").unwrap();
        assert_eq!(&code[at..at + "public record".len()], "public record");
        assert_eq!(top_level_public_types(source), vec!["Point", "Mode"]);
    }

    #[test]
    fn test_rename_replaces_whole_words() {
        let source = "public class ImageProcessor {\n    public ImageProcessor() {}\n    ImageProcessorHelper h;\n}\n";
        let renamed = rename_public_type(source, "Main", Path::new("A.java")).unwrap();
        assert!(renamed.contains("public class Main {"));
        assert!(renamed.contains("public Main() {}"));
        assert!(renamed.contains("ImageProcessorHelper h;"));
    }

    #[test]
    fn test_rename_rejects_multiple_declarations() {
        let err = rename_public_type(TWO_CLASSES, "Main", Path::new("B.java")).unwrap_err();
        match err {
            MaterializationError::MultipleDeclarations { names, .. } => {
                assert_eq!(names, vec!["Foo", "Bar"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rename_without_public_type_is_unchanged() {
        let source = "class Hidden {}\n";
        assert_eq!(rename_public_type(source, "Main", Path::new("C.java")).unwrap(), source);
    }

    #[test]
    fn test_detect_target_type() {
        let candidates = vec!["Solution".to_string(), "Main".to_string()];
        assert_eq!(detect_target_type("new Main()", &candidates), "Main");
        assert_eq!(detect_target_type("new Solution()", &candidates), "Solution");
        assert_eq!(detect_target_type("MainTest only", &candidates), "Solution");
    }

    #[test]
    fn test_manifest_dependencies() {
        let manifest = r#"
dependencies {
    implementation 'com.fasterxml.jackson.core:jackson-databind:2.15.2'
    testImplementation 'org.junit.jupiter:junit-jupiter-api:5.9.2'
    testImplementation 'org.mockito:mockito-junit-jupiter:5.15.2'
    implementation 'org.nd4j:nd4j-native-platform:1.0.0-M2.1'
    implementation 'com.fasterxml.jackson.core:jackson-databind:2.15.2'
}
org.jsoup:jsoup:1.18.3
# comment
not a dependency
"#;
        let excluded = vec!["org.nd4j:nd4j-native-platform:1.0.0-M2.1".to_string()];
        assert_eq!(
            manifest_dependencies(manifest, &excluded),
            vec![
                "implementation 'com.fasterxml.jackson.core:jackson-databind:2.15.2'",
                "testImplementation 'org.mockito:mockito-junit-jupiter:5.15.2'",
                "implementation 'org.jsoup:jsoup:1.18.3'",
            ]
        );
    }

    #[test]
    fn test_render_descriptor() {
        let text = render_descriptor("head\n{dependencies}\ntail", &["implementation 'a:b:1'".to_string()]);
        assert_eq!(text, "head\ndependencies {\n    implementation 'a:b:1'\n}\ntail");
    }

    #[test]
    fn test_materialize_lays_out_project() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, task, variant) = fixture(scratch.path(), "public class Answer {\n    public Answer() {}\n}\n");
        let sweeper = Arc::new(Sweeper::new());
        let materializer = Materializer::new(&config);

        let guard = materializer.materialize(&task, &variant, "1-deadbeef", &sweeper).unwrap();

        assert!(guard.root.ends_with("000001_A_1-deadbeef"));
        assert!(guard.config_root.is_dir());
        let unit = fs::read_to_string(guard.root.join("src/main/java/Solution.java")).unwrap();
        assert!(unit.contains("public class Solution {"));
        assert!(guard.root.join("src/test/java/SolutionTest.java").is_file());
        let descriptor = fs::read_to_string(guard.root.join("build.gradle")).unwrap();
        assert!(descriptor.contains("junit-jupiter-engine"));
        assert!(descriptor.contains("implementation 'org.json:json:20230227'"));

        let (root, config_root) = (guard.root.clone(), guard.config_root.clone());
        drop(guard);
        assert!(!root.exists());
        assert!(!config_root.exists());
    }

    #[test]
    fn test_failed_materialization_is_reclaimed() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, task, variant) = fixture(scratch.path(), TWO_CLASSES);
        let sweeper = Arc::new(Sweeper::new());
        let materializer = Materializer::new(&config);
        let planned = materializer.plan(&task, &variant, "2-deadbeef");

        let result = materializer.materialize(&task, &variant, "2-deadbeef", &sweeper);

        assert!(matches!(result, Err(MaterializationError::MultipleDeclarations { .. })));
        assert!(!planned.root.exists());
        assert!(!planned.config_root.exists());
        assert_eq!(sweeper.reclaimed(), 1);
    }

    #[test]
    fn test_missing_variant_file_is_io_error() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, task, mut variant) = fixture(scratch.path(), "public class X {}");
        variant.source = scratch.path().join("missing.java");
        let sweeper = Arc::new(Sweeper::new());

        let result = Materializer::new(&config).materialize(&task, &variant, "3-deadbeef", &sweeper);
        assert!(matches!(result, Err(MaterializationError::Io { action: "read", .. })));
    }

    #[test]
    fn test_concurrent_plans_never_collide() {
        let scratch = tempfile::tempdir().unwrap();
        let (config, task, variant) = fixture(scratch.path(), "public class X {}");
        let materializer = Materializer::new(&config);

        let mut roots = HashSet::new();
        let mut config_roots = HashSet::new();
        for _ in 0..64 {
            let ws = materializer.plan(&task, &variant, &layout::run_token());
            assert!(roots.insert(ws.root.clone()));
            assert!(config_roots.insert(ws.config_root.clone()));
            assert!(!roots.contains(&ws.config_root));
        }
    }
}
