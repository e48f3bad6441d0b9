/// Variant Catalog - Task Discovery
///
/// Scans the tasks root once at startup and produces immutable `Task`s,
/// each carrying its ordered variants (solution, base, then alternates).
///
/// A task directory missing its ground-truth test or solution is skipped
/// with a warning; only a missing root aborts the run.

use crate::config::HarnessConfigManager;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use trialbench_common::types::{Task, Variant, VariantKind, BASE_ID, SOLUTION_ID};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("task {task_id}: ground-truth test file not found at {path}")]
    MissingTestFile { task_id: String, path: PathBuf },
    #[error("task {task_id}: ground-truth solution not found at {path}")]
    MissingSolution { task_id: String, path: PathBuf },
    #[error("task {task_id}: failed to list {path}: {source}")]
    Io {
        task_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("tasks root {0} does not exist or is not a directory")]
    RootMissing(PathBuf),
    #[error("failed to list tasks root {path}: {source}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Derive a variant identifier from an alternate's file stem.
///
/// A single letter maps to itself upper-cased, `modelN` maps to the N-th
/// letter of the alphabet, anything else is used verbatim.
pub fn variant_id_from_stem(stem: &str) -> String {
    let mut chars = stem.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c.is_ascii_alphabetic() {
            return c.to_ascii_uppercase().to_string();
        }
    }

    if let Some(n) = stem.strip_prefix("model").and_then(|n| n.parse::<u8>().ok()) {
        if (1..=26).contains(&n) {
            return ((b'A' + n - 1) as char).to_string();
        }
    }

    stem.to_string()
}

pub struct Catalog<'a> {
    config: &'a HarnessConfigManager,
    solution_only: bool,
    task_filter: BTreeSet<String>,
}

impl<'a> Catalog<'a> {
    pub fn new(config: &'a HarnessConfigManager) -> Self {
        Self {
            config,
            solution_only: false,
            task_filter: BTreeSet::new(),
        }
    }

    /// Only enumerate the ground-truth solution of each task
    pub fn solution_only(mut self, enabled: bool) -> Self {
        self.solution_only = enabled;
        self
    }

    /// Restrict discovery to the given task ids; empty means all
    pub fn only_tasks<I: IntoIterator<Item = String>>(mut self, ids: I) -> Self {
        self.task_filter = ids.into_iter().collect();
        self
    }

    /// Enumerate every usable task under `root` in lexicographic order
    pub fn enumerate(&self, root: &Path) -> Result<Vec<Task>, CatalogError> {
        if !root.is_dir() {
            return Err(CatalogError::RootMissing(root.to_path_buf()));
        }

        let entries = fs::read_dir(root).map_err(|source| CatalogError::ReadRoot {
            path: root.to_path_buf(),
            source,
        })?;

        let mut candidates: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_str()?.to_string();
                self.config
                    .is_task_dir_name(&name)
                    .then(|| (name, entry.path()))
            })
            .filter(|(name, _)| self.task_filter.is_empty() || self.task_filter.contains(name))
            .collect();
        candidates.sort();

        for wanted in &self.task_filter {
            if !candidates.iter().any(|(name, _)| name == wanted) {
                warn!(task_id = %wanted, "Requested task not found under root");
            }
        }

        let mut tasks = Vec::with_capacity(candidates.len());
        for (task_id, dir) in candidates {
            match self.discover_task(&task_id, &dir) {
                Ok(task) => {
                    debug!(task_id = %task.id, variants = task.variants.len(), "Discovered task");
                    tasks.push(task);
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "Skipping task"),
            }
        }

        info!(
            root = %root.display(),
            tasks = tasks.len(),
            variants = tasks.iter().map(|t| t.variants.len()).sum::<usize>(),
            "Catalog enumerated"
        );
        Ok(tasks)
    }

    fn discover_task(&self, task_id: &str, dir: &Path) -> Result<Task, DiscoveryError> {
        let layout = &self.config.config().layout;

        let test_file = dir.join(&layout.test_file);
        if !test_file.is_file() {
            return Err(DiscoveryError::MissingTestFile {
                task_id: task_id.to_string(),
                path: test_file,
            });
        }

        let solution = dir.join(&layout.solution_file);
        if !solution.is_file() {
            return Err(DiscoveryError::MissingSolution {
                task_id: task_id.to_string(),
                path: solution,
            });
        }

        let baseline = Some(dir.join(&layout.baseline_file)).filter(|p| p.is_file());
        let manifest = Some(dir.join(&layout.manifest_file)).filter(|p| p.is_file());

        let mut variants = vec![self.variant(task_id, SOLUTION_ID, VariantKind::Solution, &solution)];

        if !self.solution_only {
            if let Some(baseline) = &baseline {
                variants.push(self.variant(task_id, BASE_ID, VariantKind::Base, baseline));
            }

            let alternates_dir = dir.join(&layout.alternates_dir);
            if alternates_dir.is_dir() {
                for path in self.alternate_files(task_id, &alternates_dir)? {
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    let id = variant_id_from_stem(stem);
                    if variants.iter().any(|v| v.id == id) {
                        warn!(
                            task_id = %task_id,
                            variant_id = %id,
                            file = %path.display(),
                            "Duplicate variant identifier, skipping file"
                        );
                        continue;
                    }
                    variants.push(self.variant(task_id, &id, VariantKind::Alternate, &path));
                }
            }
        }

        Ok(Task {
            id: task_id.to_string(),
            dir: dir.to_path_buf(),
            test_file,
            solution,
            baseline,
            manifest,
            variants,
        })
    }

    fn alternate_files(&self, task_id: &str, dir: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
        let extension = self.config.config().layout.source_extension.as_str();
        let entries = fs::read_dir(dir).map_err(|source| DiscoveryError::Io {
            task_id: task_id.to_string(),
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(extension))
            .collect();
        files.sort();
        Ok(files)
    }

    fn variant(&self, task_id: &str, id: &str, kind: VariantKind, source: &Path) -> Variant {
        let group = match kind {
            VariantKind::Alternate => self.config.group_of(id).map(str::to_string),
            VariantKind::Solution | VariantKind::Base => None,
        };
        Variant {
            task_id: task_id.to_string(),
            id: id.to_string(),
            kind,
            group,
            source: source.to_path_buf(),
        }
    }
}
