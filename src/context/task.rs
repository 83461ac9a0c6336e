// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Task registration and search-path resolution.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

use super::Context;
use crate::error::{Error, Result};

pub const TASK_EXTENSION: &str = "blow";
pub const ENTRY_FILE: &str = "entry.blow";

/// A task body: borrows the context for the duration of the run.
pub type TaskFn = Arc<dyn for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync>;

/// Tasks the hosting program provides, keyed by the path they resolve at.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<PathBuf, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `task` at `path`, e.g. `tasks/deploy.blow`.
    pub fn register<F>(&mut self, path: impl Into<PathBuf>, task: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.tasks.insert(path.into(), Arc::new(task));
        self
    }

    pub fn get(&self, path: &Path) -> Option<TaskFn> {
        self.tasks.get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.tasks.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<&PathBuf> = self.tasks.keys().collect();
        paths.sort();
        f.debug_struct("TaskRegistry").field("tasks", &paths).finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip silently when the task cannot be found.
    pub optional: bool,
    /// Run at most once per host under this key.
    pub once: Option<String>,
    pub quiet: bool,
}

impl RunOptions {
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Self::default()
        }
    }

    pub fn once(key: impl Into<String>) -> Self {
        Self {
            once: Some(key.into()),
            ..Self::default()
        }
    }
}

/// What a task name resolved to.
#[derive(Clone)]
pub enum TaskKind {
    Registered(TaskFn),
    /// A file on disk, run remotely as a shell script.
    Script,
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered(_) => f.write_str("Registered"),
            Self::Script => f.write_str("Script"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedTask {
    pub file: PathBuf,
    pub kind: TaskKind,
}

/// Lookup order within one search directory.
pub fn candidates(dir: &Path, name: &str) -> [PathBuf; 3] {
    [
        dir.join(format!("{name}.{TASK_EXTENSION}")),
        dir.join(name).join(ENTRY_FILE),
        dir.join(name),
    ]
}

/// Resolve `name` over `search_path`; the first matching candidate wins.
pub fn resolve(
    registry: &TaskRegistry,
    search_path: &[PathBuf],
    name: &str,
) -> Result<ResolvedTask> {
    let mut searched = Vec::new();

    for dir in search_path {
        for candidate in candidates(dir, name) {
            trace!("checking {}", candidate.display());
            if let Some(task) = registry.get(&candidate) {
                return Ok(ResolvedTask {
                    file: candidate,
                    kind: TaskKind::Registered(task),
                });
            }
            if candidate.is_file() {
                return Ok(ResolvedTask {
                    file: candidate,
                    kind: TaskKind::Script,
                });
            }
            searched.push(candidate);
        }
    }

    Err(Error::TaskNotFound {
        name: name.to_string(),
        searched,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tempfile::TempDir;

    fn noop(registry: &mut TaskRegistry, path: &str) {
        registry.register(path, |_ctx| async { Ok(()) }.boxed());
    }

    #[test]
    fn test_candidate_order() {
        let [a, b, c] = candidates(Path::new("tasks"), "deploy");
        assert_eq!(a, PathBuf::from("tasks/deploy.blow"));
        assert_eq!(b, PathBuf::from("tasks/deploy/entry.blow"));
        assert_eq!(c, PathBuf::from("tasks/deploy"));
    }

    #[test]
    fn test_first_directory_wins() {
        let mut registry = TaskRegistry::new();
        noop(&mut registry, "site/deploy/entry.blow");
        noop(&mut registry, "lib/deploy.blow");

        let path = vec![PathBuf::from("site"), PathBuf::from("lib")];
        let found = resolve(&registry, &path, "deploy").unwrap();
        assert_eq!(found.file, PathBuf::from("site/deploy/entry.blow"));
    }

    #[test]
    fn test_registered_beats_disk_within_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("setup"), "echo hi\n").unwrap();

        let mut registry = TaskRegistry::new();
        noop(&mut registry, dir.path().join("setup.blow").to_str().unwrap());

        let found = resolve(&registry, &[dir.path().to_path_buf()], "setup").unwrap();
        assert_eq!(found.file, dir.path().join("setup.blow"));
        assert!(matches!(found.kind, TaskKind::Registered(_)));
    }

    #[test]
    fn test_disk_script_fallback() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("setup"), "echo hi\n").unwrap();

        let found = resolve(&TaskRegistry::new(), &[dir.path().to_path_buf()], "setup").unwrap();
        assert_eq!(found.file, dir.path().join("setup"));
        assert!(matches!(found.kind, TaskKind::Script));
    }

    #[test]
    fn test_not_found_lists_candidates() {
        let path = vec![PathBuf::from("a"), PathBuf::from("b")];
        match resolve(&TaskRegistry::new(), &path, "missing") {
            Err(Error::TaskNotFound { name, searched }) => {
                assert_eq!(name, "missing");
                assert_eq!(searched.len(), 6);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
