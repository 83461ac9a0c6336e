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

//! Task execution context.
//!
//! A [`Context`] carries the dynamic scope tasks run in: the hosts they act
//! on, the user they act as, the file they were loaded from, the task search
//! path and free-form variables. Every operation here fans out over the
//! current host group, pruning hosts that fail.

mod scope;
mod task;

pub use scope::Overrides;
pub use task::{
    candidates, resolve, ResolvedTask, RunOptions, TaskFn, TaskKind, TaskRegistry, ENTRY_FILE,
    TASK_EXTENSION,
};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, Instrument};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::executor::{ExecutionResult, ShOptions};
use crate::group::{HostGroup, HostMap};
use crate::host::Host;
use crate::target::{GroupTarget, Operations};
use crate::template::{find_templates, remote_join, TemplateRenderer, Variables};
use crate::transfer::{CopyOptions, Source};

#[derive(Clone)]
pub struct Context {
    engine: Arc<Engine>,
    registry: Arc<TaskRegistry>,
    path: Vec<PathBuf>,
    hosts: HostGroup,
    user: Option<String>,
    file: Option<PathBuf>,
    variables: Variables,
}

impl Context {
    pub fn new(
        engine: Arc<Engine>,
        registry: Arc<TaskRegistry>,
        path: Vec<PathBuf>,
        hosts: HostGroup,
    ) -> Self {
        Self {
            engine,
            registry,
            path,
            hosts,
            user: None,
            file: None,
            variables: Variables::new(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn hosts(&self) -> &HostGroup {
        &self.hosts
    }

    /// Acting-user override, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// File of the task currently running.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn path(&self) -> &[PathBuf] {
        &self.path
    }

    /// Directory relative file operations resolve against.
    pub fn base_dir(&self) -> Option<PathBuf> {
        self.file
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.variables.remove(name)
    }

    /// Operations over the current host group.
    pub fn target(&self) -> GroupTarget {
        GroupTarget::new(self.engine.clone(), self.hosts.clone())
    }

    fn sh_options(&self, quiet: bool) -> ShOptions {
        ShOptions {
            user: self.user.clone(),
            pty: None,
            quiet,
        }
    }

    fn copy_options(&self) -> CopyOptions {
        CopyOptions {
            user: self.user.clone(),
            delete: false,
            base_dir: self.base_dir(),
            quiet: false,
        }
    }

    /// Resolve and run the task `name`.
    pub fn run<'a>(&'a mut self, name: &str, options: RunOptions) -> BoxFuture<'a, Result<()>> {
        let name = name.to_string();
        let span = tracing::info_span!("run", task = %name);

        async move {
            if !options.quiet {
                info!("run {name}");
            }
            let task = match resolve(&self.registry, &self.path, &name) {
                Ok(task) => task,
                Err(Error::TaskNotFound { .. }) if options.optional => {
                    debug!("optional task {name} not found, skipping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match options.once {
                Some(key) => self
                    .once(&key, move |ctx| ctx.invoke(task))
                    .await
                    .map(|_| ()),
                None => self.invoke(task).await,
            }
        }
        .instrument(span)
        .boxed()
    }

    fn invoke(&mut self, task: ResolvedTask) -> BoxFuture<'_, Result<()>> {
        let ResolvedTask { file, kind } = task;
        let overrides = Overrides::new().file(file.clone());

        self.with(overrides, move |ctx| match kind {
            TaskKind::Registered(body) => body(ctx),
            TaskKind::Script => async move {
                let script = tokio::fs::read_to_string(&file).await?;
                ctx.sh(&script).await.map(|_| ())
            }
            .boxed(),
        })
        .boxed()
    }

    /// Run `body` once per host under `key`.
    ///
    /// Hosts that already recorded `key` are skipped; `body` runs a single
    /// time scoped to the rest, which then record `key`. Returns `None` when
    /// no host was pending.
    pub async fn once<T, F>(&mut self, key: &str, body: F) -> Result<Option<T>>
    where
        F: for<'a> FnOnce(&'a mut Context) -> BoxFuture<'a, Result<T>>,
    {
        let engine = self.engine.clone();
        let tracker = engine.tracker();

        let done = self
            .hosts
            .map(|host| async move { tracker.is_done(&host, key).await })
            .await?;
        let pending: Vec<Arc<Host>> = self
            .hosts
            .hosts()
            .into_iter()
            .filter(|host| done.get(&host.name) == Some(&false))
            .collect();

        if pending.is_empty() {
            debug!("once {key}: done on every host");
            return Ok(None);
        }

        let scope = HostGroup::new(pending.iter().cloned());
        let outcome = self.with(Overrides::new().hosts(scope.clone()), body).await;
        self.prune_missing(&pending, &scope);

        let value = match outcome {
            Ok(value) => value,
            Err(Error::NoHostsRemaining) => return self.check_remaining().map(|_| None),
            Err(e) => return Err(e),
        };

        let marked = scope
            .map(|host| async move { tracker.mark_done(&host, key).await })
            .await;
        self.prune_missing(&pending, &scope);
        match marked {
            Ok(_) => Ok(Some(value)),
            Err(Error::NoHostsRemaining) => self.check_remaining().map(|_| None),
            Err(e) => Err(e),
        }
    }

    /// Hosts pruned from a sub-scope are pruned from the current group too.
    fn prune_missing(&self, pending: &[Arc<Host>], scope: &HostGroup) {
        for host in pending {
            if !scope.contains_host(host) {
                self.hosts.remove(host);
            }
        }
    }

    fn check_remaining(&self) -> Result<()> {
        if self.hosts.is_empty() {
            Err(Error::NoHostsRemaining)
        } else {
            Ok(())
        }
    }

    pub async fn sh(&self, command: &str) -> Result<HostMap<ExecutionResult>> {
        self.sh_with(command, &self.sh_options(false)).await
    }

    pub async fn sh_with(
        &self,
        command: &str,
        options: &ShOptions,
    ) -> Result<HostMap<ExecutionResult>> {
        if !options.quiet {
            info!("sh {command}");
        }
        let mut options = options.clone();
        if options.user.is_none() {
            options.user = self.user.clone();
        }
        self.target().sh(command, &options).await
    }

    /// Run `command`, mapping a nonzero exit status to `false` per host.
    pub async fn sh_ok(&self, command: &str) -> Result<HostMap<bool>> {
        self.target().sh_ok(command, &self.sh_options(true)).await
    }

    pub async fn cp(&self, sources: &[Source], destination: &str) -> Result<HostMap<()>> {
        self.cp_with(sources, destination, &self.copy_options()).await
    }

    /// Copy with explicit options. Unset fields fall back to the context's
    /// acting user and task directory.
    pub async fn cp_with(
        &self,
        sources: &[Source],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<HostMap<()>> {
        if !options.quiet {
            info!("cp {} source(s) -> {destination}", sources.len());
        }
        let mut options = options.clone();
        if options.user.is_none() {
            options.user = self.user.clone();
        }
        if options.base_dir.is_none() {
            options.base_dir = self.base_dir();
        }
        self.target().cp(sources, destination, &options).await
    }

    pub async fn read(&self, path: &str) -> Result<HostMap<Vec<u8>>> {
        info!("read {path}");
        self.target().read(path, &self.sh_options(true)).await
    }

    pub async fn write(&self, data: &[u8], destination: &str) -> Result<HostMap<()>> {
        info!("write {} bytes -> {destination}", data.len());
        self.target()
            .write(data, destination, &self.copy_options())
            .await
    }

    /// Render every `*.tmpl` under `from_dir` and install the results under
    /// `to_dir`, keeping relative paths and dropping the extension.
    pub async fn render(
        &self,
        from_dir: impl AsRef<Path>,
        to_dir: &str,
        renderer: &dyn TemplateRenderer,
    ) -> Result<HostMap<()>> {
        let from_dir = match self.base_dir() {
            Some(base) if from_dir.as_ref().is_relative() => base.join(from_dir),
            _ => from_dir.as_ref().to_path_buf(),
        };

        // rendered once, installed identically on every host
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        for template in find_templates(&from_dir)? {
            let text = tokio::fs::read_to_string(&template.source).await?;
            let contents = renderer.render(&text, &self.variables)?;
            let target = remote_join(to_dir, &template.relative_target);
            info!("render {} -> {target}", template.source.display());
            files.push((target, contents));
        }

        let options = CopyOptions {
            quiet: true,
            ..self.copy_options()
        };
        let transfer = self.engine.transfer();
        let files = &files;
        let options = &options;
        self.hosts
            .map(|host| async move {
                for (target, data) in files {
                    transfer.write(&host, data, target, options).await?;
                }
                Ok(())
            })
            .await
    }

    pub async fn ping(&self) -> Result<HostMap<bool>> {
        self.target().ping().await
    }

    /// Reboot every host and wait for each to come back.
    pub async fn reboot(&self) -> Result<HostMap<()>> {
        info!("reboot");
        let lifecycle = self.engine.lifecycle();
        let options = self.sh_options(false);
        let options = &options;
        self.hosts
            .map(|host| async move { lifecycle.reboot(&host, options).await })
            .await
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("hosts", &self.hosts)
            .field("user", &self.user)
            .field("file", &self.file)
            .field("path", &self.path)
            .field("variables", &self.variables)
            .finish()
    }
}
