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

//! Dynamic scoping: temporary overrides restored on every exit path.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use super::Context;
use crate::error::Result;
use crate::group::HostGroup;

/// Fields to override for the extent of [`Context::with`].
///
/// Only variables named here are restored afterwards; variables the body
/// sets under other names persist.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    hosts: Option<HostGroup>,
    user: Option<Option<String>>,
    file: Option<Option<PathBuf>>,
    path: Option<Vec<PathBuf>>,
    variables: Vec<(String, Value)>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hosts(mut self, hosts: HostGroup) -> Self {
        self.hosts = Some(hosts);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(Some(user.into()));
        self
    }

    /// Drop the acting-user override so hosts use their default users.
    pub fn default_user(mut self) -> Self {
        self.user = Some(None);
        self
    }

    pub fn file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(Some(file.into()));
        self
    }

    pub fn path(mut self, path: Vec<PathBuf>) -> Self {
        self.path = Some(path);
        self
    }

    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.push((name.into(), value.into()));
        self
    }
}

impl Context {
    /// A copy of this context with `overrides` applied, plus the variable
    /// values they displaced.
    fn fork(&self, overrides: Overrides) -> (Context, Vec<(String, Option<Value>)>) {
        let mut scoped = self.clone();
        if let Some(hosts) = overrides.hosts {
            scoped.hosts = hosts;
        }
        if let Some(user) = overrides.user {
            scoped.user = user;
        }
        if let Some(file) = overrides.file {
            scoped.file = file;
        }
        if let Some(path) = overrides.path {
            scoped.path = path;
        }

        let mut displaced = Vec::with_capacity(overrides.variables.len());
        for (name, value) in overrides.variables {
            let previous = scoped.variables.insert(name.clone(), value);
            displaced.push((name, previous));
        }
        (scoped, displaced)
    }

    /// Take over the variables of a finished scope, except the overridden ones.
    fn merge(&mut self, scoped: Context, displaced: Vec<(String, Option<Value>)>) {
        let mut variables = scoped.variables;
        // reverse order so a name overridden twice ends at its original value
        for (name, previous) in displaced.into_iter().rev() {
            match previous {
                Some(value) => {
                    variables.insert(name, value);
                }
                None => {
                    variables.remove(&name);
                }
            }
        }
        self.variables = variables;
    }

    /// Run `body` with `overrides` applied.
    ///
    /// The body gets a scoped copy of the context, so this context is never
    /// modified while it runs: dropping the returned future part way leaves
    /// it exactly as it was. Once the body returns, fails or panics, variables
    /// it set under names that were not overridden are carried back.
    ///
    /// The body must own what it captures, e.g. `move |ctx| async move { .. }.boxed()`.
    pub async fn with<T, F>(&mut self, overrides: Overrides, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Context) -> BoxFuture<'a, Result<T>>,
    {
        let (mut scoped, displaced) = self.fork(overrides);
        let outcome = AssertUnwindSafe(body(&mut scoped)).catch_unwind().await;
        self.merge(scoped, displaced);

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Run `body` against `hosts` instead of the current group.
    pub async fn on<T, F>(&mut self, hosts: HostGroup, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Context) -> BoxFuture<'a, Result<T>>,
    {
        tracing::info!(
            "on {}",
            hosts
                .hosts()
                .iter()
                .map(|host| host.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        self.with(Overrides::new().hosts(hosts), body).await
    }

    /// Run `body` acting as `user` on every host.
    pub async fn as_user<T, F>(&mut self, user: impl Into<String>, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut Context) -> BoxFuture<'a, Result<T>>,
    {
        let user = user.into();
        tracing::info!("as {user}");
        self.with(Overrides::new().user(user), body).await
    }
}
