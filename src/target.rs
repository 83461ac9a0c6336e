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

//! The operations shared by a single host and a group of hosts.

use async_trait::async_trait;
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::Result;
use crate::executor::{ExecutionResult, ShOptions};
use crate::group::{HostGroup, HostMap};
use crate::host::Host;
use crate::transfer::{CopyOptions, Source};

#[async_trait]
pub trait Operations: Send + Sync {
    async fn sh(&self, command: &str, options: &ShOptions) -> Result<HostMap<ExecutionResult>>;

    async fn sh_ok(&self, command: &str, options: &ShOptions) -> Result<HostMap<bool>>;

    async fn cp(
        &self,
        sources: &[Source],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<HostMap<()>>;

    async fn read(&self, path: &str, options: &ShOptions) -> Result<HostMap<Vec<u8>>>;

    async fn write(
        &self,
        data: &[u8],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<HostMap<()>>;

    async fn ping(&self) -> Result<HostMap<bool>>;
}

/// Operations on one host. Failures propagate instead of pruning.
#[derive(Debug, Clone)]
pub struct HostTarget {
    engine: Arc<Engine>,
    host: Arc<Host>,
}

impl HostTarget {
    pub fn new(engine: Arc<Engine>, host: Arc<Host>) -> Self {
        Self { engine, host }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    fn single<T>(&self, value: T) -> HostMap<T> {
        HostMap::from([(self.host.name.clone(), value)])
    }
}

#[async_trait]
impl Operations for HostTarget {
    async fn sh(&self, command: &str, options: &ShOptions) -> Result<HostMap<ExecutionResult>> {
        let result = self.engine.executor().sh(&self.host, command, options).await?;
        Ok(self.single(result))
    }

    async fn sh_ok(&self, command: &str, options: &ShOptions) -> Result<HostMap<bool>> {
        let ok = self
            .engine
            .executor()
            .sh_ok(&self.host, command, options)
            .await?;
        Ok(self.single(ok))
    }

    async fn cp(
        &self,
        sources: &[Source],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<HostMap<()>> {
        self.engine
            .transfer()
            .cp(&self.host, sources, destination, options)
            .await?;
        Ok(self.single(()))
    }

    async fn read(&self, path: &str, options: &ShOptions) -> Result<HostMap<Vec<u8>>> {
        let contents = self.engine.executor().read(&self.host, path, options).await?;
        Ok(self.single(contents))
    }

    async fn write(
        &self,
        data: &[u8],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<HostMap<()>> {
        self.engine
            .transfer()
            .write(&self.host, data, destination, options)
            .await?;
        Ok(self.single(()))
    }

    async fn ping(&self) -> Result<HostMap<bool>> {
        Ok(self.single(self.engine.lifecycle().ping(&self.host).await))
    }
}

/// Operations fanned out over a [`HostGroup`], pruning hosts that fail.
#[derive(Debug, Clone)]
pub struct GroupTarget {
    engine: Arc<Engine>,
    group: HostGroup,
}

impl GroupTarget {
    pub fn new(engine: Arc<Engine>, group: HostGroup) -> Self {
        Self { engine, group }
    }

    pub fn group(&self) -> &HostGroup {
        &self.group
    }
}

#[async_trait]
impl Operations for GroupTarget {
    async fn sh(&self, command: &str, options: &ShOptions) -> Result<HostMap<ExecutionResult>> {
        let executor = self.engine.executor();
        self.group
            .map(|host| async move { executor.sh(&host, command, options).await })
            .await
    }

    async fn sh_ok(&self, command: &str, options: &ShOptions) -> Result<HostMap<bool>> {
        let executor = self.engine.executor();
        self.group
            .map(|host| async move { executor.sh_ok(&host, command, options).await })
            .await
    }

    async fn cp(
        &self,
        sources: &[Source],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<HostMap<()>> {
        let transfer = self.engine.transfer();
        self.group
            .map(|host| async move { transfer.cp(&host, sources, destination, options).await })
            .await
    }

    async fn read(&self, path: &str, options: &ShOptions) -> Result<HostMap<Vec<u8>>> {
        let executor = self.engine.executor();
        self.group
            .map(|host| async move { executor.read(&host, path, options).await })
            .await
    }

    async fn write(
        &self,
        data: &[u8],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<HostMap<()>> {
        let transfer = self.engine.transfer();
        self.group
            .map(|host| async move { transfer.write(&host, data, destination, options).await })
            .await
    }

    async fn ping(&self) -> Result<HostMap<bool>> {
        let lifecycle = self.engine.lifecycle();
        self.group
            .map(|host| async move { Ok(lifecycle.ping(&host).await) })
            .await
    }
}
