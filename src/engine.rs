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

use std::sync::Arc;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::group::HostGroup;
use crate::lifecycle::{LifecycleController, Prober, TcpProber};
use crate::once::IdempotencyTracker;
use crate::ssh::{Connector, SshConnector};
use crate::transfer::{FileTransfer, SyncSettings};

/// One instance of every component, wired together from a [`Config`].
#[derive(Debug)]
pub struct Engine {
    config: Config,
    connections: Arc<ConnectionManager>,
    executor: Arc<CommandExecutor>,
    transfer: Arc<FileTransfer>,
    lifecycle: LifecycleController,
    tracker: IdempotencyTracker,
}

impl Engine {
    /// Engine speaking SSH through russh and probing over TCP.
    pub fn new(config: Config) -> Self {
        let connector = Arc::new(SshConnector::new(config.clone()));
        let prober = Arc::new(TcpProber::new(config.ping_timeout()));
        Self::with_transport(config, connector, prober)
    }

    /// Engine over an arbitrary transport.
    pub fn with_transport(
        config: Config,
        connector: Arc<dyn Connector>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let connections = Arc::new(ConnectionManager::new(connector));
        let executor = Arc::new(CommandExecutor::new(
            connections.clone(),
            config.request_pty,
        ));
        let transfer = Arc::new(FileTransfer::new(
            connections.clone(),
            executor.clone(),
            SyncSettings::from(&config),
        ));
        let lifecycle =
            LifecycleController::new(connections.clone(), executor.clone(), prober, &config);
        let tracker = IdempotencyTracker::new(
            executor.clone(),
            transfer.clone(),
            config.once_store.clone(),
        );

        Self {
            config,
            connections,
            executor,
            transfer,
            lifecycle,
            tracker,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn transfer(&self) -> &FileTransfer {
        &self.transfer
    }

    pub fn lifecycle(&self) -> &LifecycleController {
        &self.lifecycle
    }

    pub fn tracker(&self) -> &IdempotencyTracker {
        &self.tracker
    }

    /// Build a group from an inventory, using the configured SSH port for
    /// entries that do not name one.
    pub fn inventory(&self, text: &str, default_user: &str) -> Result<HostGroup> {
        HostGroup::from_inventory(text, default_user, self.config.port)
    }

    /// Close every cached session.
    pub async fn shutdown(&self) {
        self.connections.disconnect_all().await;
    }
}
