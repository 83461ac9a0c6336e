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

//! Run-once bookkeeping persisted on each host.
//!
//! The record is a flat JSON object (`{"key": true, ...}`) stored at a
//! configurable remote path and always accessed as the host's default user.
//! Read-modify-write is not transactional: two writers racing on the same
//! host keep whichever record lands last.

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, ShOptions};
use crate::host::Host;
use crate::transfer::{CopyOptions, FileTransfer};
use crate::utils::shell_quote;

pub type OnceRecord = Map<String, Value>;

pub struct IdempotencyTracker {
    executor: Arc<CommandExecutor>,
    transfer: Arc<FileTransfer>,
    store: String,
}

impl IdempotencyTracker {
    pub fn new(executor: Arc<CommandExecutor>, transfer: Arc<FileTransfer>, store: String) -> Self {
        Self {
            executor,
            transfer,
            store,
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    /// Read the record. A missing or unparsable record is empty.
    ///
    /// A record that exists but cannot be read is an error, so a later
    /// write never replaces keys it failed to see.
    pub async fn load(&self, host: &Host) -> Result<OnceRecord> {
        let options = ShOptions::quiet();
        let exists = format!("test -e {}", shell_quote(&self.store));
        if !self.executor.sh_ok(host, &exists, &options).await? {
            debug!("{}: no run-once record", host.name);
            return Ok(OnceRecord::new());
        }

        let contents = self.executor.read(host, &self.store, &options).await?;

        match serde_json::from_slice::<Value>(&contents) {
            Ok(Value::Object(record)) => Ok(record),
            Ok(_) | Err(_) => {
                debug!("{}: ignoring malformed run-once record", host.name);
                Ok(OnceRecord::new())
            }
        }
    }

    pub async fn is_done(&self, host: &Host, key: &str) -> Result<bool> {
        let record = self.load(host).await?;
        Ok(record.get(key) == Some(&Value::Bool(true)))
    }

    /// Set `key` in the record, re-reading it first to keep concurrent keys.
    pub async fn mark_done(&self, host: &Host, key: &str) -> Result<()> {
        let mut record = self.load(host).await?;
        record.insert(key.to_string(), Value::Bool(true));

        let data = serde_json::to_vec(&record).map_err(|e| Error::Other(e.into()))?;
        let options = CopyOptions {
            quiet: true,
            ..CopyOptions::default()
        };
        self.transfer
            .write(host, &data, &self.store, &options)
            .await
    }

    /// Run `operation` unless `key` is already recorded on `host`.
    ///
    /// Returns `None` when skipped. The key is only recorded after the
    /// operation succeeds.
    pub async fn once<T, F, Fut>(&self, host: &Host, key: &str, operation: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.is_done(host, key).await? {
            debug!("{}: skipping '{key}', already done", host.name);
            return Ok(None);
        }

        let value = operation().await?;
        self.mark_done(host, key).await?;
        Ok(Some(value))
    }
}

impl std::fmt::Debug for IdempotencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyTracker")
            .field("store", &self.store)
            .finish()
    }
}
