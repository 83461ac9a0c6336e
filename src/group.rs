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

//! Host groups: concurrent fan-out with failed hosts pruned from the set.

use futures::future::join_all;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, Instrument};

use crate::error::{Error, Result};
use crate::host::Host;

/// Per-host results keyed by host name.
pub type HostMap<T> = BTreeMap<String, T>;

/// The active set of hosts an operation fans out to.
///
/// Clones share the same set, so a host pruned through one handle is gone
/// for all of them.
#[derive(Debug, Clone, Default)]
pub struct HostGroup {
    hosts: Arc<Mutex<Vec<Arc<Host>>>>,
}

impl HostGroup {
    pub fn new(hosts: impl IntoIterator<Item = Arc<Host>>) -> Self {
        Self {
            hosts: Arc::new(Mutex::new(hosts.into_iter().collect())),
        }
    }

    /// Parse a newline-delimited inventory of `[user@]host[:port]` entries.
    ///
    /// Blank lines and `#` comments are skipped. Each entry is named as
    /// written, and an entry listed twice is rejected since results are keyed
    /// by name.
    pub fn from_inventory(text: &str, default_user: &str, default_port: u16) -> Result<Self> {
        let hosts = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| Host::parse(line, default_user, default_port).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let mut names = HashSet::new();
        for host in &hosts {
            if !names.insert(host.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate inventory entry '{}'",
                    host.name
                )));
            }
        }
        Ok(Self::new(hosts))
    }

    fn active(&self) -> MutexGuard<'_, Vec<Arc<Host>>> {
        self.hosts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the active set.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.active().clone()
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active().iter().any(|host| host.name == name)
    }

    /// Whether this exact host entry is still active.
    pub fn contains_host(&self, host: &Arc<Host>) -> bool {
        self.active().iter().any(|h| Arc::ptr_eq(h, host))
    }

    /// Drop `host` from the active set. Returns whether it was present.
    ///
    /// Entries are matched by identity, so another entry for the same
    /// address under a different user stays.
    pub fn remove(&self, host: &Arc<Host>) -> bool {
        let mut hosts = self.active();
        let before = hosts.len();
        hosts.retain(|h| !Arc::ptr_eq(h, host));
        hosts.len() != before
    }

    /// Run `operation` on every active host concurrently.
    ///
    /// A host whose operation fails is logged and removed; the others carry
    /// on. Fails with [`Error::NoHostsRemaining`] if the set is empty before
    /// the round or becomes empty during it.
    pub async fn map<T, F, Fut>(&self, operation: F) -> Result<HostMap<T>>
    where
        F: Fn(Arc<Host>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let hosts = self.hosts();
        if hosts.is_empty() {
            return Err(Error::NoHostsRemaining);
        }

        let rounds = hosts.into_iter().map(|host| {
            let span = tracing::info_span!("host", name = %host.name);
            let pending = operation(host.clone());
            async move { (host, pending.await) }.instrument(span)
        });

        let mut results = HostMap::new();
        for (host, outcome) in join_all(rounds).await {
            match outcome {
                Ok(value) => {
                    results.insert(host.name.clone(), value);
                }
                Err(e) => {
                    error!(host = %host.name, "{e}");
                    self.remove(&host);
                }
            }
        }

        if self.is_empty() {
            return Err(Error::NoHostsRemaining);
        }
        Ok(results)
    }
}
