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

//! Session cache with one exclusive slot per (host, user).

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::host::{ConnectionKey, Host};
use crate::ssh::{Connector, Session};

#[derive(Default)]
struct Slot {
    session: Option<Arc<dyn Session>>,
}

type SlotHandle = Arc<AsyncMutex<Slot>>;

/// A live session held exclusively until dropped.
pub struct Connection {
    key: ConnectionKey,
    session: Arc<dyn Session>,
    _guard: OwnedMutexGuard<Slot>,
}

impl Connection {
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }
}

/// Exclusive region for a (host, user) pair that does not need a session.
pub struct ConnectionLock {
    _guard: OwnedMutexGuard<Slot>,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    // never held across an await
    slots: Mutex<HashMap<ConnectionKey, SlotHandle>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &ConnectionKey) -> SlotHandle {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry(key.clone()).or_default().clone()
    }

    fn slots_for(&self, host: &Host) -> Vec<SlotHandle> {
        let slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .iter()
            .filter(|(key, _)| key.address == host.address && key.port == host.port)
            .map(|(_, slot)| slot.clone())
            .collect()
    }

    /// Reject gateway chains that revisit a connection they started from.
    fn check_gateways(host: &Host, user: &str) -> Result<()> {
        let mut seen = HashSet::new();
        seen.insert(host.key_for(user));

        let mut current = host.via.clone();
        while let Some(gateway) = current {
            if !seen.insert(gateway.key_for(&gateway.user)) {
                return Err(Error::GatewayLoop {
                    host: host.name.clone(),
                });
            }
            current = gateway.via.clone();
        }
        Ok(())
    }

    /// Acquire the session for `host` as `user`, connecting (through the
    /// gateway, if any) when there is no live cached one.
    pub fn get<'a>(&'a self, host: &'a Host, user: &'a str) -> BoxFuture<'a, Result<Connection>> {
        async move {
            Self::check_gateways(host, user)?;

            let key = host.key_for(user);
            let mut guard = self.slot(&key).lock_owned().await;

            if let Some(session) = &guard.session {
                if !session.is_closed() {
                    return Ok(Connection {
                        key,
                        session: session.clone(),
                        _guard: guard,
                    });
                }
                debug!("Session {key} is closed, reconnecting");
                guard.session = None;
            }

            let session = match &host.via {
                Some(gateway) => {
                    let tunnel = self.get(gateway, &gateway.user).await?;
                    debug!("Connecting to {key} via {}", tunnel.key());
                    self.connector
                        .connect(host, user, Some(tunnel.session().clone()))
                        .await?
                }
                None => self.connector.connect(host, user, None).await?,
            };

            guard.session = Some(session.clone());
            Ok(Connection {
                key,
                session,
                _guard: guard,
            })
        }
        .boxed()
    }

    /// Enter the exclusive region for (`host`, `user`) without connecting.
    pub async fn lock(&self, host: &Host, user: &str) -> ConnectionLock {
        let guard = self.slot(&host.key_for(user)).lock_owned().await;
        ConnectionLock { _guard: guard }
    }

    /// Forget every cached session to `host`, whatever the user.
    pub async fn invalidate(&self, host: &Host) {
        for slot in self.slots_for(host) {
            let mut slot = slot.lock().await;
            if slot.session.take().is_some() {
                debug!("Dropped cached session to {}", host.name);
            }
        }
    }

    /// Close all cached sessions. Errors from already dead sessions are ignored.
    pub async fn disconnect_all(&self) {
        let slots: Vec<SlotHandle> = {
            let slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.values().cloned().collect()
        };

        for slot in slots {
            let session = slot.lock().await.session.take();
            if let Some(session) = session {
                if let Err(e) = session.disconnect().await {
                    debug!("Ignoring disconnect error: {e}");
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.slots.lock().map(|slots| slots.len()).unwrap_or(0);
        f.debug_struct("ConnectionManager")
            .field("slots", &count)
            .finish()
    }
}
