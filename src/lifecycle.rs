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

//! Reachability probes and reboot-and-wait.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::executor::{CommandExecutor, ShOptions};
use crate::host::Host;

/// Answers "does this host accept connections right now".
#[async_trait]
pub trait Prober: Send + Sync {
    async fn is_reachable(&self, host: &Host) -> bool;
}

/// Bare TCP connect to the SSH port.
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn is_reachable(&self, host: &Host) -> bool {
        let address = (host.address.as_str(), host.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("{} unreachable: {e}", host.name);
                false
            }
            Err(_) => {
                debug!("{} unreachable: probe timed out", host.name);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootState {
    Issued,
    WaitingDown,
    WaitingUp,
    Done,
}

/// Reboot progress driven purely by probe observations.
///
/// `Done` is only reachable through an unreachable observation followed by a
/// reachable one; a host that never went down never counts as rebooted.
#[derive(Debug, Clone)]
pub struct RebootWait {
    state: RebootState,
}

impl Default for RebootWait {
    fn default() -> Self {
        Self::new()
    }
}

impl RebootWait {
    pub fn new() -> Self {
        Self {
            state: RebootState::Issued,
        }
    }

    pub fn state(&self) -> RebootState {
        self.state
    }

    /// Feed one probe result and return the new state.
    pub fn observe(&mut self, reachable: bool) -> RebootState {
        self.state = match (self.state, reachable) {
            (RebootState::Issued, true) | (RebootState::WaitingDown, true) => {
                RebootState::WaitingDown
            }
            (RebootState::Issued, false) | (RebootState::WaitingDown, false) => {
                RebootState::WaitingUp
            }
            (RebootState::WaitingUp, false) => RebootState::WaitingUp,
            (RebootState::WaitingUp, true) | (RebootState::Done, _) => RebootState::Done,
        };
        self.state
    }

    /// Delay before the next probe in the current state.
    pub fn poll_interval(&self, down: Duration, up: Duration) -> Duration {
        match self.state {
            RebootState::WaitingUp => up,
            _ => down,
        }
    }
}

pub struct LifecycleController {
    connections: Arc<ConnectionManager>,
    executor: Arc<CommandExecutor>,
    prober: Arc<dyn Prober>,
    reboot_command: String,
    poll_down: Duration,
    poll_up: Duration,
    ceiling: Option<Duration>,
    ping_timeout: Duration,
}

impl LifecycleController {
    pub fn new(
        connections: Arc<ConnectionManager>,
        executor: Arc<CommandExecutor>,
        prober: Arc<dyn Prober>,
        config: &Config,
    ) -> Self {
        Self {
            connections,
            executor,
            prober,
            reboot_command: config.reboot_command.clone(),
            poll_down: config.reboot_poll_down(),
            poll_up: config.reboot_poll_up(),
            ceiling: config.reboot_timeout(),
            ping_timeout: config.ping_timeout(),
        }
    }

    /// Whether `host` accepts TCP connections. Never an error.
    ///
    /// Hosts behind a gateway are probed from the gateway by opening a
    /// forwarded channel to their SSH port.
    pub async fn ping(&self, host: &Host) -> bool {
        match &host.via {
            Some(gateway) => self.ping_through(gateway, host).await,
            None => self.prober.is_reachable(host).await,
        }
    }

    async fn ping_through(&self, gateway: &Host, host: &Host) -> bool {
        let attempt = async {
            let conn = self.connections.get(gateway, &gateway.user).await?;
            conn.session().open_tunnel(&host.address, host.port).await?;
            Ok::<_, Error>(())
        };
        match tokio::time::timeout(self.ping_timeout, attempt).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("{} unreachable via {}: {e}", host.name, gateway.name);
                false
            }
            Err(_) => {
                debug!("{} unreachable via {}: probe timed out", host.name, gateway.name);
                false
            }
        }
    }

    /// Reboot `host` and wait until it has gone down and come back.
    pub async fn reboot(&self, host: &Host, options: &ShOptions) -> Result<()> {
        info!("Rebooting {}", host.name);
        match self
            .executor
            .sh(host, &self.reboot_command, options)
            .await
        {
            Ok(_) => {}
            // the session usually dies under the reboot command
            Err(e) if e.is_connectivity() => debug!("{}: {e}", host.name),
            Err(e) => return Err(e),
        }
        self.connections.invalidate(host).await;

        let started = Instant::now();
        let mut wait = RebootWait::new();
        while wait.state() != RebootState::Done {
            if let Some(ceiling) = self.ceiling {
                if started.elapsed() >= ceiling {
                    return Err(Error::RebootTimeout {
                        host: host.name.clone(),
                        waited: started.elapsed(),
                    });
                }
            }

            sleep(wait.poll_interval(self.poll_down, self.poll_up)).await;
            let reachable = self.ping(host).await;
            let state = wait.observe(reachable);
            debug!("{}: reachable={reachable}, {state:?}", host.name);
        }

        info!("{} is back", host.name);
        Ok(())
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("reboot_command", &self.reboot_command)
            .field("poll_down", &self.poll_down)
            .field("poll_up", &self.poll_up)
            .field("ceiling", &self.ceiling)
            .field("ping_timeout", &self.ping_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reachable_before_going_down_is_not_done() {
        let mut wait = RebootWait::new();
        assert_eq!(wait.observe(true), RebootState::WaitingDown);
        assert_eq!(wait.observe(true), RebootState::WaitingDown);
        assert_eq!(wait.observe(false), RebootState::WaitingUp);
        assert_eq!(wait.observe(false), RebootState::WaitingUp);
        assert_eq!(wait.observe(true), RebootState::Done);
    }

    #[test]
    fn test_done_requires_a_failed_poll() {
        // Any observation sequence reaching Done contains a `false` before the final `true`
        for bits in 0u32..256 {
            let observations: Vec<bool> = (0..8).map(|i| bits & (1 << i) != 0).collect();
            let mut wait = RebootWait::new();
            for (i, &reachable) in observations.iter().enumerate() {
                if wait.observe(reachable) == RebootState::Done {
                    assert!(reachable);
                    assert!(observations[..i].contains(&false));
                    break;
                }
            }
        }
    }

    #[test]
    fn test_poll_interval_follows_state() {
        let down = Duration::from_secs(1);
        let up = Duration::from_secs(2);
        let mut wait = RebootWait::new();
        assert_eq!(wait.poll_interval(down, up), down);
        wait.observe(false);
        assert_eq!(wait.poll_interval(down, up), up);
    }

    #[tokio::test]
    async fn test_tcp_probe_of_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = TcpProber::new(Duration::from_secs(1));
        let host = Host::new("127.0.0.1", "deploy").with_port(port);

        assert!(prober.is_reachable(&host).await);
        drop(listener);
        assert!(!prober.is_reachable(&host).await);
    }
}
