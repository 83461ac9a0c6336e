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

//! In-memory transport shared by the integration tests.
//!
//! Each address gets a fake remote with a tiny filesystem that understands
//! the commands the engine generates for reads and inline writes.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine as _;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

use blower::error::{ConnectivityKind, Error, Result};
use blower::lifecycle::Prober;
use blower::ssh::{CommandOutput, Connector, Session, TunnelStream};
use blower::{Config, Engine, Host, HostGroup};

#[derive(Debug, Clone)]
pub struct Scripted {
    pub pattern: String,
    pub status: u32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Default)]
pub struct Remote {
    pub files: HashMap<String, Vec<u8>>,
    /// (user, command) in execution order.
    pub commands: Vec<(String, String)>,
    pub scripted: Vec<Scripted>,
    pub refuse_connect: Option<ConnectivityKind>,
    /// Every exec on this host loses its channel.
    pub drop_channels: bool,
    pub probes: VecDeque<bool>,
    pub probe_count: usize,
    /// Outcomes of forwarded channels opened to this address; open once empty.
    pub tunnel_results: VecDeque<bool>,
}

#[derive(Debug, Default)]
struct State {
    remotes: HashMap<String, Remote>,
    /// (address, user, tunneled) per successful connect.
    connects: Vec<(String, String, bool)>,
    tunnels: Vec<(String, u16)>,
    sessions: Vec<(String, Arc<AtomicBool>)>,
}

/// Handle to the fake network. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<State>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_remote<T>(&self, address: &str, f: impl FnOnce(&mut Remote) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(state.remotes.entry(address.to_string()).or_default())
    }

    /// Commands containing `pattern` exit with `status` and print `stderr`.
    pub fn fail(&self, address: &str, pattern: &str, status: u32, stderr: &str) {
        self.script(address, pattern, status, "", stderr);
    }

    pub fn script(&self, address: &str, pattern: &str, status: u32, stdout: &str, stderr: &str) {
        self.with_remote(address, |remote| {
            remote.scripted.push(Scripted {
                pattern: pattern.to_string(),
                status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            })
        });
    }

    pub fn refuse(&self, address: &str, kind: ConnectivityKind) {
        self.with_remote(address, |remote| remote.refuse_connect = Some(kind));
    }

    pub fn drop_channels(&self, address: &str) {
        self.with_remote(address, |remote| remote.drop_channels = true);
    }

    pub fn put_file(&self, address: &str, path: &str, contents: &[u8]) {
        self.with_remote(address, |remote| {
            remote.files.insert(path.to_string(), contents.to_vec())
        });
    }

    pub fn file(&self, address: &str, path: &str) -> Option<Vec<u8>> {
        self.with_remote(address, |remote| remote.files.get(path).cloned())
    }

    pub fn commands(&self, address: &str) -> Vec<String> {
        self.with_remote(address, |remote| {
            remote.commands.iter().map(|(_, c)| c.clone()).collect()
        })
    }

    pub fn commands_as(&self, address: &str) -> Vec<(String, String)> {
        self.with_remote(address, |remote| remote.commands.clone())
    }

    /// Commands that are not run-once bookkeeping.
    pub fn work(&self, address: &str) -> Vec<String> {
        self.commands(address)
            .into_iter()
            .filter(|c| !c.contains("blower.json"))
            .collect()
    }

    pub fn queue_probes(&self, address: &str, probes: &[bool]) {
        self.with_remote(address, |remote| remote.probes.extend(probes.iter().copied()));
    }

    pub fn probe_count(&self, address: &str) -> usize {
        self.with_remote(address, |remote| remote.probe_count)
    }

    pub fn queue_tunnels(&self, address: &str, results: &[bool]) {
        self.with_remote(address, |remote| {
            remote.tunnel_results.extend(results.iter().copied())
        });
    }

    pub fn connects(&self) -> Vec<(String, String, bool)> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn tunnels(&self) -> Vec<(String, u16)> {
        self.state.lock().unwrap().tunnels.clone()
    }

    /// Simulate the remote end dropping every session to `address`.
    pub fn close_sessions(&self, address: &str) {
        let state = self.state.lock().unwrap();
        for (addr, closed) in &state.sessions {
            if addr == address {
                closed.store(true, Ordering::SeqCst);
            }
        }
    }

    pub fn connector(&self) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            network: self.clone(),
        })
    }

    pub fn prober(&self) -> Arc<MockProber> {
        Arc::new(MockProber {
            network: self.clone(),
        })
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine_with(test_config())
    }

    pub fn engine_with(&self, config: Config) -> Arc<Engine> {
        Arc::new(Engine::with_transport(config, self.connector(), self.prober()))
    }
}

pub fn test_config() -> Config {
    Config {
        reboot_poll_down_ms: 1,
        reboot_poll_up_ms: 1,
        ..Config::default()
    }
}

pub fn host(address: &str) -> Arc<Host> {
    Arc::new(Host::new(address, "deploy"))
}

pub fn group(addresses: &[&str]) -> HostGroup {
    HostGroup::new(addresses.iter().map(|address| host(address)))
}

pub struct MockConnector {
    network: MockNetwork,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &Host,
        user: &str,
        gateway: Option<Arc<dyn Session>>,
    ) -> Result<Arc<dyn Session>> {
        if let Some(gateway) = &gateway {
            gateway.open_tunnel(&host.address, host.port).await?;
        }

        let refused = self
            .network
            .with_remote(&host.address, |remote| remote.refuse_connect);
        if let Some(kind) = refused {
            return Err(Error::Connectivity {
                host: host.name.clone(),
                user: user.to_string(),
                kind,
                message: "refused by mock".to_string(),
            });
        }

        let closed = Arc::new(AtomicBool::new(false));
        let mut state = self.network.state.lock().unwrap();
        state
            .connects
            .push((host.address.clone(), user.to_string(), gateway.is_some()));
        state
            .sessions
            .push((host.address.clone(), closed.clone()));
        drop(state);

        Ok(Arc::new(MockSession {
            network: self.network.clone(),
            address: host.address.clone(),
            user: user.to_string(),
            closed,
        }))
    }
}

pub struct MockSession {
    network: MockNetwork,
    address: String,
    user: String,
    closed: Arc<AtomicBool>,
}

impl MockSession {
    fn lost(&self) -> Error {
        Error::Connectivity {
            host: self.address.clone(),
            user: self.user.clone(),
            kind: ConnectivityKind::Channel,
            message: "channel lost".to_string(),
        }
    }

    /// Interpret `command` against the fake filesystem.
    fn run(&self, remote: &mut Remote, command: &str) -> (u32, Vec<u8>, Vec<u8>) {
        if let Some(scripted) = remote
            .scripted
            .iter()
            .find(|s| command.contains(&s.pattern))
        {
            return (
                scripted.status,
                scripted.stdout.clone().into_bytes(),
                scripted.stderr.clone().into_bytes(),
            );
        }

        let words = shell_words::split(command).unwrap_or_default();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["echo", encoded, "|", "base64", "-d", redirect @ (">" | ">>"), path] => {
                match base64::engine::general_purpose::STANDARD.decode(encoded) {
                    Ok(data) => {
                        let file = remote.files.entry(path.to_string()).or_default();
                        if *redirect == ">" {
                            file.clear();
                        }
                        file.extend_from_slice(&data);
                        (0, Vec::new(), Vec::new())
                    }
                    Err(_) => (1, Vec::new(), b"base64: invalid input\n".to_vec()),
                }
            }
            [":", ">", path] => {
                remote.files.insert(path.to_string(), Vec::new());
                (0, Vec::new(), Vec::new())
            }
            ["test", "-e", path] => {
                let missing = !remote.files.contains_key(*path);
                (u32::from(missing), Vec::new(), Vec::new())
            }
            ["base64", "<", path] => match remote.files.get(*path) {
                Some(data) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                    (0, format!("{encoded}\n").into_bytes(), Vec::new())
                }
                None => (
                    1,
                    Vec::new(),
                    format!("sh: {path}: No such file or directory\n").into_bytes(),
                ),
            },
            ["echo", rest @ ..] => (0, format!("{}\n", rest.join(" ")).into_bytes(), Vec::new()),
            _ => (0, Vec::new(), Vec::new()),
        }
    }
}

#[async_trait]
impl Session for MockSession {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn exec(
        &self,
        command: &str,
        _pty: bool,
        output: UnboundedSender<CommandOutput>,
    ) -> Result<u32> {
        if self.is_closed() {
            return Err(self.lost());
        }

        let outcome = self.network.with_remote(&self.address, |remote| {
            remote
                .commands
                .push((self.user.clone(), command.to_string()));
            if remote.drop_channels {
                None
            } else {
                Some(self.run(remote, command))
            }
        });

        // a reboot takes the session down with it
        if command == "reboot" {
            self.closed.store(true, Ordering::SeqCst);
            return Err(self.lost());
        }

        let (status, stdout, stderr) = outcome.ok_or_else(|| self.lost())?;
        if !stdout.is_empty() {
            let _ = output.send(CommandOutput::StdOut(stdout));
        }
        if !stderr.is_empty() {
            let _ = output.send(CommandOutput::StdErr(stderr));
        }
        Ok(status)
    }

    async fn open_tunnel(&self, address: &str, port: u16) -> Result<Box<dyn TunnelStream>> {
        let open = self
            .network
            .with_remote(address, |remote| remote.tunnel_results.pop_front())
            .unwrap_or(true);
        self.network
            .state
            .lock()
            .unwrap()
            .tunnels
            .push((address.to_string(), port));
        if !open {
            return Err(Error::Connectivity {
                host: address.to_string(),
                user: self.user.clone(),
                kind: ConnectivityKind::Unreachable,
                message: "connect refused".to_string(),
            });
        }
        let (near, _far) = tokio::io::duplex(64);
        Ok(Box::new(near))
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Replays queued probe results per address; reachable once the queue is empty.
pub struct MockProber {
    network: MockNetwork,
}

#[async_trait]
impl Prober for MockProber {
    async fn is_reachable(&self, host: &Host) -> bool {
        self.network.with_remote(&host.address, |remote| {
            remote.probe_count += 1;
            remote.probes.pop_front().unwrap_or(true)
        })
    }
}
