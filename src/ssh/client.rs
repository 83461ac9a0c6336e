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

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::auth::{authenticate_connection, determine_auth_method};
use super::handler::ClientHandler;
use super::known_hosts::get_check_method;
use super::{CommandOutput, Connector, Session, TunnelStream};
use crate::config::Config;
use crate::error::{ConnectivityKind, Error, Result};
use crate::host::Host;
use crate::utils::expand_tilde;

const PTY_TERM: &str = "xterm";
const PTY_COLUMNS: u32 = 80;
const PTY_ROWS: u32 = 24;

/// Opens russh sessions according to the engine configuration.
pub struct SshConnector {
    config: Config,
    // serializes passphrase prompts across concurrent connects
    prompt_mutex: Mutex<()>,
}

impl SshConnector {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            prompt_mutex: Mutex::new(()),
        }
    }

    fn russh_config(&self) -> Arc<russh::client::Config> {
        Arc::new(russh::client::Config {
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        })
    }

    async fn handshake(
        &self,
        host: &Host,
        user: &str,
        gateway: Option<&Arc<dyn Session>>,
    ) -> Result<Handle<ClientHandler>> {
        let known_hosts = self.config.known_hosts.as_deref().map(expand_tilde);
        let handler = ClientHandler::new(
            host.address.clone(),
            host.port,
            get_check_method(self.config.strict_host_key_checking, known_hosts.as_deref()),
        );
        let timeout = self.config.connect_timeout();
        let config = self.russh_config();

        let attempt = async {
            match gateway {
                Some(gateway) => {
                    let stream: Box<dyn TunnelStream> =
                        gateway.open_tunnel(&host.address, host.port).await?;
                    russh::client::connect_stream(config, stream, handler)
                        .await
                        .map_err(|e| classify(host, user, e))
                }
                None => russh::client::connect(config, (host.address.as_str(), host.port), handler)
                    .await
                    .map_err(|e| classify(host, user, e)),
            }
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::connectivity(
                &host.name,
                user,
                ConnectivityKind::Timeout,
                format!(
                    "no handshake with {}:{} after {}s",
                    host.address,
                    host.port,
                    timeout.as_secs()
                ),
            )),
        }
    }
}

impl Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("config", &self.config)
            .finish()
    }
}

fn classify(host: &Host, user: &str, error: russh::Error) -> Error {
    let kind = match &error {
        russh::Error::UnknownKey | russh::Error::WrongServerSig => ConnectivityKind::HostKey,
        russh::Error::ConnectionTimeout | russh::Error::KeepaliveTimeout => {
            ConnectivityKind::Timeout
        }
        _ => ConnectivityKind::Unreachable,
    };
    Error::connectivity(&host.name, user, kind, error.to_string())
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &Host,
        user: &str,
        gateway: Option<Arc<dyn Session>>,
    ) -> Result<Arc<dyn Session>> {
        debug!(
            "Connecting to {}@{}:{}{}",
            user,
            host.address,
            host.port,
            if gateway.is_some() { " via gateway" } else { "" }
        );

        let mut handle = self.handshake(host, user, gateway.as_ref()).await?;

        let target = format!("{user}@{}", host.name);
        let method = determine_auth_method(
            &target,
            self.config.ssh_key.as_deref(),
            self.config.use_agent,
            &self.prompt_mutex,
        )
        .await
        .map_err(|e| {
            Error::connectivity(&host.name, user, ConnectivityKind::Authentication, e.to_string())
        })?;

        authenticate_connection(&mut handle, user, method)
            .await
            .map_err(|e| {
                Error::connectivity(
                    &host.name,
                    user,
                    ConnectivityKind::Authentication,
                    e.to_string(),
                )
            })?;

        debug!("Authenticated to {target}");
        Ok(Arc::new(SshSession {
            handle,
            host: host.name.clone(),
            user: user.to_string(),
            _gateway: gateway,
        }))
    }
}

/// An authenticated russh session.
pub struct SshSession {
    handle: Handle<ClientHandler>,
    host: String,
    user: String,
    // the tunnel this session rides on must outlive it
    _gateway: Option<Arc<dyn Session>>,
}

impl SshSession {
    fn channel_error(&self, message: impl Into<String>) -> Error {
        Error::connectivity(&self.host, &self.user, ConnectivityKind::Channel, message)
    }

    async fn open_exec_channel(&self, command: &str, pty: bool) -> Result<Channel<Msg>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.channel_error(format!("cannot open session channel: {e}")))?;

        if pty {
            channel
                .request_pty(true, PTY_TERM, PTY_COLUMNS, PTY_ROWS, 0, 0, &[])
                .await
                .map_err(|e| self.channel_error(format!("pty request refused: {e}")))?;
        }

        channel
            .exec(true, command)
            .await
            .map_err(|e| self.channel_error(format!("exec request refused: {e}")))?;
        Ok(channel)
    }
}

impl Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("host", &self.host)
            .field("user", &self.user)
            .finish()
    }
}

#[async_trait]
impl Session for SshSession {
    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn exec(
        &self,
        command: &str,
        pty: bool,
        output: UnboundedSender<CommandOutput>,
    ) -> Result<u32> {
        let mut channel = self.open_exec_channel(command, pty).await?;
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    // a closed receiver only means nobody is listening
                    let _ = output.send(CommandOutput::StdOut(data.to_vec()));
                }
                ChannelMsg::ExtendedData { ref data, ext } => {
                    if ext == 1 {
                        let _ = output.send(CommandOutput::StdErr(data.to_vec()));
                    }
                }
                // The exit status may arrive before the last data, so keep
                // draining until the channel closes.
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                other => trace!("{}: ignoring channel message {other:?}", self.host),
            }
        }

        exit_status.ok_or_else(|| self.channel_error("channel closed without an exit status"))
    }

    async fn open_tunnel(&self, address: &str, port: u16) -> Result<Box<dyn TunnelStream>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(address, port.into(), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                self.channel_error(format!("cannot open tunnel to {address}:{port}: {e}"))
            })?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| self.channel_error(format!("disconnect failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_host_key_rejection() {
        let host = Host::new("10.0.0.1", "deploy");
        let err = classify(&host, "deploy", russh::Error::UnknownKey);
        assert!(matches!(
            err,
            Error::Connectivity {
                kind: ConnectivityKind::HostKey,
                ..
            }
        ));
    }

    #[test]
    fn test_classify_io_error_as_unreachable() {
        let host = Host::new("10.0.0.1", "deploy");
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = classify(&host, "deploy", russh::Error::IO(io));
        assert!(matches!(
            err,
            Error::Connectivity {
                kind: ConnectivityKind::Unreachable,
                ..
            }
        ));
    }
}
