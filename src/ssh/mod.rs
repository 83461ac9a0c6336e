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

//! Transport seam between the engine and the SSH protocol.
//!
//! The engine only ever talks to [`Connector`] and [`Session`]. The
//! production implementation lives in [`client`] and is built on russh;
//! tests substitute an in-memory transport.

pub mod auth;
pub mod client;
pub mod handler;
pub mod known_hosts;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::host::Host;

pub use client::{SshConnector, SshSession};

/// A chunk of output delivered by an exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    StdOut(Vec<u8>),
    StdErr(Vec<u8>),
}

/// Bidirectional byte stream carried by a `direct-tcpip` channel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A live authenticated session bound to one (host, user) pair.
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether the remote end has dropped the session.
    fn is_closed(&self) -> bool;

    /// Run `command` verbatim on a fresh channel, streaming its output into
    /// `output` and returning the exit status once the channel completes.
    async fn exec(
        &self,
        command: &str,
        pty: bool,
        output: UnboundedSender<CommandOutput>,
    ) -> Result<u32>;

    /// Open a `direct-tcpip` channel to `address:port` as seen from the
    /// remote end.
    async fn open_tunnel(&self, address: &str, port: u16) -> Result<Box<dyn TunnelStream>>;

    async fn disconnect(&self) -> Result<()>;
}

/// Opens sessions, directly or tunneled through a gateway's session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &Host,
        user: &str,
        gateway: Option<Arc<dyn Session>>,
    ) -> Result<Arc<dyn Session>>;
}
