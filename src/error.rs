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

//! Error types for the remote execution engine.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Why a host could not be reached or used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectivityKind {
    #[error("connection timed out")]
    Timeout,
    #[error("host unreachable")]
    Unreachable,
    #[error("authentication failed")]
    Authentication,
    #[error("host key verification failed")]
    HostKey,
    #[error("channel failure")]
    Channel,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The host could not be connected to, authenticated against, or the
    /// session dropped mid-operation.
    #[error("{host} (as {user}): {kind}: {message}")]
    Connectivity {
        host: String,
        user: String,
        kind: ConnectivityKind,
        message: String,
    },

    /// A remote command exited with a nonzero status.
    #[error("{host}: `{command}` exited with status {status}\n{output}")]
    CommandFailed {
        host: String,
        command: String,
        status: u32,
        output: String,
    },

    #[error("task not found: {name}")]
    TaskNotFound { name: String, searched: Vec<PathBuf> },

    /// Every host of the active set has been pruned (or it was empty to begin with).
    #[error("no hosts remaining")]
    NoHostsRemaining,

    /// The external sync process exited unsuccessfully.
    #[error("{host}: `{command}` failed (exit status {status:?})\n{output}")]
    TransferFailed {
        host: String,
        command: String,
        status: Option<i32>,
        output: String,
    },

    #[error("{host} did not come back within {waited:?}")]
    RebootTimeout { host: String, waited: Duration },

    #[error("gateway chain for {host} loops back on itself")]
    GatewayLoop { host: String },

    #[error("{host}: cannot decode contents of {path}: {message}")]
    Decode {
        host: String,
        path: String,
        message: String,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn connectivity(
        host: impl Into<String>,
        user: impl Into<String>,
        kind: ConnectivityKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Connectivity {
            host: host.into(),
            user: user.into(),
            kind,
            message: message.into(),
        }
    }

    /// Whether this error means the remote end went away rather than
    /// refusing the work.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    pub fn is_command_failed(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }
}
