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

//! Remote command execution over cached sessions.

use base64::Engine as _;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Instrument};

use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::ssh::CommandOutput;
use crate::utils::{shell_quote, LineBuffer};

/// Output of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Both streams interleaved in arrival order.
    pub combined: Vec<u8>,
    pub exit_status: u32,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn combined_text(&self) -> String {
        String::from_utf8_lossy(&self.combined).into_owned()
    }
}

/// Per-call execution settings.
#[derive(Debug, Clone, Default)]
pub struct ShOptions {
    /// Acting user; the host's default user when unset.
    pub user: Option<String>,
    /// Request a pseudo-terminal; the engine default when unset.
    pub pty: Option<bool>,
    /// Log output lines at debug instead of info/warn.
    pub quiet: bool,
}

impl ShOptions {
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn as_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn effective_user<'a>(&'a self, host: &'a Host) -> &'a str {
        self.user.as_deref().unwrap_or(&host.user)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Stream {
    Out,
    Err,
}

pub(crate) fn log_line(host: &str, stream: Stream, quiet: bool, line: &str) {
    match (stream, quiet) {
        (_, true) => debug!("{host}: {line}"),
        (Stream::Out, false) => info!("{host}: {line}"),
        (Stream::Err, false) => warn!("{host}: {line}"),
    }
}

pub struct CommandExecutor {
    connections: Arc<ConnectionManager>,
    request_pty: bool,
}

impl CommandExecutor {
    pub fn new(connections: Arc<ConnectionManager>, request_pty: bool) -> Self {
        Self {
            connections,
            request_pty,
        }
    }

    /// Run `command` verbatim on `host` and wait for it to finish.
    ///
    /// Output lines are logged as they arrive. A nonzero exit status is an
    /// [`Error::CommandFailed`] carrying the combined output.
    pub async fn sh(
        &self,
        host: &Host,
        command: &str,
        options: &ShOptions,
    ) -> Result<ExecutionResult> {
        let user = options.effective_user(host);
        let span = tracing::debug_span!("sh", host = %host.name, user = %user);

        async {
            let connection = self.connections.get(host, user).await?;
            debug!("$ {command}");

            let pty = options.pty.unwrap_or(self.request_pty);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let exec = connection.session().exec(command, pty, tx);

            let collect = async {
                let mut result = ExecutionResult::default();
                let mut out_lines = LineBuffer::new();
                let mut err_lines = LineBuffer::new();

                while let Some(chunk) = rx.recv().await {
                    match chunk {
                        CommandOutput::StdOut(data) => {
                            for line in out_lines.push(&data) {
                                log_line(&host.name, Stream::Out, options.quiet, &line);
                            }
                            result.stdout.extend_from_slice(&data);
                            result.combined.extend_from_slice(&data);
                        }
                        CommandOutput::StdErr(data) => {
                            for line in err_lines.push(&data) {
                                log_line(&host.name, Stream::Err, options.quiet, &line);
                            }
                            result.stderr.extend_from_slice(&data);
                            result.combined.extend_from_slice(&data);
                        }
                    }
                }

                if let Some(line) = out_lines.finish() {
                    log_line(&host.name, Stream::Out, options.quiet, &line);
                }
                if let Some(line) = err_lines.finish() {
                    log_line(&host.name, Stream::Err, options.quiet, &line);
                }
                result
            };

            let (status, mut result) = tokio::join!(exec, collect);
            drop(connection);

            result.exit_status = status?;
            if !result.is_success() {
                return Err(Error::CommandFailed {
                    host: host.name.clone(),
                    command: command.to_string(),
                    status: result.exit_status,
                    output: result.combined_text(),
                });
            }
            Ok(result)
        }
        .instrument(span)
        .await
    }

    /// Like [`sh`](Self::sh), but a nonzero exit status is `Ok(false)`.
    ///
    /// Connectivity failures still propagate.
    pub async fn sh_ok(&self, host: &Host, command: &str, options: &ShOptions) -> Result<bool> {
        match self.sh(host, command, options).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_command_failed() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetch the contents of a remote file.
    pub async fn read(&self, host: &Host, path: &str, options: &ShOptions) -> Result<Vec<u8>> {
        let command = format!("base64 < {}", shell_quote(path));
        let options = ShOptions {
            quiet: true,
            ..options.clone()
        };
        let result = self.sh(host, &command, &options).await?;
        decode_base64(&result.stdout).map_err(|message| Error::Decode {
            host: host.name.clone(),
            path: path.to_string(),
            message,
        })
    }
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("request_pty", &self.request_pty)
            .finish()
    }
}

/// Decode `base64` tool output, which wraps lines.
fn decode_base64(encoded: &[u8]) -> std::result::Result<Vec<u8>, String> {
    let compact: Vec<u8> = encoded
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact)
        .map_err(|e| e.to_string())
}
