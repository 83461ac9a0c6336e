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

//! File transfer: paths go through an external rsync, in-memory buffers are
//! written inline over the exec channel.

use base64::Engine as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, Instrument};

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::error::{Error, Result};
use crate::executor::{log_line, CommandExecutor, ShOptions, Stream};
use crate::host::Host;
use crate::ssh::CommandOutput;
use crate::utils::{shell_quote, LineBuffer};

/// Something to copy to a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Local file or directory, relative paths resolved against the base directory.
    Path(PathBuf),
    /// In-memory contents. The name is used when the destination is a directory.
    Bytes { name: Option<String>, data: Vec<u8> },
}

impl Source {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            name: None,
            data: data.into(),
        }
    }

    pub fn named(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes {
            name: Some(name.into()),
            data: data.into(),
        }
    }
}

impl From<&str> for Source {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for Source {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub user: Option<String>,
    /// Remove remote files absent from the source (`--delete`).
    pub delete: bool,
    /// Directory relative sources and the ignore file are looked up in.
    pub base_dir: Option<PathBuf>,
    pub quiet: bool,
}

/// Programs and file names used for external syncs.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub ssh_program: String,
    pub sync_program: String,
    pub ignore_file: String,
}

impl From<&Config> for SyncSettings {
    fn from(config: &Config) -> Self {
        Self {
            ssh_program: config.ssh_program.clone(),
            sync_program: config.sync_program.clone(),
            ignore_file: config.ignore_file.clone(),
        }
    }
}

/// A fully assembled external sync invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SyncCommand {
    /// Shell-quoted rendering, used in logs and errors.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| shell_quote(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where a source lands on the remote host.
///
/// A destination ending in `/` names a directory: file sources and named
/// buffers get their base name appended. Directory sources are passed through.
pub fn resolve_destination(source: &Source, destination: &str, is_dir: bool) -> Result<String> {
    if is_dir || !destination.ends_with('/') {
        return Ok(destination.to_string());
    }

    let name = match source {
        Source::Path(path) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidInput(format!("{} has no file name", path.display())))?,
        Source::Bytes { name: Some(name), .. } => name.clone(),
        Source::Bytes { name: None, .. } => {
            return Err(Error::InvalidInput(format!(
                "cannot copy unnamed contents into directory {destination}"
            )))
        }
    };
    Ok(format!("{destination}{name}"))
}

fn bracket(address: &str) -> String {
    if address.contains(':') {
        format!("[{address}]")
    } else {
        address.to_string()
    }
}

fn jump_spec(gateway: &Host) -> String {
    format!("{}@{}:{}", gateway.user, bracket(&gateway.address), gateway.port)
}

/// Assemble `rsync -e "<ssh> -p <port> [-J chain]" -r [...] <source> <user>@<address>:<target>`.
pub fn build_sync_command(
    settings: &SyncSettings,
    host: &Host,
    user: &str,
    source: &Path,
    target: &str,
    options: &CopyOptions,
) -> SyncCommand {
    let mut remote_shell = vec![
        settings.ssh_program.clone(),
        "-p".to_string(),
        host.port.to_string(),
    ];
    let chain = host.gateway_chain();
    if !chain.is_empty() {
        remote_shell.push("-J".to_string());
        remote_shell.push(
            chain
                .iter()
                .map(|gateway| jump_spec(gateway))
                .collect::<Vec<_>>()
                .join(","),
        );
    }

    let mut args = vec![
        "-e".to_string(),
        remote_shell
            .iter()
            .map(|part| shell_quote(part).into_owned())
            .collect::<Vec<_>>()
            .join(" "),
        "-r".to_string(),
    ];

    if let Some(base_dir) = &options.base_dir {
        let ignore = base_dir.join(&settings.ignore_file);
        if ignore.is_file() {
            args.push("--exclude-from".to_string());
            args.push(ignore.to_string_lossy().into_owned());
        }
    }
    if options.delete {
        args.push("--delete".to_string());
    }

    args.push(source.to_string_lossy().into_owned());
    args.push(format!("{user}@{}:{target}", bracket(&host.address)));

    SyncCommand {
        program: settings.sync_program.clone(),
        args,
    }
}

/// Raw bytes per inline write command. Encoded, a chunk stays at 64 KiB,
/// well under the 128 KiB limit Linux puts on a single exec argument.
pub const INLINE_CHUNK_BYTES: usize = 48 * 1024;

/// Shell commands writing `data` to `target` without a temporary file.
///
/// The first command truncates the target, the rest append to it.
pub fn inline_write_commands(data: &[u8], target: &str) -> Vec<String> {
    let target = shell_quote(target);
    if data.is_empty() {
        return vec![format!(": > {target}")];
    }

    data.chunks(INLINE_CHUNK_BYTES)
        .enumerate()
        .map(|(i, chunk)| {
            let encoded = base64::engine::general_purpose::STANDARD.encode(chunk);
            let redirect = if i == 0 { ">" } else { ">>" };
            format!("echo {encoded} | base64 -d {redirect} {target}")
        })
        .collect()
}

pub struct FileTransfer {
    connections: Arc<ConnectionManager>,
    executor: Arc<CommandExecutor>,
    settings: SyncSettings,
}

impl FileTransfer {
    pub fn new(
        connections: Arc<ConnectionManager>,
        executor: Arc<CommandExecutor>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            connections,
            executor,
            settings,
        }
    }

    /// Copy every source to `destination` on `host`, in order.
    pub async fn cp(
        &self,
        host: &Host,
        sources: &[Source],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<()> {
        let span = tracing::debug_span!("cp", host = %host.name);
        async {
            for source in sources {
                match source {
                    Source::Path(path) => self.sync_path(host, path, destination, options).await?,
                    Source::Bytes { data, .. } => {
                        let target = resolve_destination(source, destination, false)?;
                        self.write_inline(host, data, &target, options).await?;
                    }
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Write `data` to `destination` on `host`.
    pub async fn write(
        &self,
        host: &Host,
        data: &[u8],
        destination: &str,
        options: &CopyOptions,
    ) -> Result<()> {
        self.cp(host, &[Source::bytes(data)], destination, options)
            .await
    }

    async fn write_inline(
        &self,
        host: &Host,
        data: &[u8],
        target: &str,
        options: &CopyOptions,
    ) -> Result<()> {
        debug!("Writing {} bytes to {target}", data.len());
        let sh_options = ShOptions {
            user: options.user.clone(),
            pty: Some(false),
            quiet: true,
        };
        for command in inline_write_commands(data, target) {
            self.executor.sh(host, &command, &sh_options).await?;
        }
        Ok(())
    }

    async fn sync_path(
        &self,
        host: &Host,
        path: &Path,
        destination: &str,
        options: &CopyOptions,
    ) -> Result<()> {
        let local = match &options.base_dir {
            Some(base_dir) if path.is_relative() => base_dir.join(path),
            _ => path.to_path_buf(),
        };
        let is_dir = tokio::fs::metadata(&local)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        let source = Source::Path(local.clone());
        let target = resolve_destination(&source, destination, is_dir)?;
        let user = options.user.as_deref().unwrap_or(&host.user);
        let command = build_sync_command(&self.settings, host, user, &local, &target, options);
        let command_line = command.command_line();

        let _region = self.connections.lock(host, user).await;
        debug!("{command_line}");

        let spawned = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return Err(Error::TransferFailed {
                    host: host.name.clone(),
                    command: command_line,
                    status: None,
                    output: e.to_string(),
                })
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let pump_out = pump(child.stdout.take(), tx.clone(), CommandOutput::StdOut);
        let pump_err = pump(child.stderr.take(), tx, CommandOutput::StdErr);

        // stdout and stderr interleaved as they arrive
        let collect = async {
            let mut combined = Vec::new();
            let mut out_lines = LineBuffer::new();
            let mut err_lines = LineBuffer::new();
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    CommandOutput::StdOut(data) => {
                        for line in out_lines.push(&data) {
                            log_line(&host.name, Stream::Out, options.quiet, &line);
                        }
                        combined.extend_from_slice(&data);
                    }
                    CommandOutput::StdErr(data) => {
                        for line in err_lines.push(&data) {
                            log_line(&host.name, Stream::Err, options.quiet, &line);
                        }
                        combined.extend_from_slice(&data);
                    }
                }
            }
            if let Some(line) = out_lines.finish() {
                log_line(&host.name, Stream::Out, options.quiet, &line);
            }
            if let Some(line) = err_lines.finish() {
                log_line(&host.name, Stream::Err, options.quiet, &line);
            }
            combined
        };

        let (_, _, status, combined) = tokio::join!(pump_out, pump_err, child.wait(), collect);
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return Err(Error::TransferFailed {
                    host: host.name.clone(),
                    command: command_line,
                    status: None,
                    output: e.to_string(),
                })
            }
        };

        if !status.success() {
            return Err(Error::TransferFailed {
                host: host.name.clone(),
                command: command_line,
                status: status.code(),
                output: String::from_utf8_lossy(&combined).into_owned(),
            });
        }
        Ok(())
    }
}

/// Forward everything read from `reader` until EOF.
async fn pump<R>(
    reader: Option<R>,
    tx: mpsc::UnboundedSender<CommandOutput>,
    wrap: fn(Vec<u8>) -> CommandOutput,
) where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("sync output closed: {e}");
                break;
            }
        }
    }
}

impl std::fmt::Debug for FileTransfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransfer")
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings() -> SyncSettings {
        SyncSettings::from(&Config::default())
    }

    #[test]
    fn test_trailing_slash_appends_base_name() {
        let source = Source::path("conf/nginx.conf");
        assert_eq!(
            resolve_destination(&source, "/etc/nginx/", false).unwrap(),
            "/etc/nginx/nginx.conf"
        );
        assert_eq!(
            resolve_destination(&source, "/etc/nginx/site.conf", false).unwrap(),
            "/etc/nginx/site.conf"
        );
    }

    #[test]
    fn test_directory_source_keeps_destination() {
        let source = Source::path("static");
        assert_eq!(
            resolve_destination(&source, "/srv/www/", true).unwrap(),
            "/srv/www/"
        );
    }

    #[test]
    fn test_buffer_names() {
        let named = Source::named("motd", "hello");
        assert_eq!(resolve_destination(&named, "/etc/", false).unwrap(), "/etc/motd");

        let unnamed = Source::bytes("hello");
        assert!(matches!(
            resolve_destination(&unnamed, "/etc/", false),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(
            resolve_destination(&unnamed, "/etc/motd", false).unwrap(),
            "/etc/motd"
        );
    }

    #[test]
    fn test_sync_command_direct() {
        let host = Host::new("10.0.0.5", "deploy").with_port(2222);
        let command = build_sync_command(
            &settings(),
            &host,
            "deploy",
            Path::new("/tmp/app"),
            "/srv/app",
            &CopyOptions::default(),
        );
        assert_eq!(command.program, "rsync");
        assert_eq!(
            command.args,
            vec!["-e", "ssh -p 2222", "-r", "/tmp/app", "deploy@10.0.0.5:/srv/app"]
        );
    }

    #[test]
    fn test_sync_command_with_gateway_ignore_and_delete() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".blowignore"), "*.log\n").unwrap();

        let bastion = Arc::new(Host::new("bastion.example.com", "ops"));
        let host = Host::new("10.0.0.5", "deploy").with_via(bastion);
        let options = CopyOptions {
            delete: true,
            base_dir: Some(dir.path().to_path_buf()),
            ..CopyOptions::default()
        };

        let command = build_sync_command(
            &settings(),
            &host,
            "root",
            Path::new("/tmp/app"),
            "/srv/app",
            &options,
        );
        let ignore = dir.path().join(".blowignore").to_string_lossy().into_owned();
        assert_eq!(
            command.args,
            vec![
                "-e".to_string(),
                "ssh -p 22 -J 'ops@bastion.example.com:22'".to_string(),
                "-r".to_string(),
                "--exclude-from".to_string(),
                ignore,
                "--delete".to_string(),
                "/tmp/app".to_string(),
                "root@10.0.0.5:/srv/app".to_string(),
            ]
        );
    }

    #[test]
    fn test_ipv6_target_is_bracketed() {
        let host = Host::new("fe80::1", "deploy");
        let command = build_sync_command(
            &settings(),
            &host,
            "deploy",
            Path::new("a"),
            "/b",
            &CopyOptions::default(),
        );
        assert_eq!(command.args.last().unwrap(), "deploy@[fe80::1]:/b");
    }

    #[test]
    fn test_inline_write_command() {
        assert_eq!(
            inline_write_commands(b"hi\n", "/etc/my motd"),
            vec!["echo aGkK | base64 -d > '/etc/my motd'"]
        );
        assert_eq!(inline_write_commands(b"", "/etc/empty"), vec![": > /etc/empty"]);
    }

    #[test]
    fn test_large_inline_write_is_chunked() {
        let data = vec![b'x'; INLINE_CHUNK_BYTES * 2 + 1];
        let commands = inline_write_commands(&data, "/srv/blob");

        assert_eq!(commands.len(), 3);
        assert!(commands[0].ends_with("base64 -d > /srv/blob"));
        assert!(commands[1].ends_with("base64 -d >> /srv/blob"));
        assert!(commands[2].ends_with("base64 -d >> /srv/blob"));
        assert!(commands.iter().all(|c| c.len() < 128 * 1024));
    }
}
