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

//! Engine configuration and loading.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::error::{Error, Result};
use crate::ssh::known_hosts::StrictHostKeyChecking;
use crate::utils::expand_tilde;

/// Engine-wide settings.
///
/// Every field has a default, so an empty YAML document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SSH port used for hosts parsed without an explicit port.
    pub port: u16,
    /// Bound on a single connect attempt, in seconds.
    pub connect_timeout: u64,
    /// Bound on a reachability probe, in seconds.
    pub ping_timeout: u64,
    pub reboot_poll_down_ms: u64,
    pub reboot_poll_up_ms: u64,
    /// Overall ceiling on a reboot wait. `None` waits forever.
    pub reboot_timeout: Option<u64>,
    pub reboot_command: String,
    /// Remote path of the run-once record.
    pub once_store: String,
    pub request_pty: bool,
    pub ssh_key: Option<PathBuf>,
    pub use_agent: bool,
    pub strict_host_key_checking: StrictHostKeyChecking,
    /// known_hosts file checked in strict mode; `~/.ssh/known_hosts` when unset.
    pub known_hosts: Option<PathBuf>,
    pub ssh_program: String,
    pub sync_program: String,
    /// Exclude-list file looked up in the transfer base directory.
    pub ignore_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: crate::host::DEFAULT_SSH_PORT,
            connect_timeout: 5,
            ping_timeout: 2,
            reboot_poll_down_ms: 1000,
            reboot_poll_up_ms: 2000,
            reboot_timeout: None,
            reboot_command: "reboot".to_string(),
            once_store: "/var/cache/blower.json".to_string(),
            request_pty: false,
            ssh_key: None,
            use_agent: true,
            strict_host_key_checking: StrictHostKeyChecking::AcceptNew,
            known_hosts: None,
            ssh_program: "ssh".to_string(),
            sync_program: "rsync".to_string(),
            ignore_file: ".blowignore".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let expanded_path = expand_tilde(path);

        if !expanded_path.exists() {
            tracing::debug!(
                "Config file not found at {:?}, using defaults",
                expanded_path
            );
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&expanded_path).await.map_err(|e| {
            Error::Config(format!(
                "failed to read configuration file at {}: {e}",
                expanded_path.display()
            ))
        })?;

        Self::parse(&content).map_err(|e| match e {
            Error::Config(message) => {
                Error::Config(format!("{}: {message}", expanded_path.display()))
            }
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| Error::Config(format!("invalid YAML: {e}")))
    }

    /// Load from the per-user default location.
    pub async fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path).await,
            None => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "blower").map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout.max(1))
    }

    pub fn reboot_poll_down(&self) -> Duration {
        Duration::from_millis(self.reboot_poll_down_ms)
    }

    pub fn reboot_poll_up(&self) -> Duration {
        Duration::from_millis(self.reboot_poll_up_ms)
    }

    pub fn reboot_timeout(&self) -> Option<Duration> {
        self.reboot_timeout.map(Duration::from_secs)
    }
}
