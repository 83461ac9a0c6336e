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

//! Host key verification policy.

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::Error;

/// How a server's host key is verified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerCheckMethod {
    NoCheck,
    DefaultKnownHostsFile,
    KnownHostsFile(PathBuf),
}

/// `~/.ssh/known_hosts`, if a home directory can be determined.
pub fn get_default_known_hosts_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".ssh").join("known_hosts"))
}

/// Map a checking mode to the verification the handler performs.
///
/// `yes` never degrades: a missing known_hosts file means every key is
/// unknown and the handshake fails with a host key error.
pub fn get_check_method(
    strict_mode: StrictHostKeyChecking,
    known_hosts: Option<&Path>,
) -> ServerCheckMethod {
    match strict_mode {
        StrictHostKeyChecking::Yes => match known_hosts {
            Some(path) => ServerCheckMethod::KnownHostsFile(path.to_path_buf()),
            None => {
                if let Some(path) = get_default_known_hosts_path().filter(|p| !p.exists()) {
                    tracing::warn!(
                        "{} does not exist, all host keys will be rejected",
                        path.display()
                    );
                }
                ServerCheckMethod::DefaultKnownHostsFile
            }
        },
        StrictHostKeyChecking::No => ServerCheckMethod::NoCheck,
        // russh has no trust-on-first-use mode, so accept-new relaxes checking
        StrictHostKeyChecking::AcceptNew => {
            tracing::debug!("accept-new: host keys are not verified");
            ServerCheckMethod::NoCheck
        }
    }
}

/// Value of the `strict_host_key_checking` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrictHostKeyChecking {
    /// Reject unknown and changed keys.
    Yes,
    No,
    /// Accept keys not seen before.
    #[default]
    AcceptNew,
}

impl FromStr for StrictHostKeyChecking {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "yes" | "true" => Ok(Self::Yes),
            "no" | "false" => Ok(Self::No),
            "accept-new" => Ok(Self::AcceptNew),
            other => Err(Error::Config(format!(
                "unknown strict_host_key_checking value '{other}'"
            ))),
        }
    }
}
