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

//! Public-key authentication: agent identities first, then key files.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::handler::ClientHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    PrivateKeyFile {
        key_file_path: PathBuf,
        key_pass: Option<Zeroizing<String>>,
    },
    #[cfg(not(target_os = "windows"))]
    Agent,
}

impl AuthMethod {
    pub fn with_key_file<T: AsRef<Path>>(key_file_path: T, passphrase: Option<&str>) -> Self {
        Self::PrivateKeyFile {
            key_file_path: key_file_path.as_ref().to_path_buf(),
            key_pass: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }
}

/// Check if the SSH agent has any loaded identities.
///
/// Communication failures count as "no identities" so key files still get a
/// chance.
#[cfg(not(target_os = "windows"))]
async fn agent_has_identities() -> bool {
    use russh::keys::agent::client::AgentClient;

    match AgentClient::connect_env().await {
        Ok(mut agent) => match agent.request_identities().await {
            Ok(identities) => {
                debug!("SSH agent has {} loaded identities", identities.len());
                !identities.is_empty()
            }
            Err(e) => {
                warn!("Failed to request identities from SSH agent: {e}");
                false
            }
        },
        Err(e) => {
            warn!("Failed to connect to SSH agent: {e}");
            false
        }
    }
}

fn default_key_files() -> Vec<PathBuf> {
    let Some(dirs) = directories::BaseDirs::new() else {
        return Vec::new();
    };
    let ssh_dir = dirs.home_dir().join(".ssh");
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}

async fn key_file_method(
    key_path: &Path,
    target: &str,
    prompt_mutex: &Mutex<()>,
) -> Result<AuthMethod> {
    let key_contents = Zeroizing::new(
        tokio::fs::read_to_string(key_path)
            .await
            .with_context(|| format!("Failed to read SSH key file: {key_path:?}"))?,
    );

    let passphrase = if key_contents.contains("ENCRYPTED") {
        // one prompt at a time when many hosts connect concurrently
        let _guard = prompt_mutex.lock().await;
        let prompt = format!("Enter passphrase for key {key_path:?} ({target}): ");
        Some(Zeroizing::new(
            rpassword::prompt_password(prompt).with_context(|| "Failed to read passphrase")?,
        ))
    } else {
        None
    };

    Ok(AuthMethod::with_key_file(
        key_path,
        passphrase.as_ref().map(|p| p.as_str()),
    ))
}

/// Pick the authentication method for `target` (used only in prompts).
///
/// Order: agent with identities (when enabled), the configured key, then the
/// first default key file that exists.
pub async fn determine_auth_method(
    target: &str,
    key_path: Option<&Path>,
    use_agent: bool,
    prompt_mutex: &Mutex<()>,
) -> Result<AuthMethod> {
    #[cfg(not(target_os = "windows"))]
    if use_agent && std::env::var("SSH_AUTH_SOCK").is_ok() && agent_has_identities().await {
        return Ok(AuthMethod::Agent);
    }

    if let Some(key_path) = key_path {
        return key_file_method(key_path, target, prompt_mutex).await;
    }

    for default_key in default_key_files() {
        if default_key.exists() {
            return key_file_method(&default_key, target, prompt_mutex).await;
        }
    }

    anyhow::bail!("No authentication method available for {target}")
}

/// Authenticate an established handshake as `username`.
pub async fn authenticate_connection(
    handle: &mut russh::client::Handle<ClientHandler>,
    username: &str,
    auth_method: AuthMethod,
) -> Result<()> {
    match auth_method {
        AuthMethod::PrivateKeyFile {
            key_file_path,
            key_pass,
        } => {
            let private_key =
                russh::keys::load_secret_key(&key_file_path, key_pass.as_ref().map(|p| p.as_str()))
                    .map_err(|e| anyhow::anyhow!("Failed to load private key from file: {e}"))?;

            let auth_result = handle
                .authenticate_publickey(
                    username,
                    russh::keys::PrivateKeyWithHashAlg::new(
                        Arc::new(private_key),
                        handle.best_supported_rsa_hash().await?.flatten(),
                    ),
                )
                .await
                .map_err(|e| anyhow::anyhow!("Private key authentication failed: {e}"))?;

            if !auth_result.success() {
                anyhow::bail!("Private key authentication rejected by server");
            }
        }

        #[cfg(not(target_os = "windows"))]
        AuthMethod::Agent => {
            let mut agent = russh::keys::agent::client::AgentClient::connect_env()
                .await
                .map_err(|_| anyhow::anyhow!("Failed to connect to SSH agent"))?;

            let identities = agent
                .request_identities()
                .await
                .map_err(|_| anyhow::anyhow!("Failed to request identities from SSH agent"))?;

            let mut auth_success = false;
            for identity in identities {
                let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
                let result = handle
                    .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
                    .await;

                if let Ok(auth_result) = result {
                    if auth_result.success() {
                        auth_success = true;
                        break;
                    }
                }
            }

            if !auth_success {
                anyhow::bail!("SSH agent authentication rejected by server");
            }
        }
    }

    Ok(())
}
