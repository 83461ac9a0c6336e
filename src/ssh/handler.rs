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

//! russh client handler: server key verification.

use russh::client::Handler;

use super::known_hosts::ServerCheckMethod;

#[derive(Debug, Clone)]
pub struct ClientHandler {
    hostname: String,
    port: u16,
    server_check: ServerCheckMethod,
}

impl ClientHandler {
    pub fn new(hostname: String, port: u16, server_check: ServerCheckMethod) -> Self {
        Self {
            hostname,
            port,
            server_check,
        }
    }
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.server_check {
            ServerCheckMethod::NoCheck => Ok(true),
            ServerCheckMethod::KnownHostsFile(known_hosts_path) => {
                match russh::keys::check_known_hosts_path(
                    &self.hostname,
                    self.port,
                    server_public_key,
                    known_hosts_path,
                ) {
                    Ok(known) => Ok(known),
                    Err(e) => {
                        tracing::warn!("Host key check for {} failed: {e}", self.hostname);
                        Ok(false)
                    }
                }
            }
            ServerCheckMethod::DefaultKnownHostsFile => {
                match russh::keys::check_known_hosts(&self.hostname, self.port, server_public_key)
                {
                    Ok(known) => Ok(known),
                    Err(e) => {
                        tracing::warn!("Host key check for {} failed: {e}", self.hostname);
                        Ok(false)
                    }
                }
            }
        }
    }
}
