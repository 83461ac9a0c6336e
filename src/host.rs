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

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// A remote machine addressed for command execution and file transfer.
#[derive(Debug)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Acting user when no override is in effect.
    pub user: String,
    /// Gateway whose live session tunnels every connection to this host.
    pub via: Option<Arc<Host>>,
    data: RwLock<HashMap<String, Value>>,
}

/// Identity of a connection: one session per (address, port, user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub address: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.address, self.port)
    }
}

impl Host {
    pub fn new(address: impl Into<String>, user: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            name: address.clone(),
            address,
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            via: None,
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Parse `[user@]address[:port]`, falling back to `default_user` and
    /// `default_port`. The entry as written becomes the display name.
    pub fn parse(spec: &str, default_user: &str, default_port: u16) -> Result<Self> {
        let spec = spec.trim();
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => (user, rest),
            None => (default_user, spec),
        };

        // Bracketed IPv6 literals keep their colons
        let (address, port) = if let Some(inner) = rest.strip_prefix('[') {
            let (address, tail) = inner
                .split_once(']')
                .ok_or_else(|| Error::InvalidInput(format!("unclosed bracket in '{spec}'")))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port, spec)?,
                None => default_port,
            };
            (address, port)
        } else if let Some((address, port)) = rest.rsplit_once(':') {
            (address, parse_port(port, spec)?)
        } else {
            (rest, default_port)
        };

        if address.is_empty() {
            return Err(Error::InvalidInput(format!("missing address in '{spec}'")));
        }
        if user.is_empty() {
            return Err(Error::InvalidInput(format!("empty user in '{spec}'")));
        }

        Ok(Self::new(address, user).with_port(port).with_name(spec))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_via(mut self, gateway: Arc<Host>) -> Self {
        self.via = Some(gateway);
        self
    }

    pub fn key_for(&self, user: &str) -> ConnectionKey {
        ConnectionKey {
            address: self.address.clone(),
            port: self.port,
            user: user.to_string(),
        }
    }

    /// Gateways from the outermost hop to the one adjacent to this host.
    pub fn gateway_chain(&self) -> Vec<Arc<Host>> {
        let mut chain = Vec::new();
        let mut current = self.via.clone();
        while let Some(gateway) = current {
            // Bounded: a loop is rejected by the connection manager anyway
            if chain.len() > 16 {
                break;
            }
            current = gateway.via.clone();
            chain.push(gateway);
        }
        chain.reverse();
        chain
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .ok()
            .and_then(|data| data.get(key).cloned())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        if let Ok(mut data) = self.data.write() {
            data.insert(key.into(), value.into());
        }
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.write().ok().and_then(|mut data| data.remove(key))
    }
}

fn parse_port(port: &str, spec: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::InvalidInput(format!("invalid port number in '{spec}'")))
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_only() {
        let host = Host::parse("example.com", "root", 22).unwrap();
        assert_eq!(host.address, "example.com");
        assert_eq!(host.name, "example.com");
        assert_eq!(host.port, 22);
        assert_eq!(host.user, "root");
    }

    #[test]
    fn test_parse_full_format() {
        let host = Host::parse("admin@example.com:2222", "root", 22).unwrap();
        assert_eq!(host.name, "admin@example.com:2222");
        assert_eq!(host.user, "admin");
        assert_eq!(host.address, "example.com");
        assert_eq!(host.port, 2222);
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let host = Host::parse("deploy@[fe80::1]:2200", "root", 22).unwrap();
        assert_eq!(host.address, "fe80::1");
        assert_eq!(host.port, 2200);
    }

    #[test]
    fn test_parse_default_port() {
        assert_eq!(Host::parse("db", "root", 2222).unwrap().port, 2222);
        assert_eq!(Host::parse("db:22", "root", 2222).unwrap().port, 22);
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert!(Host::parse("example.com:http", "root", 22).is_err());
        assert!(Host::parse("@example.com", "root", 22).is_err());
    }

    #[test]
    fn test_key_for_distinguishes_users() {
        let host = Host::new("db", "root");
        assert_ne!(host.key_for("root"), host.key_for("postgres"));
        assert_eq!(host.key_for("root").to_string(), "root@db:22");
    }

    #[test]
    fn test_gateway_chain_order() {
        let outer = Arc::new(Host::new("bastion", "jump"));
        let inner = Arc::new(Host::new("relay", "jump").with_via(outer));
        let target = Host::new("db", "root").with_via(inner);

        let chain: Vec<_> = target
            .gateway_chain()
            .iter()
            .map(|h| h.address.clone())
            .collect();
        assert_eq!(chain, vec!["bastion", "relay"]);
    }

    #[test]
    fn test_data_store() {
        let host = Host::new("web1", "root");
        assert!(host.get("role").is_none());
        host.set("role", "frontend");
        assert_eq!(host.get("role"), Some(Value::from("frontend")));
        assert_eq!(host.remove("role"), Some(Value::from("frontend")));
        assert!(host.get("role").is_none());
    }
}
