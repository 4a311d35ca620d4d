//! Shared configuration tables.
//!
//! These tables are owned by the hosting process (they mirror what the
//! wider deployment's config service hands out); the relay and its
//! clients only consume them. The `ports` key set doubles as the internal
//! application allow-list, so classification picks up table changes on
//! the next lookup.

use serde::Deserialize;
use std::collections::BTreeMap;

/// The relay's own entry in the `ports` table.
pub const RELAY_APP: &str = "hydra";

/// Listen port when neither the CLI nor the `ports` table names one.
pub const DEFAULT_RELAY_PORT: u16 = 1234;

/// Configuration consumed by the relay server and the client resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayTables {
    /// Internal application name → port. The key set is the AppIdentity
    /// allow-list.
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
    /// External domains allowed to connect.
    #[serde(default)]
    pub allowed_ssl_domains: Vec<String>,
    /// Vhost name → port, used to build `<vhost>.<hostname>.local`
    /// addresses.
    #[serde(default)]
    pub vhosts: BTreeMap<String, u16>,
    /// The machine's local hostname (mDNS base name).
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for RelayTables {
    fn default() -> Self {
        Self {
            ports: BTreeMap::new(),
            allowed_ssl_domains: Vec::new(),
            vhosts: BTreeMap::new(),
            hostname: default_hostname(),
        }
    }
}

impl RelayTables {
    /// The port the relay itself listens on, if the table names one.
    pub fn relay_port(&self) -> Option<u16> {
        self.ports.get(RELAY_APP).copied()
    }

    /// Find the vhost name mapped to `port`, if any.
    pub fn vhost_for_port(&self, port: u16) -> Option<&str> {
        self.vhosts
            .iter()
            .find(|(_, p)| **p == port)
            .map(|(name, _)| name.as_str())
    }
}

pub(crate) fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> RelayTables {
        RelayTables {
            ports: BTreeMap::from([
                ("cerberus".to_string(), 1232),
                ("medusa".to_string(), 1233),
                ("hydra".to_string(), 1234),
            ]),
            allowed_ssl_domains: vec![],
            vhosts: BTreeMap::from([("dashboard".to_string(), 1234)]),
            hostname: "studio110".to_string(),
        }
    }

    #[test]
    fn relay_port_from_table() {
        assert_eq!(tables().relay_port(), Some(1234));
        assert_eq!(RelayTables::default().relay_port(), None);
    }

    #[test]
    fn vhost_lookup_by_port() {
        let t = tables();
        assert_eq!(t.vhost_for_port(1234), Some("dashboard"));
        assert_eq!(t.vhost_for_port(9999), None);
    }
}
