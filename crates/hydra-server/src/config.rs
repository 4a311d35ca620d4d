//! Relay configuration: TOML file + CLI overrides.

use hydra_core::config::{DEFAULT_RELAY_PORT, RELAY_APP};
use hydra_core::{HydraResult, RelayTables};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
///
/// The tables live at the top level so the file reads the same way the
/// deployment-wide config does:
///
/// ```toml
/// allowed_ssl_domains = ["acme.studio110.local"]
/// hostname = "studio110"
///
/// [ports]
/// cerberus = 1232
/// medusa = 1233
/// hydra = 1234
///
/// [vhosts]
/// dashboard = 1233
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(flatten)]
    pub tables: RelayTables,
}

/// Resolved relay configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port the relay listens on.
    pub port: u16,
    /// Shared allow-list / address tables.
    pub tables: RelayTables,
}

impl RelayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// The listen port is, in order: the `--port` flag, the relay's own
    /// entry in the `ports` table, or the built-in default.
    pub fn load(config_path: Option<&Path>, cli_port: Option<u16>) -> HydraResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    hydra_core::HydraError::Config(format!("config parse error: {e}"))
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let mut tables = file_config.tables;
        let port = cli_port
            .or_else(|| tables.relay_port())
            .unwrap_or(DEFAULT_RELAY_PORT);

        // Keep the relay's own entry consistent with the resolved port so
        // classification and client-side resolution agree with reality.
        tables.ports.insert(RELAY_APP.to_string(), port);

        Ok(Self { port, tables })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let cfg = RelayConfig::load(None, None).unwrap();
        assert_eq!(cfg.port, 1234);
        assert_eq!(cfg.tables.relay_port(), Some(1234));
    }

    #[test]
    fn cli_port_wins() {
        let cfg = RelayConfig::load(None, Some(4321)).unwrap();
        assert_eq!(cfg.port, 4321);
        assert_eq!(cfg.tables.relay_port(), Some(4321));
    }

    #[test]
    fn tables_parse_from_toml() {
        let raw = r#"
            allowed_ssl_domains = ["acme.studio110.local"]
            hostname = "studio110"

            [ports]
            cerberus = 1232
            medusa = 1233
            hydra = 1234

            [vhosts]
            dashboard = 1233
        "#;
        let file: ConfigFile = toml::from_str(raw).unwrap();
        assert_eq!(file.tables.relay_port(), Some(1234));
        assert_eq!(file.tables.hostname, "studio110");
        assert_eq!(file.tables.vhost_for_port(1233), Some("dashboard"));
        assert_eq!(
            file.tables.allowed_ssl_domains,
            vec!["acme.studio110.local".to_string()]
        );
    }
}
