//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use relay_core::{RelayError, RelayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// `[store]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret shared with the credential service.
    /// Absent means an ephemeral secret is generated at startup.
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            token_secret: None,
            session_ttl: default_session_ttl(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_db_path() -> String {
    "~/.ratchet-relay/relay.db".to_string()
}
fn default_session_ttl() -> u64 {
    86400
}

/// Resolved server configuration (paths expanded, CLI overrides
/// applied, secret decoded).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub token_secret: Option<Vec<u8>>,
    pub session_ttl: u64,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_db: Option<&str>,
        cli_token_secret: Option<&str>,
        cli_session_ttl: Option<u64>,
    ) -> RelayResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| RelayError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let bind = cli_bind
            .map(|s| s.to_string())
            .unwrap_or(file_config.server.bind);
        let port = cli_port.unwrap_or(file_config.server.port);
        let db_str = cli_db
            .map(|s| s.to_string())
            .unwrap_or(file_config.store.path);
        let session_ttl = cli_session_ttl.unwrap_or(file_config.auth.session_ttl);

        let secret_hex = cli_token_secret
            .map(|s| s.to_string())
            .or(file_config.auth.token_secret);
        let token_secret = match secret_hex {
            Some(raw) => Some(
                hex::decode(raw.trim())
                    .map_err(|e| RelayError::Other(format!("invalid token secret: {e}")))?,
            ),
            None => None,
        };

        Ok(Self {
            bind,
            port,
            db_path: expand_tilde_str(&db_str),
            token_secret,
            session_ttl,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = ServerConfig::load(None, None, None, None, None, None).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.session_ttl, 86400);
        assert!(config.token_secret.is_none());
    }

    #[test]
    fn file_values_are_overridden_by_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[server]\nbind = \"127.0.0.1\"\nport = 9000\n\n[auth]\ntoken_secret = \"00ff\"\nsession_ttl = 60\n"
        )
        .unwrap();

        let config =
            ServerConfig::load(Some(&path), None, Some(9001), None, None, None).unwrap();
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.port, 9001);
        assert_eq!(config.session_ttl, 60);
        assert_eq!(config.token_secret, Some(vec![0x00, 0xff]));
    }

    #[test]
    fn bad_secret_hex_is_an_error() {
        let config = ServerConfig::load(None, None, None, None, Some("not-hex"), None);
        assert!(config.is_err());
    }
}
