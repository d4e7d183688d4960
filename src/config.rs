//! Client configuration, loaded from a TOML file.
//!
//! Lookup order: `$RELAYCTL_CONFIG`, then `config.toml` in the platform
//! config directory. A missing file yields the defaults; every section and
//! key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "RELAYCTL_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where `servers.json` and `subscriptions.json` live. Defaults to the
    /// platform data directory.
    pub data_dir: Option<PathBuf>,
    pub ping: PingConfig,
    pub subscription: SubscriptionConfig,
    pub connection: ConnectionConfig,
    pub notifications: NotificationConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub timeout_ms: u64,
    /// Probes in flight during a sweep.
    pub concurrency: usize,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Overrides the default `relayctl/<version>` user agent.
    pub user_agent: Option<String>,
    /// 0 disables the background refresh loop.
    pub auto_update_interval_secs: u64,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: None,
            auto_update_interval_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connect_timeout_secs: u64,
    pub usage_poll_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            usage_poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub max_entries: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { max_entries: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `relayctl=debug`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "relayctl")
}

impl Config {
    /// Load from `$RELAYCTL_CONFIG` or the default location.
    pub fn load() -> anyhow::Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load_from(Path::new(&path)),
            None => match Self::default_path() {
                Some(path) => Self::load_from(&path),
                None => Ok(Self::default()),
            },
        }
    }

    /// Parse and validate `path`. A missing file is not an error.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {} as TOML", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|d| d.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping.timeout_ms == 0 {
            bail!("'ping.timeout_ms' must be greater than 0");
        }
        if self.ping.concurrency == 0 {
            bail!("'ping.concurrency' must be greater than 0");
        }
        if self.subscription.fetch_timeout_secs == 0 {
            bail!("'subscription.fetch_timeout_secs' must be greater than 0");
        }
        if self.subscription.connect_timeout_secs == 0 {
            bail!("'subscription.connect_timeout_secs' must be greater than 0");
        }
        if self.connection.connect_timeout_secs == 0 {
            bail!("'connection.connect_timeout_secs' must be greater than 0");
        }
        if self.connection.usage_poll_interval_ms == 0 {
            bail!("'connection.usage_poll_interval_ms' must be greater than 0");
        }
        if self.notifications.max_entries == 0 {
            bail!("'notifications.max_entries' must be greater than 0");
        }
        if self.log.level.trim().is_empty() {
            bail!("'log.level' must not be empty");
        }
        Ok(())
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        project_dirs()
            .map(|d| d.data_dir().to_path_buf())
            .context("Could not determine a data directory; set 'data_dir' in the config")
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping.timeout_ms)
    }

    pub fn auto_update_interval(&self) -> Option<Duration> {
        match self.subscription.auto_update_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn usage_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connection.usage_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(content: &str) -> (PathBuf, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, content).expect("Failed to write config");
        (path, dir)
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.ping.concurrency, 16);
        assert_eq!(config.auto_update_interval(), Some(Duration::from_secs(3_600)));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let (path, _dir) = write_config(
            r#"
            data_dir = "/var/lib/relayctl"

            [ping]
            timeout_ms = 1500

            [subscription]
            user_agent = "custom/1.0"
            auto_update_interval_secs = 0
            "#,
        );
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.data_dir.as_deref(), Some(Path::new("/var/lib/relayctl")));
        assert_eq!(config.ping_timeout(), Duration::from_millis(1500));
        assert_eq!(config.ping.concurrency, 16);
        assert_eq!(config.subscription.user_agent.as_deref(), Some("custom/1.0"));
        assert_eq!(config.subscription.fetch_timeout_secs, 30);
        assert_eq!(config.auto_update_interval(), None);
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn rejects_zero_values() {
        let (path, _dir) = write_config("[ping]\nconcurrency = 0\n");
        let err = Config::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("ping.concurrency"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let (path, _dir) = write_config("[ping\ntimeout_ms = 1");
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("TOML"));
    }

    #[test]
    fn explicit_data_dir_wins() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/relay")),
            ..Config::default()
        };
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/relay"));
    }
}
