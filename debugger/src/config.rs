//! Controller configuration.
//!
//! Loaded from a TOML file under the platform config directory; every field
//! has a default so a missing or partial file works.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use transport::params::SetFilter;
use transport::DEFAULT_CONTROL_PORT;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Address the control listener binds to.
    pub listen_host: String,
    /// Port for the control listener; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// The debug client binary spawned for `launch`.
    pub client_binary: PathBuf,
    /// Terminal command template for launching the debuggee visibly; the
    /// `{command}` placeholder is replaced by the client command line. When
    /// absent the debuggee is spawned directly with no console.
    pub terminal: Option<String>,
    /// Monitor poll bound while waiting for debuggee messages.
    pub poll_interval_ms: u64,
    /// Floor on the idle monitor loop; iterations that did no work never
    /// spin faster than this.
    pub idle_floor_ms: u64,
    /// How long a new connection gets to announce itself.
    pub announce_timeout_ms: u64,
    /// Base delay of the exponential spawn-discovery retry.
    pub spawn_retry_base_ms: u64,
    /// Number of spawn-discovery retries after the first attempt.
    pub spawn_retry_attempts: usize,
    /// How long to wait for an adopted debuggee to reach its startup hold.
    pub startup_timeout_ms: u64,
    /// Bound on a request/reply rendezvous.
    pub reply_timeout_ms: u64,
    /// How long a graceful detach waits for the exit report.
    pub detach_timeout_ms: u64,
    /// Variable visibility filters pushed to every debuggee at startup.
    pub filters: SetFilter,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_owned(),
            listen_port: DEFAULT_CONTROL_PORT,
            client_binary: PathBuf::from("debug-client"),
            terminal: None,
            poll_interval_ms: 10,
            idle_floor_ms: 5,
            announce_timeout_ms: 2_000,
            spawn_retry_base_ms: 200,
            spawn_retry_attempts: 5,
            startup_timeout_ms: 5_000,
            reply_timeout_ms: 5_000,
            detach_timeout_ms: 2_000,
            filters: SetFilter::default(),
        }
    }
}

impl ManagerConfig {
    /// The well-known config file location, when the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        Some(dirs::config_dir()?.join("script-debugger").join("config.toml"))
    }

    /// Load the default config file; absent file or platform means defaults.
    pub fn load() -> Result<Self, crate::SessionError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, crate::SessionError> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|source| crate::SessionError::Config {
            path: path.to_owned(),
            source,
        })
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn idle_floor(&self) -> Duration {
        Duration::from_millis(self.idle_floor_ms)
    }

    pub(crate) fn announce_timeout(&self) -> Duration {
        Duration::from_millis(self.announce_timeout_ms)
    }

    pub(crate) fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub(crate) fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub(crate) fn detach_timeout(&self) -> Duration {
        Duration::from_millis(self.detach_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable_without_a_file() {
        let config = ManagerConfig::default();
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.listen_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.client_binary, PathBuf::from("debug-client"));
        assert!(config.terminal.is_none());
        assert!(config.poll_interval_ms > 0);
    }

    #[test]
    fn a_partial_file_keeps_defaults_for_the_rest() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "listen_port = 0\nterminal = \"xterm -e {command}\"\n",
        )
        .expect("writing config");

        let config = ManagerConfig::load_from(&path).expect("loading");
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.terminal.as_deref(), Some("xterm -e {command}"));
        assert_eq!(config.listen_host, "127.0.0.1");
        assert_eq!(config.reply_timeout_ms, 5_000);
    }

    #[test]
    fn a_malformed_file_is_reported_with_its_path() {
        let dir = tempfile::tempdir().expect("creating tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen_port = \"not a port\"").expect("writing config");

        match ManagerConfig::load_from(&path) {
            Err(crate::SessionError::Config { path: reported, .. }) => {
                assert_eq!(reported, path);
            }
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn filters_round_trip_through_toml() {
        let mut config = ManagerConfig::default();
        config.filters.global_patterns = vec!["^_".to_owned()];
        config.filters.show_hidden = true;

        let raw = toml::to_string(&config).expect("serializing");
        let parsed: ManagerConfig = toml::from_str(&raw).expect("parsing");
        assert_eq!(parsed, config);
    }
}
