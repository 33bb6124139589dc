//! Configuration management for taskrelay.
//!
//! Loads configuration from ${TASKRELAY_HOME}/config.toml with sensible defaults,
//! then applies environment overrides (environment wins over the file).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the ntfy server
    pub server: String,

    /// Topic to subscribe to
    pub topic: String,

    /// Zellij session that receives interactive panes
    pub session: String,

    /// Wall-clock limit for one auto job, in seconds
    pub timeout_secs: u64,

    /// Run the agent with `--dangerously-skip-permissions`
    pub skip_permissions: bool,

    /// Tools the agent may use when permissions are restricted
    pub allowed_tools: Vec<String>,

    /// Agent turn budget (`--max-turns`)
    pub max_turns: u32,

    /// Agent executable, resolved through PATH
    pub agent_bin: String,

    /// Upper bound on concurrently running auto jobs (0 = unbounded)
    pub max_concurrent_jobs: usize,
}

impl Config {
    pub const DEFAULT_SERVER: &'static str = "https://ntfy.sh";
    pub const DEFAULT_TOPIC: &'static str = "my-claude-tasks";
    pub const DEFAULT_SESSION: &'static str = "main";
    pub const DEFAULT_TIMEOUT_SECS: u64 = 600;
    pub const DEFAULT_MAX_TURNS: u32 = 10;
    pub const DEFAULT_AGENT_BIN: &'static str = "claude";
    pub const DEFAULT_ALLOWED_TOOLS: &'static [&'static str] =
        &["Read", "Glob", "Grep", "Edit", "Write"];

    /// Loads configuration from the default config path and the process environment.
    ///
    /// # Errors
    /// Returns an error if the config file is unreadable or invalid, or an
    /// environment override cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&paths::config_path())?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Applies environment overrides using `lookup` to read variables.
    ///
    /// Empty values are treated as unset.
    ///
    /// # Errors
    /// Returns an error if a numeric or boolean variable cannot be parsed.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(server) = get("NTFY_SERVER") {
            self.server = server;
        }
        if let Some(topic) = get("NTFY_TOPIC") {
            self.topic = topic;
        }
        if let Some(session) = get("ZELLIJ_SESSION") {
            self.session = session;
        }
        if let Some(raw) = get("TASKRELAY_TIMEOUT_SECS") {
            self.timeout_secs = raw
                .parse()
                .with_context(|| format!("Invalid TASKRELAY_TIMEOUT_SECS '{raw}'"))?;
        }
        if let Some(raw) = get("TASKRELAY_SKIP_PERMISSIONS") {
            self.skip_permissions = parse_flag(&raw)
                .with_context(|| format!("Invalid TASKRELAY_SKIP_PERMISSIONS '{raw}'"))?;
        }
        if let Some(raw) = get("TASKRELAY_ALLOWED_TOOLS") {
            self.allowed_tools = split_list(&raw);
        }
        if let Some(raw) = get("TASKRELAY_MAX_TURNS") {
            self.max_turns = raw
                .parse()
                .with_context(|| format!("Invalid TASKRELAY_MAX_TURNS '{raw}'"))?;
        }
        if let Some(agent_bin) = get("TASKRELAY_AGENT_BIN") {
            self.agent_bin = agent_bin;
        }
        if let Some(raw) = get("TASKRELAY_MAX_CONCURRENT_JOBS") {
            self.max_concurrent_jobs = raw
                .parse()
                .with_context(|| format!("Invalid TASKRELAY_MAX_CONCURRENT_JOBS '{raw}'"))?;
        }

        Ok(())
    }

    /// Rejects settings the daemon cannot start with.
    ///
    /// # Errors
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.server.trim().is_empty(), "server must not be empty");
        ensure!(!self.topic.trim().is_empty(), "topic must not be empty");
        ensure!(self.timeout_secs > 0, "timeout_secs must be greater than 0");
        ensure!(self.max_turns > 0, "max_turns must be greater than 0");
        ensure!(
            !self.agent_bin.trim().is_empty(),
            "agent_bin must not be empty"
        );
        Ok(())
    }

    /// Returns the job timeout as a Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the concurrency bound, or None when unbounded.
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent_jobs > 0).then_some(self.max_concurrent_jobs)
    }

    /// Creates a new config file from the default template.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            bail!("Config file already exists at {}", path.display());
        }

        Self::write_config(path, default_config_template())
    }

    /// Serializes the config as TOML.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize config to TOML")
    }

    fn write_config(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: Self::DEFAULT_SERVER.to_string(),
            topic: Self::DEFAULT_TOPIC.to_string(),
            session: Self::DEFAULT_SESSION.to_string(),
            timeout_secs: Self::DEFAULT_TIMEOUT_SECS,
            skip_permissions: false,
            allowed_tools: Self::DEFAULT_ALLOWED_TOOLS
                .iter()
                .map(ToString::to_string)
                .collect(),
            max_turns: Self::DEFAULT_MAX_TURNS,
            agent_bin: Self::DEFAULT_AGENT_BIN.to_string(),
            max_concurrent_jobs: 0,
        }
    }
}

/// Returns the default config template with comments.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("expected one of 1/0, true/false, yes/no, on/off"),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub mod paths {
    //! Path resolution for taskrelay state.
    //!
    //! TASKRELAY_HOME resolution order:
    //! 1. TASKRELAY_HOME environment variable (if set)
    //! 2. ~/.local/share/taskrelay (default)

    use std::path::PathBuf;

    /// Returns the taskrelay state directory.
    ///
    /// Checks TASKRELAY_HOME env var first, falls back to ~/.local/share/taskrelay.
    /// Without a home directory the state lives under `./.taskrelay`.
    pub fn taskrelay_home() -> PathBuf {
        if let Ok(home) = std::env::var("TASKRELAY_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".taskrelay"),
            |h| h.join(".local").join("share").join("taskrelay"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        taskrelay_home().join("config.toml")
    }

    /// Returns the path to the job ledger.
    pub fn jobs_path() -> PathBuf {
        taskrelay_home().join("jobs.jsonl")
    }

    /// Returns the path to the stream cursor file.
    pub fn cursor_path() -> PathBuf {
        taskrelay_home().join("cursor")
    }

    /// Returns the directory for daemon log files.
    pub fn logs_dir() -> PathBuf {
        taskrelay_home().join("logs")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.timeout_secs, 600);
        assert_eq!(config.server, "https://ntfy.sh");
    }

    #[test]
    fn test_load_partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "topic = \"secret-topic\"\ntimeout_secs = 30\n").unwrap();

        let config = Config::load_from(&config_path).unwrap();
        assert_eq!(config.topic, "secret-topic");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.session, "main");
    }

    #[test]
    fn test_invalid_config_file_is_an_error() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "timeout_secs = \"soon\"\n").unwrap();

        assert!(Config::load_from(&config_path).is_err());
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config {
            topic: "from-file".to_string(),
            ..Config::default()
        };
        config
            .apply_env(env_from(&[
                ("NTFY_TOPIC", "from-env"),
                ("NTFY_SERVER", "http://localhost:8080"),
                ("TASKRELAY_TIMEOUT_SECS", "45"),
                ("TASKRELAY_SKIP_PERMISSIONS", "yes"),
                ("TASKRELAY_ALLOWED_TOOLS", "Read, Bash ,,Grep"),
                ("TASKRELAY_MAX_CONCURRENT_JOBS", "2"),
            ]))
            .unwrap();

        assert_eq!(config.topic, "from-env");
        assert_eq!(config.server, "http://localhost:8080");
        assert_eq!(config.timeout_secs, 45);
        assert!(config.skip_permissions);
        assert_eq!(config.allowed_tools, vec!["Read", "Bash", "Grep"]);
        assert_eq!(config.concurrency_limit(), Some(2));
    }

    #[test]
    fn test_blank_env_values_are_ignored() {
        let mut config = Config::default();
        config
            .apply_env(env_from(&[("NTFY_TOPIC", "  "), ("ZELLIJ_SESSION", "")]))
            .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_invalid_env_number_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(env_from(&[("TASKRELAY_TIMEOUT_SECS", "ten")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains("TASKRELAY_TIMEOUT_SECS"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = Config {
            timeout_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_means_unbounded() {
        assert_eq!(Config::default().concurrency_limit(), None);
    }

    #[test]
    fn test_init_creates_config_from_template() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("subdir").join("config.toml");

        Config::init(&config_path).unwrap();

        let contents = fs::read_to_string(&config_path).unwrap();
        assert!(contents.contains("# topic ="));
        // The template only holds commented defaults.
        assert_eq!(Config::load_from(&config_path).unwrap(), Config::default());
    }

    #[test]
    fn test_init_fails_if_exists() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        fs::write(&config_path, "").unwrap();

        assert!(Config::init(&config_path).is_err());
    }

    #[test]
    fn test_to_toml_roundtrips() {
        let config = Config {
            max_concurrent_jobs: 3,
            ..Config::default()
        };
        let toml = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }
}
