//! Server configuration.
//!
//! Read from the TOML file named by `CROPSCAN_CONFIG`, or `./cropscan.toml`.
//! A missing file means defaults; nothing is written back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CROPSCAN_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "cropscan.toml";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Where chunks, in-flight writes and completion claims live.
    #[serde(default = "default_chunk_dir")]
    pub chunk_dir: PathBuf,

    /// Where assembled artifacts are written.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Limit for each blocking storage step, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Age after which abandoned upload state is evicted (0 = never).
    #[serde(default = "default_orphan_ttl")]
    pub orphan_ttl_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub classifier: ClassifierConfig,
}

/// External inference program settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Program invoked with the artifact path as its last argument.
    #[serde(default)]
    pub program: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    /// JSON array of class names; the built-in table is used when absent.
    #[serde(default)]
    pub labels_path: Option<PathBuf>,

    #[serde(default = "default_classifier_timeout")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    cropscan_protocol::constants::DEFAULT_PORT
}

fn default_chunk_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_request_timeout() -> u64 {
    30
}

fn default_orphan_ttl() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60 * 60
}

fn default_classifier_timeout() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            chunk_dir: default_chunk_dir(),
            output_dir: default_output_dir(),
            request_timeout_secs: default_request_timeout(),
            orphan_ttl_secs: default_orphan_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            classifier: ClassifierConfig::default(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            labels_path: None,
            timeout_secs: default_classifier_timeout(),
        }
    }
}

impl Config {
    /// Loads configuration from the default location.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path())
    }

    /// Loads configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config: Config =
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
            tracing::debug!(path = %path.display(), "configuration file read");
            config
        } else {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be at least 1");
        }
        if self.orphan_ttl_secs > 0 && self.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be at least 1 when orphan_ttl_secs is set");
        }
        if self.classifier.timeout_secs == 0 {
            anyhow::bail!("classifier.timeout_secs must be at least 1");
        }
        if self.chunk_dir == self.output_dir {
            anyhow::bail!("chunk_dir and output_dir must differ");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `None` when the sweep is disabled.
    pub fn orphan_ttl(&self) -> Option<Duration> {
        (self.orphan_ttl_secs > 0).then(|| Duration::from_secs(self.orphan_ttl_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.chunk_dir, PathBuf::from("temp"));
        assert_eq!(config.output_dir, PathBuf::from("uploads"));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.orphan_ttl(), Some(Duration::from_secs(86_400)));
        assert_eq!(config.sweep_interval(), Duration::from_secs(3600));
        assert!(config.classifier.program.is_none());
        assert_eq!(config.classifier.timeout_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_partial_toml() {
        let toml_str = r#"
            port = 8080

            [classifier]
            program = "python3"
            args = ["infer.py"]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.chunk_dir, PathBuf::from("temp"));
        assert_eq!(config.classifier.program.as_deref(), Some("python3"));
        assert_eq!(config.classifier.args, vec!["infer.py"]);
        assert_eq!(config.classifier.timeout_secs, 60);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            port: 9000,
            orphan_ttl_secs: 0,
            ..Config::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.orphan_ttl(), None);
    }

    #[test]
    fn missing_file_yields_defaults_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cropscan.toml");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.port, 3000);
        assert!(!path.exists());
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cropscan.toml");
        std::fs::write(&path, "chunk_dir = \"/var/cropscan/chunks\"\norphan_ttl_secs = 600\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.chunk_dir, PathBuf::from("/var/cropscan/chunks"));
        assert_eq!(config.orphan_ttl(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cropscan.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn rejects_zero_sweep_interval() {
        let config = Config {
            sweep_interval_secs: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let disabled = Config {
            sweep_interval_secs: 0,
            orphan_ttl_secs: 0,
            ..Config::default()
        };
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn rejects_shared_directories() {
        let config = Config {
            output_dir: PathBuf::from("temp"),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
