//! Run configuration
//!
//! Every section has a complete `Default`, so a config file only needs the keys it
//! changes. Durations are whole seconds.

use crate::poller::CompletionPoller;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use transit_broker::{ConnectionParams, ReconnectPolicy, Subscription, TlsParams};
use transit_ingest::HttpIndexConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error accessing {0:?}: {1}")]
    IoError(PathBuf, std::io::Error),

    #[error("Parse error in {0:?}: {1}")]
    ParseError(PathBuf, String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub tracker: TrackerConfig,
    pub ingest: IngestConfig,
    pub transfer: TransferConfig,
}

impl Config {
    /// Load a YAML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }
}

/// Message broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub topic: String,

    /// Reused on every resubscribe; generated when unset
    pub subscription_id: Option<String>,

    /// Request a durable subscription
    pub durable: bool,

    pub tls: bool,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca_cert: PathBuf,

    /// Certificate name to verify instead of `host`
    pub server_name: Option<String>,

    pub login: Option<String>,
    pub passcode: Option<String>,

    /// Attempts per connect or reconnect
    pub connect_attempts: u32,
    pub retry_delay_secs: u64,
    pub heartbeat_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 443,
            vhost: "/".to_string(),
            topic: "/topic/rucio.events".to_string(),
            subscription_id: None,
            durable: false,
            tls: true,
            cert: PathBuf::from("/opt/certs/hostcert.pem"),
            key: PathBuf::from("/opt/certs/hostkey.pem"),
            ca_cert: PathBuf::from("/etc/ssl/certs/ca-certificates.crt"),
            server_name: None,
            login: None,
            passcode: None,
            connect_attempts: 3,
            retry_delay_secs: 1,
            heartbeat_secs: 20,
            connect_timeout_secs: 10,
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("broker port must not be 0".into()));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("topic must not be empty".into()));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connect_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connection_params(&self) -> ConnectionParams {
        let tls = self.tls.then(|| TlsParams {
            cert: self.cert.clone(),
            key: self.key.clone(),
            ca_cert: self.ca_cert.clone(),
            server_name: self.server_name.clone(),
        });

        ConnectionParams {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            tls,
            login: self.login.clone(),
            passcode: self.passcode.clone(),
            heartbeat: Duration::from_secs(self.heartbeat_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.connect_attempts,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn subscription(&self) -> Subscription {
        Subscription::new(self.topic.clone(), self.subscription_id.clone()).durable(self.durable)
    }
}

/// Completion polling for tracking runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 120,
            timeout_secs: 600,
        }
    }
}

impl TrackerConfig {
    pub fn poller(&self) -> CompletionPoller {
        CompletionPoller::new(
            Duration::from_secs(self.poll_interval_secs.max(1)),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// Batch forwarding to the document index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub index_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub chunk_size: usize,
    pub timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            index_url: "http://localhost:9200".to_string(),
            username: None,
            password: None,
            chunk_size: 1,
            timeout_secs: 30,
        }
    }
}

impl IngestConfig {
    pub fn index_config(&self) -> HttpIndexConfig {
        HttpIndexConfig {
            url: self.index_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// End-to-end transfer test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Account the control-plane commands run as
    pub account: String,
    pub scope: String,

    /// Location the generated files are uploaded to
    pub source: String,
    pub destinations: Vec<String>,

    pub files: usize,
    pub file_size: usize,

    /// Where generated files are written; a fresh temporary directory when unset
    pub data_dir: Option<PathBuf>,

    pub copies: u32,

    /// Lifetime of uploaded files and rules
    pub lifetime_secs: u64,

    /// Upload timeout passed to the control plane
    pub upload_timeout_secs: u64,

    /// Control-plane client executable
    pub program: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            account: "root".to_string(),
            scope: "user.root".to_string(),
            source: String::new(),
            destinations: Vec::new(),
            files: 1,
            file_size: 1024,
            data_dir: None,
            copies: 1,
            lifetime_secs: 10_000,
            upload_timeout_secs: 600,
            program: PathBuf::from("rucio"),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.trim().is_empty() {
            return Err(ConfigError::Invalid("source location is required".into()));
        }
        if self.destinations.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one destination is required".into(),
            ));
        }
        if self.files == 0 {
            return Err(ConfigError::Invalid("files must be at least 1".into()));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("transit-{}", uuid::Uuid::new_v4()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.broker.port, 443);
        assert_eq!(config.broker.vhost, "/");
        assert_eq!(config.broker.connect_attempts, 3);
        assert_eq!(config.broker.heartbeat_secs, 20);
        assert_eq!(config.tracker.poll_interval_secs, 120);
        assert_eq!(config.tracker.timeout_secs, 600);
        assert_eq!(config.ingest.chunk_size, 1);
        assert_eq!(config.transfer.files, 1);
        assert_eq!(config.transfer.file_size, 1024);
        assert_eq!(config.transfer.lifetime_secs, 10_000);
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker:\n  host: broker.example.org\n  subscription_id: test\n  durable: true\ntracker:\n  poll_interval_secs: 5\ningest:\n  chunk_size: 20\ntransfer:\n  destinations: [RSE_A, RSE_B]"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.broker.host, "broker.example.org");
        assert_eq!(config.broker.port, 443);
        assert_eq!(config.tracker.poll_interval_secs, 5);
        assert_eq!(config.tracker.timeout_secs, 600);
        assert_eq!(config.ingest.chunk_size, 20);
        assert_eq!(config.transfer.destinations, vec!["RSE_A", "RSE_B"]);

        let subscription = config.broker.subscription();
        assert_eq!(subscription.id, "test");
        assert!(subscription.durable);
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/transit.yaml")),
            Err(ConfigError::IoError(..))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker: [not, a, mapping]").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::ParseError(..))
        ));
    }

    #[test]
    fn test_connection_params() {
        let mut broker = BrokerConfig::default();
        let params = broker.connection_params();
        assert!(params.tls.is_some());
        assert_eq!(params.heartbeat, Duration::from_secs(20));

        broker.tls = false;
        assert!(broker.connection_params().tls.is_none());
        assert_eq!(broker.reconnect_policy().max_attempts, 3);
    }

    #[test]
    fn test_validation() {
        let mut broker = BrokerConfig::default();
        assert!(broker.validate().is_ok());
        broker.connect_attempts = 0;
        assert!(broker.validate().is_err());

        let mut transfer = TransferConfig::default();
        assert!(transfer.validate().is_err());
        transfer.source = "RSE_SRC".into();
        transfer.destinations = vec!["RSE_A".into()];
        assert!(transfer.validate().is_ok());
    }
}
