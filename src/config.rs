//! Configuration file.
//!
//! Read from `<config_dir>/termxfer/config.toml`. Every key is optional;
//! command-line flags override what the file says.
//!
//! ```toml
//! [transfer]
//! chunk_size = 65536
//! rsync_min_size = 4096
//! compress = "auto"
//! cancel_grace_secs = 5
//!
//! [broker]
//! bypass_password = "hunter2"
//! expire_after_secs = 600
//! retry_delay_ms = 50
//! sweep_interval_secs = 30
//! home = "/home/me"
//! ```

use crate::error::{Result, TransferError};
use crate::transfer::broker::{BrokerConfig, EXPIRE_AFTER, RETRY_DELAY};
use crate::transfer::requestor::RequestorConfig;
use crate::transfer::sender::{
    CompressMode, SenderConfig, CANCEL_GRACE, DATA_CHUNK_SIZE, MAX_CHUNK_SIZE, RSYNC_MIN_SIZE,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub transfer: TransferSection,
    pub broker: BrokerSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    pub chunk_size: usize,
    pub rsync_min_size: u64,
    pub compress: CompressMode,
    pub cancel_grace_secs: u64,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: DATA_CHUNK_SIZE,
            rsync_min_size: RSYNC_MIN_SIZE,
            compress: CompressMode::Auto,
            cancel_grace_secs: CANCEL_GRACE.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub bypass_password: Option<String>,
    pub expire_after_secs: u64,
    pub retry_delay_ms: u64,
    pub sweep_interval_secs: u64,
    /// Defaults to the user's home directory.
    pub home: Option<PathBuf>,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            bypass_password: None,
            expire_after_secs: EXPIRE_AFTER.as_secs(),
            retry_delay_ms: RETRY_DELAY.as_millis() as u64,
            sweep_interval_secs: 30,
            home: None,
        }
    }
}

/// `<config_dir>/termxfer/config.toml`, when the platform has a config dir.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("termxfer").join(CONFIG_FILE))
}

impl Config {
    /// Load from `path`, or from [`default_path`] when none is given.
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => match default_path() {
                Some(p) if p.exists() => Self::from_file(&p),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            TransferError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
            .map_err(|e| TransferError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| TransferError::Config(e.message().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 {
            return Err(TransferError::Config(
                "transfer.chunk_size must be positive".into(),
            ));
        }
        if self.transfer.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::Config(format!(
                "transfer.chunk_size {} is above the {} byte limit of one message",
                self.transfer.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.broker.sweep_interval_secs == 0 {
            return Err(TransferError::Config(
                "broker.sweep_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            compress: self.transfer.compress,
            chunk_size: self.transfer.chunk_size,
            rsync_min_size: self.transfer.rsync_min_size,
            cancel_grace: Duration::from_secs(self.transfer.cancel_grace_secs),
            ..SenderConfig::default()
        }
    }

    pub fn requestor_config(&self, dest_dir: impl Into<PathBuf>) -> RequestorConfig {
        RequestorConfig {
            compress: self.transfer.compress != CompressMode::Never,
            cancel_grace: Duration::from_secs(self.transfer.cancel_grace_secs),
            ..RequestorConfig::new(dest_dir)
        }
    }

    /// Broker settings; `fallback_home` applies when the file names none.
    pub fn broker_config(&self, fallback_home: impl Into<PathBuf>) -> BrokerConfig {
        let home = self
            .broker
            .home
            .clone()
            .unwrap_or_else(|| fallback_home.into());
        BrokerConfig {
            bypass_password: self.broker.bypass_password.clone(),
            expire_after: Duration::from_secs(self.broker.expire_after_secs),
            retry_delay: Duration::from_millis(self.broker.retry_delay_ms),
            chunk_size: self.transfer.chunk_size,
            ..BrokerConfig::new(home)
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.broker.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_is_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.transfer.chunk_size, DATA_CHUNK_SIZE);
        assert_eq!(config.broker.expire_after_secs, 600);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [transfer]
            compress = "never"

            [broker]
            bypass_password = "pw"
            retry_delay_ms = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.transfer.compress, CompressMode::Never);
        assert_eq!(config.transfer.rsync_min_size, RSYNC_MIN_SIZE);
        assert_eq!(config.broker.bypass_password.as_deref(), Some("pw"));

        let broker = config.broker_config("/home/x");
        assert_eq!(broker.retry_delay, Duration::from_millis(10));
        assert_eq!(broker.home, PathBuf::from("/home/x"));
        assert!(!config.requestor_config("/tmp").compress);
    }

    #[test]
    fn test_home_from_file_wins() {
        let config = Config::parse("[broker]\nhome = \"/srv/files\"\n").unwrap();
        assert_eq!(config.broker_config("/home/x").home, PathBuf::from("/srv/files"));
    }

    #[test]
    fn test_sender_config_carries_transfer_section() {
        let config =
            Config::parse("[transfer]\nchunk_size = 1024\ncancel_grace_secs = 1\n").unwrap();
        let sender = config.sender_config();
        assert_eq!(sender.chunk_size, 1024);
        assert_eq!(sender.cancel_grace, Duration::from_secs(1));
        assert!(sender.rsync);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            Config::parse("[transfer]\ncompress = \"sometimes\"\n"),
            Err(TransferError::Config(_))
        ));
        assert!(matches!(
            Config::parse("[transfer]\nchunk_size = 0\n"),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_chunk_size_must_fit_one_envelope() {
        use crate::transfer::envelope::MAX_PAYLOAD_SIZE;

        let at_limit = format!("[transfer]\nchunk_size = {}\n", MAX_CHUNK_SIZE);
        assert!(Config::parse(&at_limit).is_ok());
        // base64 of the largest chunk leaves room in the envelope
        assert!(MAX_CHUNK_SIZE.div_ceil(3) * 4 < MAX_PAYLOAD_SIZE);

        let too_big = format!("[transfer]\nchunk_size = {}\n", 8 * 1024 * 1024);
        assert!(matches!(
            Config::parse(&too_big),
            Err(TransferError::Config(msg)) if msg.contains("chunk_size")
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());

        let present = tmp.path().join("c.toml");
        fs::write(&present, "[broker]\nsweep_interval_secs = 5\n").unwrap();
        let config = Config::load(Some(&present)).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
    }
}
