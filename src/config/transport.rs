use serde::{Deserialize, Deserializer};
use std::{path::Path, time::Duration};
use thiserror::Error;

use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

/// Size of one device transfer unit, header included.
pub const MTU_UNIT: usize = 64 * 1024;

/// Bytes reserved at the front of every unit for the upper layer's header.
pub const FRAGMENT_HEADER_LEN: usize = 16;

const DEFAULT_FREE_LIST_NUM: usize = 8;
const DEFAULT_FREE_LIST_MAX: usize = 1024;
const DEFAULT_FREE_LIST_INC: usize = 32;
const DEFAULT_MAX_FRAG_SIZE: u64 = 2 << 30;
const DEFAULT_REPOST_THRESHOLD: usize = 1;
const DEFAULT_RECV_PREPOST: usize = 4;
const DEFAULT_POLL_BATCH: usize = 16;
const DEFAULT_CONNECT_RETRIES: u32 = 3;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

// -----------------------------------------------------------------------------
// ----- TransportConfig -------------------------------------------------------

/// Tunables read once when a module opens its device.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    pub exclusivity: u32,
    pub first_frag_size: usize,
    pub min_frag_size: usize,
    pub max_frag_size: u64,

    /// Pool low watermark: buffers preallocated at open.
    pub free_list_num: usize,
    pub free_list_max: usize,
    pub free_list_inc: usize,

    pub repost_threshold: usize,
    pub recv_prepost: usize,
    pub poll_batch: usize,

    pub connect_retries: u32,
    #[serde(deserialize_with = "deserialize_duration")]
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            exclusivity: 0,
            first_frag_size: MTU_UNIT - FRAGMENT_HEADER_LEN,
            min_frag_size: MTU_UNIT - FRAGMENT_HEADER_LEN,
            max_frag_size: DEFAULT_MAX_FRAG_SIZE,
            free_list_num: DEFAULT_FREE_LIST_NUM,
            free_list_max: DEFAULT_FREE_LIST_MAX,
            free_list_inc: DEFAULT_FREE_LIST_INC,
            repost_threshold: DEFAULT_REPOST_THRESHOLD,
            recv_prepost: DEFAULT_RECV_PREPOST,
            poll_batch: DEFAULT_POLL_BATCH,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- TransportConfig: Public -----------------------------------------------

impl TransportConfig {
    /// Bytes per pooled buffer: the first fragment plus its header.
    pub fn unit_size(&self) -> usize {
        self.first_frag_size + FRAGMENT_HEADER_LEN
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.free_list_max == 0 {
            return Err(ConfigError::invalid("free_list_max", "must be at least 1"));
        }

        if self.free_list_inc == 0 {
            return Err(ConfigError::invalid("free_list_inc", "must be at least 1"));
        }

        if self.free_list_num > self.free_list_max {
            return Err(ConfigError::invalid(
                "free_list_num",
                format!(
                    "low watermark {} exceeds free_list_max {}",
                    self.free_list_num, self.free_list_max
                ),
            ));
        }

        if self.min_frag_size > self.first_frag_size {
            return Err(ConfigError::invalid(
                "min_frag_size",
                "must not exceed first_frag_size",
            ));
        }

        if self.first_frag_size as u64 > self.max_frag_size {
            return Err(ConfigError::invalid(
                "first_frag_size",
                "must not exceed max_frag_size",
            ));
        }

        if self.poll_batch == 0 {
            return Err(ConfigError::invalid("poll_batch", "must be at least 1"));
        }

        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- ConfigFile ------------------------------------------------------------

/// On-disk format: an optional log level and a `[transport]` table.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub log_level: Option<LogLevel>,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl ConfigFile {
    pub fn parse(raw: &str) -> Result<ConfigFile, ConfigError> {
        let file: ConfigFile = toml::from_str(raw).map_err(|e| ConfigError::Toml { source: e })?;
        file.transport.validate()?;
        Ok(file)
    }

    pub async fn from_file_async(path: &Path) -> Result<ConfigFile, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::parse(&raw)
    }
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },

    #[error("invalid transport.{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_free_list_sizes() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.free_list_num, 8);
        assert_eq!(cfg.free_list_max, 1024);
        assert_eq!(cfg.free_list_inc, 32);
        assert_eq!(cfg.repost_threshold, 1);
        assert_eq!(cfg.unit_size(), MTU_UNIT);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_partial_transport_table() {
        let raw = r#"
            log_level = "debug"

            [transport]
            free_list_num = 2
            free_list_max = 16
            connect_timeout = "250ms"
        "#;

        let file = ConfigFile::parse(raw).unwrap();
        assert_eq!(file.log_level, Some(LogLevel::Debug));
        assert_eq!(file.transport.free_list_num, 2);
        assert_eq!(file.transport.free_list_max, 16);
        assert_eq!(file.transport.free_list_inc, 32);
        assert_eq!(file.transport.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let file = ConfigFile::parse("").unwrap();
        assert_eq!(file.transport, TransportConfig::default());
        assert!(file.log_level.is_none());
    }

    #[test]
    fn rejects_low_watermark_above_max() {
        let raw = "[transport]\nfree_list_num = 64\nfree_list_max = 8\n";
        let err = ConfigFile::parse(raw).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "free_list_num",
                ..
            }
        ));
    }

    #[test]
    fn rejects_zero_increment() {
        let cfg = TransportConfig {
            free_list_inc: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_keys() {
        let raw = "[transport]\nhints_log_size = 8\n";
        assert!(matches!(
            ConfigFile::parse(raw),
            Err(ConfigError::Toml { .. })
        ));
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
