//! Tunables pulled out of spec.md's named constants so a host integrator can
//! override them (e.g. for a slower or more aggressive device) without
//! recompiling.

use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Maximum number of concurrently mounted volumes. Spec.md calls this
/// "DriveMax", set by the FAT library's concurrent-volume limit.
pub const DRIVE_MAX: usize = 8;

/// Retries performed by `transfer_command` before giving up (§4.2).
pub const SCSI_TRANSFER_RETRIES: u32 = 3;

/// Largest single bulk data-phase chunk (§4.2).
pub const MAX_CHUNK_LEN: usize = 32 * 1024;

/// DMA allocation granule (§4.1).
pub const DMA_GRANULE: usize = 0x1000;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delay observed after every control transfer to accommodate slow
    /// devices (§4.1, "~120 ms settle delay").
    pub control_settle_delay_ms: u64,
    /// Sleep performed when a device reports NOT READY during the
    /// media-ready handshake (§4.4, step 2).
    pub not_ready_retry_delay_secs: u64,
    /// Retries of `transfer_command` (overridable mirror of
    /// `SCSI_TRANSFER_RETRIES`).
    pub scsi_transfer_retries: u32,
    /// Largest bulk data-phase chunk in bytes (overridable mirror of
    /// `MAX_CHUNK_LEN`).
    pub max_chunk_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_settle_delay_ms: 120,
            not_ready_retry_delay_secs: 3,
            scsi_transfer_retries: SCSI_TRANSFER_RETRIES,
            max_chunk_len: MAX_CHUNK_LEN,
        }
    }
}

impl Config {
    /// Parses a TOML document into a `Config`, falling back to
    /// [`Config::default`] for any field left unspecified.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Reads `path` and parses it as TOML, the way a host integrator
    /// overrides the tunables without recompiling.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&contents).map_err(ConfigError::Parse)
    }

    pub fn control_settle_delay(&self) -> Duration {
        Duration::from_millis(self.control_settle_delay_ms)
    }

    pub fn not_ready_retry_delay(&self) -> Duration {
        Duration::from_secs(self.not_ready_retry_delay_secs)
    }
}

/// Errors raised by [`Config::load`].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "failed to read config file: {err}"),
            ConfigError::Parse(err) => write!(f, "failed to parse config file: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.scsi_transfer_retries, 3);
        assert_eq!(cfg.max_chunk_len, 32 * 1024);
        assert_eq!(cfg.control_settle_delay_ms, 120);
        assert_eq!(cfg.not_ready_retry_delay_secs, 3);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = Config::from_toml_str("scsi_transfer_retries = 5\n").unwrap();
        assert_eq!(cfg.scsi_transfer_retries, 5);
        assert_eq!(cfg.max_chunk_len, MAX_CHUNK_LEN);
    }

    #[test]
    fn load_reads_and_parses_a_config_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("usbms-config-test-{:?}.toml", std::thread::current().id()));
        std::fs::write(&path, "max_chunk_len = 4096\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.max_chunk_len, 4096);
        assert_eq!(cfg.scsi_transfer_retries, SCSI_TRANSFER_RETRIES);
    }

    #[test]
    fn load_missing_file_is_an_io_error() {
        assert!(matches!(Config::load("/no/such/path.toml"), Err(ConfigError::Io(_))));
    }
}
