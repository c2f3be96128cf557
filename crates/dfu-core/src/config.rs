//! Engine configuration, persisted as TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DfuError;
use crate::protocol::{DEFAULT_MAX_BUSY_POLLS, DEFAULT_REPLUG_TIMEOUT, DEFAULT_TRANSFER_TIMEOUT};
use crate::quirks::{QuirkEntry, QuirkRule};

/// Tunables for a [`Device`](crate::device::Device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DfuConfig {
    /// How long to wait for a device to re-enumerate.
    pub replug_timeout_ms: u64,
    /// Timeout for each control transfer.
    pub transfer_timeout_ms: u64,
    /// Maximum GETSTATUS polls while the device reports busy.
    pub max_busy_polls: u32,
    /// Overrides wTransferSize from the functional descriptor.
    pub transfer_size: Option<u16>,
    /// Extra quirk rows, consulted before the built-in table.
    pub extra_quirks: Vec<QuirkRule>,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            replug_timeout_ms: DEFAULT_REPLUG_TIMEOUT.as_millis() as u64,
            transfer_timeout_ms: DEFAULT_TRANSFER_TIMEOUT.as_millis() as u64,
            max_busy_polls: DEFAULT_MAX_BUSY_POLLS,
            transfer_size: None,
            extra_quirks: Vec::new(),
        }
    }
}

impl DfuConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, DfuError> {
        let content = std::fs::read_to_string(path)?;
        let config: DfuConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), DfuError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DfuError> {
        if self.transfer_size == Some(0) {
            return Err(DfuError::Config("transfer_size must be non-zero".into()));
        }
        if self.max_busy_polls == 0 {
            return Err(DfuError::Config("max_busy_polls must be non-zero".into()));
        }
        self.quirk_entries().map(|_| ())
    }

    pub fn replug_timeout(&self) -> Duration {
        Duration::from_millis(self.replug_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    /// Resolve `extra_quirks` into table rows.
    pub fn quirk_entries(&self) -> Result<Vec<QuirkEntry>, DfuError> {
        self.extra_quirks
            .iter()
            .map(|rule| {
                rule.to_entry().map_err(|e| {
                    DfuError::Config(format!(
                        "quirk rule {:04X}:{:04X}: {}",
                        rule.vid, rule.pid, e
                    ))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quirks::{Quirks, lookup_in};

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: DfuConfig = toml::from_str("").unwrap();
        assert_eq!(config, DfuConfig::default());
        assert_eq!(config.replug_timeout(), Duration::from_millis(5000));
        assert_eq!(config.transfer_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_extra_quirks() {
        let config: DfuConfig = toml::from_str(
            r#"
            transfer_size = 256

            [[extra_quirks]]
            vid = 0x1234
            pid = 0x5678
            quirks = "ignore-polltimeout"
            "#,
        )
        .unwrap();
        assert_eq!(config.transfer_size, Some(256));
        let entries = config.quirk_entries().unwrap();
        assert_eq!(
            lookup_in(&entries, 0x1234, 0x5678, 0x0001),
            Quirks::IGNORE_POLLTIMEOUT
        );
    }

    #[test]
    fn test_invalid_quirk_name_rejected() {
        let config = DfuConfig {
            extra_quirks: vec![QuirkRule {
                vid: 1,
                pid: 2,
                release: None,
                quirks: "no-such-quirk".into(),
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DfuError::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("dfu-config-{}.toml", std::process::id()));
        let config = DfuConfig {
            replug_timeout_ms: 1000,
            transfer_size: Some(1024),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();
        let loaded = DfuConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
