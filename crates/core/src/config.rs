//! Harness configuration.
//!
//! Loaded from JSON; every field has a default so a partial file (or no
//! file at all) is valid.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Default deadline for `send`.
    pub response_timeout_ms: u64,
    /// Per-queue cap before the oldest message is dropped.
    pub queue_capacity: usize,
    /// Minimum time a released software-id tag rests before reuse.
    pub tag_dwell_ms: u64,
    /// Reader thread poll granularity.
    pub reader_poll_ms: u64,
    pub pairing: PairingConfig,
    pub unpair_timeout_s: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub start_timeout_s: u64,
    pub pairing_timeout_s: u64,
    pub keystroke_interval_ms: u64,
    pub retry_count: u32,
    /// Mismatching `DeviceConnection` messages tolerated while awaiting the link.
    pub max_wrong_messages: u32,
    pub cancel_timeout_ms: u64,
    pub stop_timeout_s: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2000,
            queue_capacity: 256,
            tag_dwell_ms: 50,
            reader_poll_ms: 20,
            pairing: PairingConfig::default(),
            unpair_timeout_s: 4,
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            start_timeout_s: 5,
            pairing_timeout_s: 30,
            keystroke_interval_ms: 500,
            retry_count: 3,
            max_wrong_messages: 3,
            cancel_timeout_ms: 500,
            stop_timeout_s: 9,
        }
    }
}

impl HarnessConfig {
    /// Read a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_json(&text)?;
        debug!(path = %path.display(), "Loaded harness configuration");
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn tag_dwell(&self) -> Duration {
        Duration::from_millis(self.tag_dwell_ms)
    }

    pub fn reader_poll(&self) -> Duration {
        Duration::from_millis(self.reader_poll_ms.max(1))
    }

    pub fn unpair_timeout(&self) -> Duration {
        Duration::from_secs(self.unpair_timeout_s)
    }
}

impl PairingConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_s)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_s)
    }

    pub fn keystroke_interval(&self) -> Duration {
        Duration::from_millis(self.keystroke_interval_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_s)
    }
}
