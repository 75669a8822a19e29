//! Error classification and retry around channel requests.
//!
//! Errors are sorted into classes so callers (and logs) can tell a busy
//! link from a dead one. Only transient failures are retried.

use crate::channel::Channel;
use crate::codec::{Message, Schema};
use crate::error::{Error, Result, TransportError};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum retry attempts for transient errors.
pub const MAX_RETRIES: u32 = 3;

/// Classification of communication errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Layout or value violation; nothing was sent.
    Codec,
    /// No answer in time; may succeed on retry.
    Transient,
    /// The device link dropped while waiting.
    LinkLost,
    /// The device or receiver answered with an error code.
    Protocol,
    Pairing,
    /// Device or channel gone.
    Disconnected,
    /// Setup problem: configuration, permissions, unsupported target.
    Config,
}

impl ErrorClass {
    /// Classify an error for retry decisions.
    pub fn classify(err: &Error) -> Self {
        match err.root() {
            Error::Codec(_) => Self::Codec,
            Error::Transport(TransportError::Timeout) => Self::Transient,
            Error::Transport(TransportError::LinkLost) => Self::LinkLost,
            Error::Transport(TransportError::PermissionDenied(_)) => Self::Config,
            Error::Transport(TransportError::Hid(msg)) => {
                let lower = msg.to_lowercase();
                if lower.contains("timeout") || lower.contains("timed out") {
                    Self::Transient
                } else if lower.contains("permission")
                    || lower.contains("access denied")
                    || lower.contains("access is denied")
                {
                    Self::Config
                } else {
                    Self::Disconnected
                }
            }
            Error::Transport(
                TransportError::NoDevice | TransportError::ChannelClosed | TransportError::ShortWrite { .. },
            )
            | Error::DeviceNotFound(_) => Self::Disconnected,
            Error::Protocol(_) | Error::FeatureNotSupported(_) | Error::UnexpectedMessage { .. } => {
                Self::Protocol
            }
            Error::Pairing(_) => Self::Pairing,
            Error::Config(_) | Error::Unsupported(_) => Self::Config,
            Error::WithContext { .. } => Self::Protocol,
        }
    }

    /// Whether this error class is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codec => "codec",
            Self::Transient => "transient",
            Self::LinkLost => "link_lost",
            Self::Protocol => "protocol",
            Self::Pairing => "pairing",
            Self::Disconnected => "disconnected",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Send `request` and wait for `response`, retrying timeouts.
///
/// Returns the response on success, or the last error after exhausting retries.
pub fn send_with_retry(
    channel: &Channel,
    request: &Message,
    response: &'static Schema,
    timeout: Duration,
    max_retries: u32,
) -> Result<Message> {
    let mut attempt = 0;
    loop {
        match channel.send(request, response, timeout) {
            Ok(message) => {
                if attempt > 0 {
                    debug!(
                        channel = %channel.identifier(),
                        request = request.name(),
                        attempt = attempt + 1,
                        "Request succeeded after retry"
                    );
                }
                return Ok(message);
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                if !class.is_retryable() || attempt >= max_retries {
                    warn!(
                        channel = %channel.identifier(),
                        request = request.name(),
                        kind = %class,
                        tag = ?e.tag(),
                        attempt = attempt + 1,
                        attempts = max_retries + 1,
                        error = %e,
                        "Request failed"
                    );
                    return Err(e);
                }
                debug!(
                    channel = %channel.identifier(),
                    request = request.name(),
                    attempt = attempt + 1,
                    error = %e,
                    "Transient failure, retrying"
                );
                attempt += 1;
            }
        }
    }
}

/// Connection status of a channel's device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Device is connected and responding.
    Connected,
    /// Device is not found / disconnected.
    Disconnected,
    /// Link is up but the device did not answer.
    Unresponsive,
    /// Setup problem (permissions, unsupported target).
    ConfigError,
}

/// Ping the device behind `channel` with a root lookup.
pub fn check_device_status(channel: &Channel) -> DeviceStatus {
    if !channel.is_device_connected() {
        return DeviceStatus::Disconnected;
    }
    match channel.ping() {
        Ok(()) => DeviceStatus::Connected,
        Err(ref e) => match ErrorClass::classify(e) {
            ErrorClass::Disconnected | ErrorClass::LinkLost => DeviceStatus::Disconnected,
            ErrorClass::Config => DeviceStatus::ConfigError,
            _ => DeviceStatus::Unresponsive,
        },
    }
}
