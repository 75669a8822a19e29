//! Error types for hidpp-harness-core.

use crate::channel::ChannelIdentifier;
use crate::protocol::{Hidpp1ErrorCode, Hidpp2ErrorCode};
use thiserror::Error;

/// Encode-time layout or value violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Field value does not fit its width or fails its declared check.
    #[error("value out of range: {schema}.{field} = {value}")]
    ValueOutOfRange {
        schema: &'static str,
        field: &'static str,
        value: u64,
    },

    /// Buffer or byte field does not have the declared length.
    #[error("length mismatch in {schema}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        schema: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Field name not declared by the schema.
    #[error("unknown field {schema}.{field}")]
    UnknownField { schema: &'static str, field: String },

    /// Integer written to a byte field or the other way round.
    #[error("field {schema}.{field} holds a different value kind")]
    KindMismatch {
        schema: &'static str,
        field: &'static str,
    },

    /// Typed view requested over a message of another class.
    #[error("expected {expected} message, got {actual}")]
    SchemaMismatch {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Link-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response within the deadline.
    #[error("timeout waiting for response")]
    Timeout,

    /// Link went to NOT_ESTABLISHED (or the channel closed) while waiting.
    #[error("link lost")]
    LinkLost,

    /// Discovery found no device to talk to.
    #[error("no device discovered")]
    NoDevice,

    /// Operation on a channel that is not open.
    #[error("channel is not open")]
    ChannelClosed,

    /// HID device communication failure.
    #[error("HID error: {0}")]
    Hid(String),

    /// Permission denied opening the HID node.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The HID layer accepted fewer bytes than the frame holds.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
}

/// Error replies from the device or receiver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// HID++ 1.0 register error (sub-id 0x8F).
    #[error("HID++1 error on sub-id 0x{sub_id:02X} address 0x{address:02X}: {code:?}")]
    Hidpp1 {
        sub_id: u8,
        address: u8,
        code: Hidpp1ErrorCode,
    },

    /// HID++ 2.0 feature error (feature index 0xFF).
    #[error("HID++2 error on feature index 0x{feature_index:02X} function {function}: {code:?}")]
    Hidpp2 {
        feature_index: u8,
        function: u8,
        code: Hidpp2ErrorCode,
    },
}

/// Terminal pairing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("pairing timed out in state {state}")]
    Timeout { state: &'static str },

    #[error("pairing failed: {0}")]
    Failed(String),

    #[error("pairing cancelled")]
    Cancelled,

    #[error("invalid entropy {entropy} for {method} authentication")]
    InvalidEntropy { method: &'static str, entropy: u8 },
}

/// Core library error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// Device not found during enumeration or lookup.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device reports index 0 for a feature the caller requires.
    #[error("feature 0x{0:04X} not supported")]
    FeatureNotSupported(u16),

    /// `get_only` with `check_first` found another class at the queue head.
    #[error("expected one of [{expected}], got {actual}")]
    UnexpectedMessage {
        expected: String,
        actual: &'static str,
    },

    /// The target does not implement the operation.
    #[error("not supported: {0}")]
    Unsupported(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An error annotated with the channel and software-id tag it came from.
    #[error("[{channel}] {source}")]
    WithContext {
        channel: ChannelIdentifier,
        tag: Option<u8>,
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the originating channel and request tag.
    ///
    /// Already-annotated errors are returned unchanged so a failure only
    /// carries one context.
    pub fn with_context(self, channel: &ChannelIdentifier, tag: Option<u8>) -> Self {
        match self {
            Error::WithContext { .. } => self,
            other => Error::WithContext {
                channel: channel.clone(),
                tag,
                source: Box::new(other),
            },
        }
    }

    /// The error with any context wrappers peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Error::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Software-id tag of the provoking request, when known.
    pub fn tag(&self) -> Option<u8> {
        match self {
            Error::WithContext { tag, .. } => *tag,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Transport(TransportError::Timeout))
    }

    pub fn is_link_lost(&self) -> bool {
        matches!(self.root(), Error::Transport(TransportError::LinkLost))
    }
}

impl From<hidapi::HidError> for Error {
    fn from(err: hidapi::HidError) -> Self {
        let msg = err.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("permission") || lower.contains("access denied") {
            Error::Transport(TransportError::PermissionDenied(msg))
        } else {
            Error::Transport(TransportError::Hid(msg))
        }
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
