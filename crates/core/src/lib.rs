//! hidpp-harness-core: HID++ transport, dispatch and pairing.
//!
//! This crate provides the core logic a test bench needs to talk to Logitech
//! receivers and devices over HID++ 1.0 and 2.0: a bitfield message codec,
//! per-channel report dispatch with tagged request correlation, channel
//! management across receivers and their paired slots, and the BLE Pro
//! pairing state machine.

pub mod ble;
pub mod channel;
pub mod codec;
pub mod comm;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod facade;
pub mod feature_cache;
pub mod hidpp;
pub mod manager;
pub mod messages;
pub mod nvs;
pub mod pairing;
pub mod pending;
pub mod protocol;
pub mod queue;
pub mod receiver;
pub mod registry;
pub mod transport;

/// Logitech USB Vendor ID.
pub const LOGITECH_VID: u16 = 0x046D;

/// Known Logitech receiver product IDs.
pub mod pids {
    /// Unifying receiver.
    pub const UNIFYING_RECEIVER: u16 = 0xC52B;
    pub const UNIFYING_RECEIVER_2: u16 = 0xC532;
    /// Bolt receiver (BLE Pro).
    pub const BOLT_RECEIVER: u16 = 0xC548;
    /// Lightspeed gaming receivers.
    pub const LIGHTSPEED_RECEIVER: u16 = 0xC539;
    pub const LIGHTSPEED_RECEIVER_2: u16 = 0xC53F;
    pub const LIGHTSPEED_RECEIVER_3: u16 = 0xC547;
    /// Gotthard bench receiver.
    pub const GOTTHARD_RECEIVER: u16 = 0xF013;
}
