//! HID++ 1.0 receiver registers.
//!
//! Register requests travel to device index 0xFF with the register access
//! sub-id (0x80..0x83) in byte 2 and the register address in byte 3. The
//! receiver answers with the same sub-id and address.

use super::{register_long, register_short};
use crate::codec::{Check, Message, MessageKind, Schema};
use crate::error::CodecError;
use crate::hidpp::registers;
use crate::hidpp::sub_ids::{GET_LONG_REGISTER, GET_REGISTER, SET_LONG_REGISTER, SET_REGISTER};
use crate::protocol::{ConnectState, DiscoveryOption};
use lazy_static::lazy_static;

lazy_static! {
    // Generic access; callers pick the address through the header.
    pub static ref SET_REGISTER_GENERIC: Schema =
        register_short("SetRegister", MessageKind::Request, SET_REGISTER, 0)
            .uint("r0", 8)
            .uint("r1", 8)
            .uint("r2", 8)
            .build();
    pub static ref SET_REGISTER_RESPONSE: Schema =
        register_short("SetRegisterResponse", MessageKind::Response, SET_REGISTER, 0)
            .padding(24)
            .build();
    pub static ref GET_REGISTER_GENERIC: Schema =
        register_short("GetRegister", MessageKind::Request, GET_REGISTER, 0)
            .padding(24)
            .build();
    pub static ref GET_REGISTER_RESPONSE: Schema =
        register_short("GetRegisterResponse", MessageKind::Response, GET_REGISTER, 0)
            .uint("r0", 8)
            .uint("r1", 8)
            .uint("r2", 8)
            .build();
    pub static ref SET_LONG_REGISTER_GENERIC: Schema =
        register_long("SetLongRegister", MessageKind::Request, SET_LONG_REGISTER, 0)
            .bytes("data", 16)
            .build();
    pub static ref SET_LONG_REGISTER_RESPONSE: Schema =
        register_short("SetLongRegisterResponse", MessageKind::Response, SET_LONG_REGISTER, 0)
            .padding(24)
            .build();
    pub static ref GET_LONG_REGISTER_GENERIC: Schema =
        register_short("GetLongRegister", MessageKind::Request, GET_LONG_REGISTER, 0)
            .padding(24)
            .build();
    pub static ref GET_LONG_REGISTER_RESPONSE: Schema =
        register_long("GetLongRegisterResponse", MessageKind::Response, GET_LONG_REGISTER, 0)
            .bytes("data", 16)
            .build();

    // 0x00 EnableHidppReporting
    pub static ref SET_ENABLE_HIDPP_REPORTING: Schema = register_short(
        "SetEnableHidppReportingRequest",
        MessageKind::Request,
        SET_REGISTER,
        registers::ENABLE_HIDPP_REPORTING,
    )
    .uint("r0", 8)
    .padding(7)
    .uint("wireless_notifications", 1)
    .uint("r2", 8)
    .build();
    pub static ref SET_ENABLE_HIDPP_REPORTING_RESPONSE: Schema = register_short(
        "SetEnableHidppReportingResponse",
        MessageKind::Response,
        SET_REGISTER,
        registers::ENABLE_HIDPP_REPORTING,
    )
    .padding(24)
    .build();
    pub static ref GET_ENABLE_HIDPP_REPORTING: Schema = register_short(
        "GetEnableHidppReportingRequest",
        MessageKind::Request,
        GET_REGISTER,
        registers::ENABLE_HIDPP_REPORTING,
    )
    .padding(24)
    .build();
    pub static ref GET_ENABLE_HIDPP_REPORTING_RESPONSE: Schema = register_short(
        "GetEnableHidppReportingResponse",
        MessageKind::Response,
        GET_REGISTER,
        registers::ENABLE_HIDPP_REPORTING,
    )
    .uint("r0", 8)
    .padding(7)
    .uint("wireless_notifications", 1)
    .uint("r2", 8)
    .build();

    // 0x02 ConnectionState
    pub static ref SET_CONNECTION_STATE: Schema = register_short(
        "SetConnectionStateRequest",
        MessageKind::Request,
        SET_REGISTER,
        registers::CONNECTION_STATE,
    )
    .padding(6)
    .uint("fake_device_arrival", 1)
    .padding(1)
    .padding(16)
    .build();
    pub static ref SET_CONNECTION_STATE_RESPONSE: Schema = register_short(
        "SetConnectionStateResponse",
        MessageKind::Response,
        SET_REGISTER,
        registers::CONNECTION_STATE,
    )
    .padding(24)
    .build();
    pub static ref GET_CONNECTION_STATE: Schema = register_short(
        "GetConnectionStateRequest",
        MessageKind::Request,
        GET_REGISTER,
        registers::CONNECTION_STATE,
    )
    .padding(24)
    .build();
    pub static ref GET_CONNECTION_STATE_RESPONSE: Schema = register_short(
        "GetConnectionStateResponse",
        MessageKind::Response,
        GET_REGISTER,
        registers::CONNECTION_STATE,
    )
    .padding(8)
    .uint("number_of_connected_devices", 8)
    .padding(8)
    .build();

    // 0xC0 PerformDeviceDiscovery
    pub static ref SET_PERFORM_DEVICE_DISCOVERY: Schema = register_short(
        "SetPerformDeviceDiscoveryRequest",
        MessageKind::Request,
        SET_REGISTER,
        registers::PERFORM_DEVICE_DISCOVERY,
    )
    .uint("discovery_timeout", 8)
    .checked("discovery_option", 8, Check::OneOf(&[1, 2]))
    .padding(8)
    .build();
    pub static ref SET_PERFORM_DEVICE_DISCOVERY_RESPONSE: Schema = register_short(
        "SetPerformDeviceDiscoveryResponse",
        MessageKind::Response,
        SET_REGISTER,
        registers::PERFORM_DEVICE_DISCOVERY,
    )
    .padding(24)
    .build();

    // 0xB2 PerformDeviceConnection
    pub static ref SET_PERFORM_DEVICE_CONNECTION: Schema = register_long(
        "SetPerformDeviceConnectionRequest",
        MessageKind::Request,
        SET_LONG_REGISTER,
        registers::PERFORM_DEVICE_CONNECTION,
    )
    .checked("connect_devices", 8, Check::OneOf(&[1, 2, 3]))
    .bytes("bluetooth_address", 6)
    .padding(1)
    .uint("emu_2buttons_auth_method", 1)
    .uint("passkey_auth_method", 1)
    .checked("auth_entropy", 5, Check::Range { min: 0, max: 20 })
    .uint("pairing_slot", 8)
    .pad_to_end()
    .build();
    pub static ref SET_PERFORM_DEVICE_CONNECTION_RESPONSE: Schema = register_short(
        "SetPerformDeviceConnectionResponse",
        MessageKind::Response,
        SET_LONG_REGISTER,
        registers::PERFORM_DEVICE_CONNECTION,
    )
    .padding(24)
    .build();
}

pub(super) fn schemas() -> Vec<&'static Schema> {
    vec![
        &*SET_REGISTER_GENERIC,
        &*SET_REGISTER_RESPONSE,
        &*GET_REGISTER_GENERIC,
        &*GET_REGISTER_RESPONSE,
        &*SET_LONG_REGISTER_GENERIC,
        &*SET_LONG_REGISTER_RESPONSE,
        &*GET_LONG_REGISTER_GENERIC,
        &*GET_LONG_REGISTER_RESPONSE,
        &*SET_ENABLE_HIDPP_REPORTING,
        &*SET_ENABLE_HIDPP_REPORTING_RESPONSE,
        &*GET_ENABLE_HIDPP_REPORTING,
        &*GET_ENABLE_HIDPP_REPORTING_RESPONSE,
        &*SET_CONNECTION_STATE,
        &*SET_CONNECTION_STATE_RESPONSE,
        &*GET_CONNECTION_STATE,
        &*GET_CONNECTION_STATE_RESPONSE,
        &*SET_PERFORM_DEVICE_DISCOVERY,
        &*SET_PERFORM_DEVICE_DISCOVERY_RESPONSE,
        &*SET_PERFORM_DEVICE_CONNECTION,
        &*SET_PERFORM_DEVICE_CONNECTION_RESPONSE,
    ]
}

/// Authentication method requested in `PerformDeviceConnection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// Left/right button sequence, one bit per action.
    TwoButton,
    /// Decimal keyboard passkey, four bits per key.
    Passkey,
}

impl AuthMethod {
    /// Bits contributed by one user action.
    pub fn bits_per_action(self) -> u8 {
        match self {
            AuthMethod::TwoButton => 1,
            AuthMethod::Passkey => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AuthMethod::TwoButton => "two-button",
            AuthMethod::Passkey => "passkey",
        }
    }
}

/// Start or cancel device discovery.
pub fn perform_device_discovery(timeout_s: u8, option: DiscoveryOption) -> Result<Message, CodecError> {
    Message::new(&SET_PERFORM_DEVICE_DISCOVERY)
        .with("discovery_timeout", u64::from(timeout_s))?
        .with("discovery_option", u64::from(u8::from(option)))
}

/// Pairing request towards `address`.
pub fn perform_device_pairing(
    address: [u8; 6],
    method: AuthMethod,
    entropy: u8,
) -> Result<Message, CodecError> {
    Message::new(&SET_PERFORM_DEVICE_CONNECTION)
        .with("connect_devices", u64::from(u8::from(ConnectState::Pairing)))?
        .with_bytes("bluetooth_address", &address)?
        .with("emu_2buttons_auth_method", u64::from(method == AuthMethod::TwoButton))?
        .with("passkey_auth_method", u64::from(method == AuthMethod::Passkey))?
        .with("auth_entropy", u64::from(entropy))
}

/// Abort an ongoing pairing.
pub fn cancel_device_pairing() -> Result<Message, CodecError> {
    Message::new(&SET_PERFORM_DEVICE_CONNECTION)
        .with("connect_devices", u64::from(u8::from(ConnectState::CancelPairing)))
}

/// Clear a pairing slot.
pub fn perform_device_unpairing(pairing_slot: u8) -> Result<Message, CodecError> {
    Message::new(&SET_PERFORM_DEVICE_CONNECTION)
        .with("connect_devices", u64::from(u8::from(ConnectState::Unpairing)))?
        .with("pairing_slot", u64::from(pairing_slot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use crate::hidpp::LONG_REPORT_LEN;

    #[test]
    fn pairing_request_layout() {
        let addr = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01];
        let msg = perform_device_pairing(addr, AuthMethod::TwoButton, 4).unwrap();
        let encoded = encode(&msg).unwrap();
        assert_eq!(encoded.len(), LONG_REPORT_LEN);
        assert_eq!(&encoded[..5], &[0x11, 0xFF, 0x82, 0xB2, 0x01]);
        assert_eq!(&encoded[5..11], &addr);
        // 0 | 1 (two-button) | 0 (passkey) | 00100
        assert_eq!(encoded[11], 0x44);
    }

    #[test]
    fn passkey_flags() {
        let msg = perform_device_pairing([0; 6], AuthMethod::Passkey, 20).unwrap();
        let encoded = encode(&msg).unwrap();
        assert_eq!(encoded[11], 0x20 | 20);
    }

    #[test]
    fn entropy_above_twenty_is_rejected() {
        let msg = perform_device_pairing([0; 6], AuthMethod::Passkey, 24).unwrap();
        assert!(matches!(
            encode(&msg),
            Err(CodecError::ValueOutOfRange { field: "auth_entropy", .. })
        ));
    }

    #[test]
    fn unpair_carries_slot() {
        let encoded = encode(&perform_device_unpairing(3).unwrap()).unwrap();
        assert_eq!(encoded[4], 0x03);
        assert_eq!(encoded[12], 0x03);
    }

    #[test]
    fn discovery_request_layout() {
        let encoded = encode(&perform_device_discovery(10, DiscoveryOption::Start).unwrap()).unwrap();
        assert_eq!(encoded, vec![0x10, 0xFF, 0x80, 0xC0, 0x0A, 0x01, 0x00]);
    }

    #[test]
    fn fake_arrival_sets_bit_one() {
        let msg = Message::new(&SET_CONNECTION_STATE)
            .with("fake_device_arrival", 1)
            .unwrap();
        assert_eq!(
            encode(&msg).unwrap(),
            vec![0x10, 0xFF, 0x80, 0x02, 0x02, 0x00, 0x00]
        );
    }
}
