//! Receiver notifications and their typed views.
//!
//! Notifications carry a three-byte header `[rid, dev, sub_id]`; their body
//! starts at byte 3.

use super::{byte_array, expect_schema, notification, uint};
use crate::codec::{decode, HeaderKind, Message, MessageKind, Schema};
use crate::error::CodecError;
use crate::hidpp::{sub_ids, LONG_REPORT_LEN, SHORT_REPORT_LEN};
use crate::protocol::{
    BleProAuthentication, DeviceType, DisconnectionType, DiscoveryStatusCode, LinkStatus,
    LogitechProtocol, PairingStatusCode, PasskeyKeyCode, StatusErrorType,
};
use lazy_static::lazy_static;

/// Bytes of payload carried by one `DeviceDiscovery` part.
pub const DISCOVERY_DATA_LEN: usize = 14;

lazy_static! {
    pub static ref DEVICE_DISCONNECTION: Schema =
        notification("DeviceDisconnection", sub_ids::DEVICE_DISCONNECTION, SHORT_REPORT_LEN)
            .uint("disconnection_type", 8)
            .padding(24)
            .build();
    pub static ref DEVICE_CONNECTION: Schema =
        notification("DeviceConnection", sub_ids::DEVICE_CONNECTION, SHORT_REPORT_LEN)
            .uint("protocol_type", 8)
            .padding(1)
            .uint("link_status", 1)
            .uint("encrypted", 1)
            .padding(1)
            .uint("device_type", 4)
            .uint("bluetooth_pid", 16)
            .build();
    pub static ref DISCOVERY_STATUS: Schema =
        notification("DiscoveryStatus", sub_ids::DISCOVERY_STATUS, SHORT_REPORT_LEN)
            .uint("device_discovery_status", 8)
            .uint("error_type", 8)
            .padding(16)
            .build();
    pub static ref PAIRING_STATUS: Schema =
        notification("PairingStatus", sub_ids::PAIRING_STATUS, LONG_REPORT_LEN)
            .uint("device_pairing_status", 8)
            .uint("error_type", 8)
            .bytes("bluetooth_address", 6)
            .uint("pairing_slot", 8)
            .pad_to_end()
            .build();
    pub static ref DEVICE_DISCOVERY: Schema =
        notification("DeviceDiscovery", sub_ids::DEVICE_DISCOVERY, LONG_REPORT_LEN)
            .uint("counter_lsb", 8)
            .uint("counter_msb", 8)
            .uint("notification_part", 8)
            .bytes("data", DISCOVERY_DATA_LEN)
            .build();
    pub static ref REQUEST_DISPLAY_PASSKEY: Schema =
        notification("RequestDisplayPassKey", sub_ids::REQUEST_DISPLAY_PASSKEY, LONG_REPORT_LEN)
            .bytes("bluetooth_address", 6)
            .with_default("passkey_length", 8, PASSKEY_DIGITS as u64)
            .bytes("passkey_digits", PASSKEY_DIGITS)
            .pad_to_end()
            .build();
    pub static ref DISPLAY_PASSKEY_KEY: Schema =
        notification("DisplayPassKeyKey", sub_ids::DISPLAY_PASSKEY_KEY, LONG_REPORT_LEN)
            .uint("key_code", 8)
            .bytes("bluetooth_address", 6)
            .pad_to_end()
            .build();

    // DeviceDiscovery payloads, selected by notification_part.
    pub static ref DISCOVERY_DEVICE_INFO: Schema = Schema::builder(
        "DiscoveryDeviceInfo",
        MessageKind::Structure,
        HeaderKind::None,
        DISCOVERY_DATA_LEN,
    )
    .uint("protocol_type", 8)
    .padding(4)
    .uint("device_type", 4)
    .uint("bluetooth_pid", 16)
    .bytes("bluetooth_address", 6)
    .uint("authentication", 8)
    .pad_to_end()
    .build();
    pub static ref DISCOVERY_NAME_START: Schema = Schema::builder(
        "DiscoveryNameStart",
        MessageKind::Structure,
        HeaderKind::None,
        DISCOVERY_DATA_LEN,
    )
    .uint("name_length", 8)
    .bytes("name", DISCOVERY_DATA_LEN - 1)
    .build();
    pub static ref DISCOVERY_NAME_CONTINUATION: Schema = Schema::builder(
        "DiscoveryNameContinuation",
        MessageKind::Structure,
        HeaderKind::None,
        DISCOVERY_DATA_LEN,
    )
    .bytes("name", DISCOVERY_DATA_LEN)
    .build();
}

/// Decimal digits in the passkey announced by `RequestDisplayPassKey`.
pub const PASSKEY_DIGITS: usize = 6;

pub(super) fn schemas() -> Vec<&'static Schema> {
    vec![
        &*DEVICE_DISCONNECTION,
        &*DEVICE_CONNECTION,
        &*DISCOVERY_STATUS,
        &*PAIRING_STATUS,
        &*DEVICE_DISCOVERY,
        &*REQUEST_DISPLAY_PASSKEY,
        &*DISPLAY_PASSKEY_KEY,
        &*DISCOVERY_DEVICE_INFO,
        &*DISCOVERY_NAME_START,
        &*DISCOVERY_NAME_CONTINUATION,
    ]
}

/// `0x41`: a pairing slot's link came up or went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConnection {
    pub device_index: u8,
    pub protocol: LogitechProtocol,
    pub link_status: LinkStatus,
    pub encrypted: bool,
    pub device_type: DeviceType,
    pub bluetooth_pid: u16,
}

impl TryFrom<&Message> for DeviceConnection {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &DEVICE_CONNECTION)?;
        Ok(Self {
            device_index: message.header.device_index,
            protocol: LogitechProtocol::from(uint(message, "protocol_type")? as u8),
            link_status: LinkStatus::from_bit(uint(message, "link_status")?),
            encrypted: uint(message, "encrypted")? == 1,
            device_type: DeviceType::from(uint(message, "device_type")? as u8),
            bluetooth_pid: uint(message, "bluetooth_pid")? as u16,
        })
    }
}

impl DeviceConnection {
    /// Build the notification a receiver sends for this slot.
    pub fn to_message(&self) -> Result<Message, CodecError> {
        Message::new(&DEVICE_CONNECTION)
            .with_device_index(self.device_index)
            .with("protocol_type", u64::from(u8::from(self.protocol)))?
            .with("link_status", self.link_status.bit())?
            .with("encrypted", u64::from(self.encrypted))?
            .with("device_type", u64::from(u8::from(self.device_type)))?
            .with("bluetooth_pid", u64::from(self.bluetooth_pid))
    }
}

/// `0x40`: a slot disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDisconnection {
    pub device_index: u8,
    pub disconnection_type: DisconnectionType,
}

impl TryFrom<&Message> for DeviceDisconnection {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &DEVICE_DISCONNECTION)?;
        Ok(Self {
            device_index: message.header.device_index,
            disconnection_type: DisconnectionType::from(uint(message, "disconnection_type")? as u8),
        })
    }
}

/// `0x4A`: discovery started or stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryStatus {
    pub status: DiscoveryStatusCode,
    pub error_type: StatusErrorType,
}

impl TryFrom<&Message> for DiscoveryStatus {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &DISCOVERY_STATUS)?;
        Ok(Self {
            status: DiscoveryStatusCode::from(uint(message, "device_discovery_status")? as u8),
            error_type: StatusErrorType::from(uint(message, "error_type")? as u8),
        })
    }
}

/// `0x4E`: pairing started, stopped or was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingStatus {
    pub status: PairingStatusCode,
    pub error_type: StatusErrorType,
    pub bluetooth_address: [u8; 6],
    pub pairing_slot: u8,
}

impl TryFrom<&Message> for PairingStatus {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &PAIRING_STATUS)?;
        Ok(Self {
            status: PairingStatusCode::from(uint(message, "device_pairing_status")? as u8),
            error_type: StatusErrorType::from(uint(message, "error_type")? as u8),
            bluetooth_address: byte_array(message, "bluetooth_address")?,
            pairing_slot: uint(message, "pairing_slot")? as u8,
        })
    }
}

impl PairingStatus {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        Message::new(&PAIRING_STATUS)
            .with("device_pairing_status", u64::from(u8::from(self.status)))?
            .with("error_type", u64::from(u8::from(self.error_type)))?
            .with_bytes("bluetooth_address", &self.bluetooth_address)?
            .with("pairing_slot", u64::from(self.pairing_slot))
    }
}

/// `0x50`: the receiver shows the passkey the user must reproduce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDisplayPassKey {
    pub bluetooth_address: [u8; 6],
    /// ASCII decimal digits.
    pub passkey: String,
}

impl TryFrom<&Message> for RequestDisplayPassKey {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &REQUEST_DISPLAY_PASSKEY)?;
        let length = (uint(message, "passkey_length")? as usize).min(PASSKEY_DIGITS);
        let digits: [u8; PASSKEY_DIGITS] = byte_array(message, "passkey_digits")?;
        Ok(Self {
            bluetooth_address: byte_array(message, "bluetooth_address")?,
            passkey: String::from_utf8_lossy(&digits[..length]).into_owned(),
        })
    }
}

impl RequestDisplayPassKey {
    /// Passkey as a number; non-digit characters count as zero.
    pub fn value(&self) -> u32 {
        self.passkey
            .bytes()
            .map(|b| if b.is_ascii_digit() { u32::from(b - b'0') } else { 0 })
            .fold(0, |acc, digit| acc * 10 + digit)
    }

    pub fn to_message(&self) -> Result<Message, CodecError> {
        let mut digits = [b'0'; PASSKEY_DIGITS];
        for (slot, b) in digits.iter_mut().zip(self.passkey.bytes()) {
            *slot = b;
        }
        Message::new(&REQUEST_DISPLAY_PASSKEY)
            .with_bytes("bluetooth_address", &self.bluetooth_address)?
            .with("passkey_length", self.passkey.len().min(PASSKEY_DIGITS) as u64)?
            .with_bytes("passkey_digits", &digits)
    }
}

/// `0x51`: progress of the user's passkey entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayPassKeyKey {
    pub key_code: PasskeyKeyCode,
    pub bluetooth_address: [u8; 6],
}

impl TryFrom<&Message> for DisplayPassKeyKey {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &DISPLAY_PASSKEY_KEY)?;
        Ok(Self {
            key_code: PasskeyKeyCode::from(uint(message, "key_code")? as u8),
            bluetooth_address: byte_array(message, "bluetooth_address")?,
        })
    }
}

impl DisplayPassKeyKey {
    pub fn to_message(&self) -> Result<Message, CodecError> {
        Message::new(&DISPLAY_PASSKEY_KEY)
            .with("key_code", u64::from(u8::from(self.key_code)))?
            .with_bytes("bluetooth_address", &self.bluetooth_address)
    }
}

/// One `0x4F` part, with its payload decoded by part number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryPart {
    DeviceInfo {
        protocol: LogitechProtocol,
        device_type: DeviceType,
        bluetooth_pid: u16,
        bluetooth_address: [u8; 6],
        authentication: BleProAuthentication,
    },
    NameStart {
        name_length: u8,
        chunk: Vec<u8>,
    },
    NameContinuation {
        chunk: Vec<u8>,
    },
    Unknown {
        part: u8,
    },
}

/// `0x4F`: one part of a discovered device advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDiscovery {
    pub counter: u16,
    pub part: DiscoveryPart,
}

impl TryFrom<&Message> for DeviceDiscovery {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &DEVICE_DISCOVERY)?;
        let counter = ((uint(message, "counter_msb")? << 8) | uint(message, "counter_lsb")?) as u16;
        let data: [u8; DISCOVERY_DATA_LEN] = byte_array(message, "data")?;
        let part = match uint(message, "notification_part")? as u8 {
            0 => {
                let info = decode(&data, &DISCOVERY_DEVICE_INFO)?;
                DiscoveryPart::DeviceInfo {
                    protocol: LogitechProtocol::from(uint(&info, "protocol_type")? as u8),
                    device_type: DeviceType::from(uint(&info, "device_type")? as u8),
                    bluetooth_pid: uint(&info, "bluetooth_pid")? as u16,
                    bluetooth_address: byte_array(&info, "bluetooth_address")?,
                    authentication: BleProAuthentication::from(uint(&info, "authentication")? as u8),
                }
            }
            1 => {
                let start = decode(&data, &DISCOVERY_NAME_START)?;
                DiscoveryPart::NameStart {
                    name_length: uint(&start, "name_length")? as u8,
                    chunk: start.bytes("name").unwrap_or_default().to_vec(),
                }
            }
            2 => DiscoveryPart::NameContinuation {
                chunk: data.to_vec(),
            },
            part => DiscoveryPart::Unknown { part },
        };
        Ok(Self { counter, part })
    }
}

impl DeviceDiscovery {
    /// Build a part-0 notification.
    pub fn device_info_message(
        counter: u16,
        protocol: LogitechProtocol,
        device_type: DeviceType,
        bluetooth_pid: u16,
        bluetooth_address: [u8; 6],
        authentication: BleProAuthentication,
    ) -> Result<Message, CodecError> {
        let info = Message::new(&DISCOVERY_DEVICE_INFO)
            .with("protocol_type", u64::from(u8::from(protocol)))?
            .with("device_type", u64::from(u8::from(device_type)))?
            .with("bluetooth_pid", u64::from(bluetooth_pid))?
            .with_bytes("bluetooth_address", &bluetooth_address)?
            .with("authentication", u64::from(u8::from(authentication)))?;
        let data = crate::codec::encode(&info)?;
        Self::raw_part(counter, 0, &data)
    }

    /// Build a name part (1 or 2) carrying `data`, zero padded.
    pub fn raw_part(counter: u16, part: u8, data: &[u8]) -> Result<Message, CodecError> {
        let mut payload = [0u8; DISCOVERY_DATA_LEN];
        let len = data.len().min(DISCOVERY_DATA_LEN);
        payload[..len].copy_from_slice(&data[..len]);
        Message::new(&DEVICE_DISCOVERY)
            .with("counter_lsb", u64::from(counter & 0xFF))?
            .with("counter_msb", u64::from(counter >> 8))?
            .with("notification_part", u64::from(part))?
            .with_bytes("data", &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;

    #[test]
    fn device_connection_layout() {
        let view = DeviceConnection {
            device_index: 0x02,
            protocol: LogitechProtocol::BlePro,
            link_status: LinkStatus::NotEstablished,
            encrypted: true,
            device_type: DeviceType::Mouse,
            bluetooth_pid: 0xB023,
        };
        let encoded = encode(&view.to_message().unwrap()).unwrap();
        // reserved 0 | link 1 | encrypted 1 | reserved 0 | type 0010
        assert_eq!(encoded, vec![0x10, 0x02, 0x41, 0x10, 0x62, 0xB0, 0x23]);
        let decoded = decode(&encoded, &DEVICE_CONNECTION).unwrap();
        assert_eq!(DeviceConnection::try_from(&decoded).unwrap(), view);
    }

    #[test]
    fn pairing_status_slot() {
        let mut raw = vec![0x11, 0xFF, 0x4E, 0x01, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01, 0x03];
        raw.resize(LONG_REPORT_LEN, 0);
        let msg = decode(&raw, &PAIRING_STATUS).unwrap();
        let view = PairingStatus::try_from(&msg).unwrap();
        assert_eq!(view.status, PairingStatusCode::Stop);
        assert_eq!(view.error_type, StatusErrorType::NoError);
        assert_eq!(view.pairing_slot, 3);
        assert_eq!(view.bluetooth_address, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
    }

    #[test]
    fn passkey_value_parses_digits() {
        let view = RequestDisplayPassKey {
            bluetooth_address: [1; 6],
            passkey: "012345".into(),
        };
        assert_eq!(view.value(), 12345);
        let msg = view.to_message().unwrap();
        assert_eq!(RequestDisplayPassKey::try_from(&msg).unwrap(), view);
    }

    #[test]
    fn discovery_device_info_part() {
        let addr = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01];
        let msg = DeviceDiscovery::device_info_message(
            7,
            LogitechProtocol::BlePro,
            DeviceType::Keyboard,
            0xB350,
            addr,
            BleProAuthentication::TwoButtonsPasskey,
        )
        .unwrap();
        let encoded = encode(&msg).unwrap();
        assert_eq!(&encoded[..7], &[0x11, 0xFF, 0x4F, 0x07, 0x00, 0x00, 0x10]);
        let view = DeviceDiscovery::try_from(&decode(&encoded, &DEVICE_DISCOVERY).unwrap()).unwrap();
        assert_eq!(view.counter, 7);
        match view.part {
            DiscoveryPart::DeviceInfo {
                bluetooth_address,
                bluetooth_pid,
                device_type,
                ..
            } => {
                assert_eq!(bluetooth_address, addr);
                assert_eq!(bluetooth_pid, 0xB350);
                assert_eq!(device_type, DeviceType::Keyboard);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn discovery_name_parts() {
        let mut first = vec![5u8];
        first.extend_from_slice(b"MX Ke");
        let msg = DeviceDiscovery::raw_part(1, 1, &first).unwrap();
        match DeviceDiscovery::try_from(&msg).unwrap().part {
            DiscoveryPart::NameStart { name_length, chunk } => {
                assert_eq!(name_length, 5);
                assert_eq!(&chunk[..5], b"MX Ke");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn view_rejects_wrong_class() {
        let msg = Message::new(&DISPLAY_PASSKEY_KEY);
        assert!(PairingStatus::try_from(&msg).is_err());
    }
}
