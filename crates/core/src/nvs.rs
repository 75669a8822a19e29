//! `NVS_BLE_BOND_ID_{n}` chunk parsing.
//!
//! The receiver stores one peer bond per pairing slot; the device stores
//! one master bond per host. Both are parsed with the bitfield codec and
//! surfaced as a single [`BleBondId`]. Fields only one side persists are
//! `None` on the other.

use crate::codec::{decode, HeaderKind, Message, MessageKind, Schema, SchemaBuilder};
use crate::error::CodecError;
use crate::messages::{byte_array, uint};
use crate::protocol::{BleProAuthentication, OsDetectedType};
use lazy_static::lazy_static;

pub const RECEIVER_BOND_LEN: usize = 120;
pub const DEVICE_BOND_V1_LEN: usize = 168;
/// Version 2 appends the 4-byte BLE Pro attributes word.
pub const DEVICE_BOND_V2_LEN: usize = 172;

/// Keys of one side of the bond.
fn keys(builder: SchemaBuilder, side: Side, enc_padding: usize) -> SchemaBuilder {
    builder
        .bytes(side.field("ltk"), 16)
        .uint(side.field("ltk_len"), 6)
        .uint(side.field("auth"), 1)
        .uint(side.field("lesc"), 1)
        .padding(enc_padding)
        .bytes(side.field("ediv"), 2)
        .bytes(side.field("rand"), 8)
        .bytes(side.field("irk"), 16)
        .bytes(side.field("identity_address"), 7)
}

fn address(builder: SchemaBuilder, prefix: &'static str) -> SchemaBuilder {
    let (kind, rpa, addr) = match prefix {
        "master" => (
            "master_address_type",
            "master_resolvable_private_address",
            "master_address",
        ),
        _ => ("address_type", "resolvable_private_address", "bluetooth_address"),
    };
    builder.uint(kind, 7).uint(rpa, 1).bytes(addr, 6)
}

fn device_bond(name: &'static str, length: usize) -> SchemaBuilder {
    let builder = Schema::builder(name, MessageKind::Structure, HeaderKind::None, length)
        .uint("is_master_paired", 32)
        .bytes("auth_status", 6);
    let builder = keys(builder, Side::Local, 8).bytes("local_csrk", 16);
    let builder = keys(builder, Side::Remote, 16)
        .bytes("remote_csrk", 16)
        .padding(8);
    address(address(builder, "master").padding(24).uint("os_detected_type", 8).padding(24), "device")
        .padding(8)
}

lazy_static! {
    pub static ref RECEIVER_BLE_BOND_ID: Schema = {
        let builder = address(
            Schema::builder(
                "ReceiverBleBondId",
                MessageKind::Structure,
                HeaderKind::None,
                RECEIVER_BOND_LEN,
            ),
            "device",
        )
        .padding(8)
        .bytes("auth_status", 6);
        let builder = keys(builder, Side::Local, 8).padding(8);
        keys(builder, Side::Remote, 8)
            .padding(8)
            .uint("entropy", 8)
            .uint("auth_control", 8)
            .build()
    };
    pub static ref DEVICE_BLE_BOND_ID_V1: Schema =
        device_bond("DeviceBleBondIdV1", DEVICE_BOND_V1_LEN).build();
    pub static ref DEVICE_BLE_BOND_ID_V2: Schema = device_bond("DeviceBleBondIdV2", DEVICE_BOND_V2_LEN)
        .padding(7)
        .uint("suppress_first_report_latency", 1)
        .bytes("ble_pro_attributes", 3)
        .build();
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Local,
    Remote,
}

impl Side {
    fn field(self, name: &'static str) -> &'static str {
        match (self, name) {
            (Side::Local, "ltk") => "local_ltk",
            (Side::Local, "ltk_len") => "local_ltk_len",
            (Side::Local, "auth") => "local_auth",
            (Side::Local, "lesc") => "local_lesc",
            (Side::Local, "ediv") => "local_ediv",
            (Side::Local, "rand") => "local_rand",
            (Side::Local, "irk") => "local_irk",
            (Side::Local, _) => "local_identity_address",
            (Side::Remote, "ltk") => "remote_ltk",
            (Side::Remote, "ltk_len") => "remote_ltk_len",
            (Side::Remote, "auth") => "remote_auth",
            (Side::Remote, "lesc") => "remote_lesc",
            (Side::Remote, "ediv") => "remote_ediv",
            (Side::Remote, "rand") => "remote_rand",
            (Side::Remote, "irk") => "remote_irk",
            (Side::Remote, _) => "remote_identity_address",
        }
    }
}

/// Chunk name for a pairing slot.
pub fn chunk_name(slot: u8) -> String {
    format!("NVS_BLE_BOND_ID_{slot}")
}

/// Master identification: EDIV and RAND, as stored (little-endian EDIV).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterIdentification {
    pub ediv: u16,
    pub rand: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BondKeys {
    pub long_term_key: [u8; 16],
    pub identity_resolving_key: [u8; 16],
    pub master_identification: MasterIdentification,
}

impl BondKeys {
    fn read(message: &Message, side: Side) -> Result<Self, CodecError> {
        let ediv: [u8; 2] = byte_array(message, side.field("ediv"))?;
        Ok(Self {
            long_term_key: byte_array(message, side.field("ltk"))?,
            identity_resolving_key: byte_array(message, side.field("irk"))?,
            master_identification: MasterIdentification {
                ediv: u16::from_le_bytes(ediv),
                rand: byte_array(message, side.field("rand"))?,
            },
        })
    }
}

/// Which firmware wrote the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondOrigin {
    Receiver,
    Device { version: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleBondId {
    pub origin: BondOrigin,
    pub bluetooth_address: [u8; 6],
    pub local: BondKeys,
    pub remote: BondKeys,
    /// Passkey entropy negotiated at pairing (receiver side).
    pub entropy: Option<u8>,
    pub authentication: Option<BleProAuthentication>,
    /// Host the device believes it is bonded with (device side).
    pub os_detected_type: Option<OsDetectedType>,
    pub suppress_first_report_latency: Option<bool>,
}

impl BleBondId {
    /// Parse a chunk, picking the layout from its length.
    pub fn parse(chunk: &[u8]) -> Result<Self, CodecError> {
        let (schema, origin): (&'static Schema, _) = match chunk.len() {
            RECEIVER_BOND_LEN => (&*RECEIVER_BLE_BOND_ID, BondOrigin::Receiver),
            DEVICE_BOND_V1_LEN => (&*DEVICE_BLE_BOND_ID_V1, BondOrigin::Device { version: 1 }),
            DEVICE_BOND_V2_LEN => (&*DEVICE_BLE_BOND_ID_V2, BondOrigin::Device { version: 2 }),
            actual => {
                return Err(CodecError::LengthMismatch {
                    schema: "BleBondId",
                    expected: DEVICE_BOND_V2_LEN,
                    actual,
                })
            }
        };
        let message = decode(chunk, schema)?;
        let receiver = origin == BondOrigin::Receiver;
        Ok(Self {
            origin,
            bluetooth_address: byte_array(&message, "bluetooth_address")?,
            local: BondKeys::read(&message, Side::Local)?,
            remote: BondKeys::read(&message, Side::Remote)?,
            entropy: receiver
                .then(|| uint(&message, "entropy").map(|v| v as u8))
                .transpose()?,
            authentication: receiver
                .then(|| uint(&message, "auth_control").map(|v| BleProAuthentication::from(v as u8)))
                .transpose()?,
            os_detected_type: (!receiver)
                .then(|| uint(&message, "os_detected_type").map(|v| OsDetectedType::from(v as u8)))
                .transpose()?,
            suppress_first_report_latency: (origin == BondOrigin::Device { version: 2 })
                .then(|| uint(&message, "suppress_first_report_latency").map(|v| v == 1))
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: [u8; 6] = [0x01, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA];

    #[test]
    fn layouts_fill_their_length() {
        assert!(RECEIVER_BLE_BOND_ID.validate().is_ok());
        assert!(DEVICE_BLE_BOND_ID_V1.validate().is_ok());
        assert!(DEVICE_BLE_BOND_ID_V2.validate().is_ok());
    }

    #[test]
    fn receiver_chunk() {
        let mut chunk = vec![0u8; RECEIVER_BOND_LEN];
        chunk[0] = 0x02;
        chunk[1..7].copy_from_slice(&ADDRESS);
        // local LTK, then the EDIV after enc info (17) and padding (1)
        chunk[14..30].copy_from_slice(&[0x11; 16]);
        chunk[32..34].copy_from_slice(&[0x34, 0x12]);
        chunk[34..42].copy_from_slice(&[0x5A; 8]);
        chunk[42..58].copy_from_slice(&[0x22; 16]);
        chunk[118] = 12;
        chunk[119] = 0x01;

        let bond = BleBondId::parse(&chunk).unwrap();
        assert_eq!(bond.origin, BondOrigin::Receiver);
        assert_eq!(bond.bluetooth_address, ADDRESS);
        assert_eq!(bond.local.long_term_key, [0x11; 16]);
        assert_eq!(bond.local.master_identification.ediv, 0x1234);
        assert_eq!(bond.local.master_identification.rand, [0x5A; 8]);
        assert_eq!(bond.local.identity_resolving_key, [0x22; 16]);
        assert_eq!(bond.entropy, Some(12));
        assert_eq!(bond.authentication, Some(BleProAuthentication::KeyboardPasskey));
        assert_eq!(bond.os_detected_type, None);
        assert_eq!(bond.suppress_first_report_latency, None);
    }

    #[test]
    fn device_chunk_v2() {
        let mut chunk = vec![0u8; DEVICE_BOND_V2_LEN];
        chunk[0..4].copy_from_slice(&[1, 0, 0, 0]);
        chunk[156] = 0x04;
        chunk[161..167].copy_from_slice(&ADDRESS);
        chunk[168] = 0x01;

        let bond = BleBondId::parse(&chunk).unwrap();
        assert_eq!(bond.origin, BondOrigin::Device { version: 2 });
        assert_eq!(bond.bluetooth_address, ADDRESS);
        assert_eq!(bond.os_detected_type, Some(OsDetectedType::LogitechBlePro));
        assert_eq!(bond.suppress_first_report_latency, Some(true));
        assert_eq!(bond.entropy, None);
    }

    #[test]
    fn device_chunk_v1_keeps_unknown_os_type() {
        let mut chunk = vec![0u8; DEVICE_BOND_V1_LEN];
        chunk[156] = 0x42;
        let bond = BleBondId::parse(&chunk).unwrap();
        assert_eq!(bond.origin, BondOrigin::Device { version: 1 });
        assert_eq!(bond.os_detected_type, Some(OsDetectedType::Other(0x42)));
        assert_eq!(bond.suppress_first_report_latency, None);
    }

    #[test]
    fn unknown_length_is_rejected() {
        assert!(matches!(
            BleBondId::parse(&[0u8; 50]),
            Err(CodecError::LengthMismatch { actual: 50, .. })
        ));
    }

    #[test]
    fn chunk_names() {
        assert_eq!(chunk_name(3), "NVS_BLE_BOND_ID_3");
    }
}
