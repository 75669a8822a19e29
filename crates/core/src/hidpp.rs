//! HID++ wire framing.
//!
//! HID++ uses two report formats:
//! - Short reports: 7 bytes (report ID 0x10)
//! - Long reports: 20 bytes (report ID 0x11)
//!
//! Every HID++ report starts with the same 4-byte header:
//! `[report_id, device_index, feature_index | sub_id, function<<4 | sw_id | address]`.

use crate::error::{CodecError, Result};

/// HID++ report ID for short messages (7 bytes total).
pub const SHORT_REPORT_ID: u8 = 0x10;
/// HID++ report ID for long messages (20 bytes total).
pub const LONG_REPORT_ID: u8 = 0x11;

/// Short report length (including report ID).
pub const SHORT_REPORT_LEN: usize = 7;
/// Long report length (including report ID).
pub const LONG_REPORT_LEN: usize = 20;

/// Header length shared by both report formats.
pub const HEADER_LEN: usize = 4;

/// Device index addressing the receiver itself.
pub const RECEIVER_DEVICE_INDEX: u8 = 0xFF;

/// Feature index byte marking a HID++ 2.0 error report.
pub const HIDPP2_ERROR_TAG: u8 = 0xFF;
/// Sub-id marking a HID++ 1.0 error report.
pub const HIDPP1_ERROR_TAG: u8 = 0x8F;

/// Software id used when a frame carries no usable tag (HID++1 errors).
pub const NO_SOFTWARE_ID: u8 = 0x0F;

/// HID++ 2.0 well-known feature IDs.
pub mod features {
    /// Root feature, device ping and feature index lookup.
    pub const ROOT: u16 = 0x0000;
    /// Feature set, enumerate all supported features.
    pub const FEATURE_SET: u16 = 0x0001;
    /// Device name and type.
    pub const DEVICE_NAME: u16 = 0x0005;
    /// Battery status (legacy).
    pub const BATTERY_STATUS: u16 = 0x1000;
    /// Unified battery.
    pub const UNIFIED_BATTERY: u16 = 0x1004;
    /// Wireless device status broadcast.
    pub const WIRELESS_DEVICE_STATUS: u16 = 0x1D4B;
    /// Per-key lighting v2.
    pub const PER_KEY_LIGHTING_V2: u16 = 0x8081;
}

/// HID++ 1.0 sub-ids.
pub mod sub_ids {
    pub const DEVICE_DISCONNECTION: u8 = 0x40;
    pub const DEVICE_CONNECTION: u8 = 0x41;
    pub const DISCOVERY_STATUS: u8 = 0x4A;
    pub const PAIRING_STATUS: u8 = 0x4E;
    pub const DEVICE_DISCOVERY: u8 = 0x4F;
    pub const REQUEST_DISPLAY_PASSKEY: u8 = 0x50;
    pub const DISPLAY_PASSKEY_KEY: u8 = 0x51;
    pub const SET_REGISTER: u8 = 0x80;
    pub const GET_REGISTER: u8 = 0x81;
    pub const SET_LONG_REGISTER: u8 = 0x82;
    pub const GET_LONG_REGISTER: u8 = 0x83;
    pub const ERROR: u8 = super::HIDPP1_ERROR_TAG;

    /// Whether a sub-id addresses a receiver register.
    pub fn is_register(sub_id: u8) -> bool {
        (SET_REGISTER..=GET_LONG_REGISTER).contains(&sub_id)
    }

    /// Sub-ids the receiver emits as notifications.
    pub fn is_receiver_notification(sub_id: u8) -> bool {
        matches!(
            sub_id,
            DEVICE_DISCONNECTION
                | DEVICE_CONNECTION
                | DISCOVERY_STATUS
                | PAIRING_STATUS
                | DEVICE_DISCOVERY
                | REQUEST_DISPLAY_PASSKEY
                | DISPLAY_PASSKEY_KEY
        )
    }
}

/// HID++ 1.0 receiver register addresses.
pub mod registers {
    pub const ENABLE_HIDPP_REPORTING: u8 = 0x00;
    pub const CONNECTION_STATE: u8 = 0x02;
    pub const PERFORM_DEVICE_CONNECTION: u8 = 0xB2;
    pub const PERFORM_DEVICE_DISCOVERY: u8 = 0xC0;
}

/// The four routing bytes at the start of every HID++ report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Header {
    pub report_id: u8,
    /// Device index on the receiver (0xFF for receiver itself, 0x01..0x06 for paired devices).
    pub device_index: u8,
    /// Feature index (HID++ 2.0) or sub-id (HID++ 1.0).
    pub feature_index: u8,
    /// Function ID (bits 7:4) and software ID (bits 3:0), or register address.
    pub function_sw: u8,
}

impl Header {
    /// Parse the header of a HID++ report.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::LengthMismatch {
                schema: "header",
                expected: HEADER_LEN,
                actual: data.len(),
            }
            .into());
        }
        Ok(Self {
            report_id: data[0],
            device_index: data[1],
            feature_index: data[2],
            function_sw: data[3],
        })
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        [
            self.report_id,
            self.device_index,
            self.feature_index,
            self.function_sw,
        ]
    }

    /// Extract the function ID from the function_sw byte.
    pub fn function(&self) -> u8 {
        self.function_sw >> 4
    }

    /// Extract the software ID (request tag) from the function_sw byte.
    pub fn software_id(&self) -> u8 {
        self.function_sw & 0x0F
    }

    /// Replace the software ID, keeping the function nibble.
    pub fn set_software_id(&mut self, sw_id: u8) {
        self.function_sw = (self.function_sw & 0xF0) | (sw_id & 0x0F);
    }

    pub fn set_function(&mut self, function: u8) {
        self.function_sw = ((function & 0x0F) << 4) | (self.function_sw & 0x0F);
    }

    pub fn sub_id(&self) -> u8 {
        self.feature_index
    }

    pub fn address(&self) -> u8 {
        self.function_sw
    }

    pub fn is_long(&self) -> bool {
        self.report_id == LONG_REPORT_ID
    }
}

/// Expected total length for a HID++ report id.
pub fn report_len(report_id: u8) -> Option<usize> {
    match report_id {
        SHORT_REPORT_ID => Some(SHORT_REPORT_LEN),
        LONG_REPORT_ID => Some(LONG_REPORT_LEN),
        _ => None,
    }
}

/// Report id for a given total length.
pub fn report_id_for_len(len: usize) -> Option<u8> {
    match len {
        SHORT_REPORT_LEN => Some(SHORT_REPORT_ID),
        LONG_REPORT_LEN => Some(LONG_REPORT_ID),
        _ => None,
    }
}

/// First-pass classification of an inbound report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Any report that is not a well-formed HID++ report.
    Hid { report_id: u8 },
    /// HID++ 2.0 error: `[rid, dev, 0xFF, feature_index, function_sw, code, ..]`.
    Hidpp2Error {
        header: Header,
        feature_index: u8,
        function_sw: u8,
        code: u8,
    },
    /// HID++ 1.0 error: `[0x10, dev, 0x8F, sub_id, address, code, 0]`.
    Hidpp1Error {
        header: Header,
        sub_id: u8,
        address: u8,
        code: u8,
    },
    /// Regular HID++ 1.0 or 2.0 report.
    Hidpp(Header),
}

impl FrameKind {
    pub fn classify(data: &[u8]) -> Self {
        let report_id = data.first().copied().unwrap_or(0);
        let well_formed = report_len(report_id).is_some_and(|len| data.len() == len);
        if !well_formed {
            return Self::Hid { report_id };
        }

        let header = Header {
            report_id,
            device_index: data[1],
            feature_index: data[2],
            function_sw: data[3],
        };
        match header.feature_index {
            HIDPP2_ERROR_TAG => Self::Hidpp2Error {
                header,
                feature_index: data[3],
                function_sw: data[4],
                code: data[5],
            },
            HIDPP1_ERROR_TAG => Self::Hidpp1Error {
                header,
                sub_id: data[3],
                address: data[4],
                code: data[5],
            },
            _ => Self::Hidpp(header),
        }
    }
}
