//! HID++ 2.0 feature messages.

use super::{expect_schema, feature_long, feature_short, uint};
use crate::codec::{Message, MessageKind, Schema};
use crate::error::CodecError;
use lazy_static::lazy_static;

lazy_static! {
    // Root 0x0000
    pub static ref GET_FEATURE: Schema = feature_short("GetFeature", MessageKind::Request, 0)
        .uint("feature_id", 16)
        .padding(8)
        .build();
    pub static ref GET_FEATURE_RESPONSE: Schema =
        feature_short("GetFeatureResponse", MessageKind::Response, 0)
            .uint("feature_index", 8)
            .uint("feature_type", 8)
            .uint("feature_version", 8)
            .build();
    pub static ref GET_PROTOCOL_VERSION: Schema =
        feature_short("GetProtocolVersion", MessageKind::Request, 1)
            .padding(16)
            .uint("ping_data", 8)
            .build();
    pub static ref GET_PROTOCOL_VERSION_RESPONSE: Schema =
        feature_short("GetProtocolVersionResponse", MessageKind::Response, 1)
            .uint("protocol_num", 8)
            .uint("target_sw", 8)
            .uint("ping_data", 8)
            .build();

    // Feature set 0x0001
    pub static ref GET_FEATURE_COUNT: Schema = feature_short("GetFeatureCount", MessageKind::Request, 0)
        .padding(24)
        .build();
    pub static ref GET_FEATURE_COUNT_RESPONSE: Schema =
        feature_long("GetFeatureCountResponse", MessageKind::Response, 0)
            .uint("count", 8)
            .pad_to_end()
            .build();
    pub static ref GET_FEATURE_ID: Schema = feature_short("GetFeatureId", MessageKind::Request, 1)
        .uint("feature_index", 8)
        .padding(16)
        .build();
    pub static ref GET_FEATURE_ID_RESPONSE: Schema =
        feature_long("GetFeatureIdResponse", MessageKind::Response, 1)
            .uint("feature_id", 16)
            .uint("feature_type", 8)
            .uint("feature_version", 8)
            .pad_to_end()
            .build();

    // Device name 0x0005
    pub static ref GET_DEVICE_NAME_COUNT: Schema =
        feature_short("GetDeviceNameCount", MessageKind::Request, 0)
            .padding(24)
            .build();
    pub static ref GET_DEVICE_NAME_COUNT_RESPONSE: Schema =
        feature_long("GetDeviceNameCountResponse", MessageKind::Response, 0)
            .uint("device_name_count", 8)
            .pad_to_end()
            .build();
    pub static ref GET_DEVICE_NAME: Schema = feature_short("GetDeviceName", MessageKind::Request, 1)
        .uint("char_index", 8)
        .padding(16)
        .build();
    pub static ref GET_DEVICE_NAME_RESPONSE: Schema =
        feature_long("GetDeviceNameResponse", MessageKind::Response, 1)
            .bytes("device_name", 16)
            .build();
    pub static ref GET_DEVICE_TYPE: Schema = feature_short("GetDeviceType", MessageKind::Request, 2)
        .padding(24)
        .build();
    pub static ref GET_DEVICE_TYPE_RESPONSE: Schema =
        feature_long("GetDeviceTypeResponse", MessageKind::Response, 2)
            .uint("device_type", 8)
            .pad_to_end()
            .build();

    // Unified battery 0x1004
    pub static ref GET_BATTERY_CAPABILITIES: Schema =
        feature_short("GetBatteryCapabilities", MessageKind::Request, 0)
            .padding(24)
            .build();
    pub static ref GET_BATTERY_CAPABILITIES_RESPONSE: Schema =
        feature_long("GetBatteryCapabilitiesResponse", MessageKind::Response, 0)
            .uint("supported_levels", 8)
            .uint("capability_flags", 8)
            .pad_to_end()
            .build();
    pub static ref GET_BATTERY_STATUS: Schema = feature_short("GetBatteryStatus", MessageKind::Request, 1)
        .padding(24)
        .build();
    pub static ref GET_BATTERY_STATUS_RESPONSE: Schema =
        feature_long("GetBatteryStatusResponse", MessageKind::Response, 1)
            .uint("state_of_charge", 8)
            .uint("battery_level", 8)
            .uint("charging_status", 8)
            .uint("external_power_status", 8)
            .pad_to_end()
            .build();
    pub static ref BATTERY_STATUS_EVENT: Schema =
        feature_long("BatteryStatusEvent", MessageKind::Event, 0)
            .uint("state_of_charge", 8)
            .uint("battery_level", 8)
            .uint("charging_status", 8)
            .uint("external_power_status", 8)
            .pad_to_end()
            .build();

    // Wireless device status 0x1D4B
    pub static ref WIRELESS_DEVICE_STATUS_BROADCAST: Schema =
        feature_long("WirelessDeviceStatusBroadcastEvent", MessageKind::Event, 0)
            .uint("status", 8)
            .uint("request", 8)
            .uint("reason", 8)
            .pad_to_end()
            .build();

    // Per-key lighting v2 0x8081
    pub static ref SET_INDIVIDUAL_RGB_ZONES: Schema =
        feature_long("SetIndividualRgbZones", MessageKind::Request, 1)
            .uint("zone_id_0", 8).uint("red_0", 8).uint("green_0", 8).uint("blue_0", 8)
            .uint("zone_id_1", 8).uint("red_1", 8).uint("green_1", 8).uint("blue_1", 8)
            .uint("zone_id_2", 8).uint("red_2", 8).uint("green_2", 8).uint("blue_2", 8)
            .uint("zone_id_3", 8).uint("red_3", 8).uint("green_3", 8).uint("blue_3", 8)
            .build();
    pub static ref SET_INDIVIDUAL_RGB_ZONES_RESPONSE: Schema =
        feature_long("SetIndividualRgbZonesResponse", MessageKind::Response, 1)
            .pad_to_end()
            .build();
}

/// Number of `(zone_id, red, green, blue)` tuples in one lighting request.
pub const RGB_ZONES_PER_REQUEST: usize = 4;

pub(super) fn schemas() -> Vec<&'static Schema> {
    vec![
        &*GET_FEATURE,
        &*GET_FEATURE_RESPONSE,
        &*GET_PROTOCOL_VERSION,
        &*GET_PROTOCOL_VERSION_RESPONSE,
        &*GET_FEATURE_COUNT,
        &*GET_FEATURE_COUNT_RESPONSE,
        &*GET_FEATURE_ID,
        &*GET_FEATURE_ID_RESPONSE,
        &*GET_DEVICE_NAME_COUNT,
        &*GET_DEVICE_NAME_COUNT_RESPONSE,
        &*GET_DEVICE_NAME,
        &*GET_DEVICE_NAME_RESPONSE,
        &*GET_DEVICE_TYPE,
        &*GET_DEVICE_TYPE_RESPONSE,
        &*GET_BATTERY_CAPABILITIES,
        &*GET_BATTERY_CAPABILITIES_RESPONSE,
        &*GET_BATTERY_STATUS,
        &*GET_BATTERY_STATUS_RESPONSE,
        &*BATTERY_STATUS_EVENT,
        &*WIRELESS_DEVICE_STATUS_BROADCAST,
        &*SET_INDIVIDUAL_RGB_ZONES,
        &*SET_INDIVIDUAL_RGB_ZONES_RESPONSE,
    ]
}

/// Root `get_feature` request for `feature_id`.
pub fn get_feature(device_index: u8, feature_id: u16) -> Result<Message, CodecError> {
    Message::new(&GET_FEATURE)
        .with_device_index(device_index)
        .with("feature_id", u64::from(feature_id))
}

/// One `(zone_id, red, green, blue)` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RgbZone {
    pub zone_id: u8,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

/// Build a `set_individual_rgb_zones` request; unused tuples stay zero.
pub fn set_individual_rgb_zones(
    device_index: u8,
    feature_index: u8,
    zones: &[RgbZone],
) -> Result<Message, CodecError> {
    if zones.len() > RGB_ZONES_PER_REQUEST {
        return Err(CodecError::LengthMismatch {
            schema: SET_INDIVIDUAL_RGB_ZONES.name,
            expected: RGB_ZONES_PER_REQUEST,
            actual: zones.len(),
        });
    }
    let mut msg = Message::new(&SET_INDIVIDUAL_RGB_ZONES)
        .with_device_index(device_index)
        .with_feature_index(feature_index);
    for (i, zone) in zones.iter().enumerate() {
        msg.set(&format!("zone_id_{i}"), u64::from(zone.zone_id))?;
        msg.set(&format!("red_{i}"), u64::from(zone.red))?;
        msg.set(&format!("green_{i}"), u64::from(zone.green))?;
        msg.set(&format!("blue_{i}"), u64::from(zone.blue))?;
    }
    Ok(msg)
}

/// Decoded root `get_feature` answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureLookup {
    pub feature_index: u8,
    pub feature_type: u8,
    pub feature_version: u8,
}

impl TryFrom<&Message> for FeatureLookup {
    type Error = CodecError;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        expect_schema(message, &GET_FEATURE_RESPONSE)?;
        Ok(Self {
            feature_index: uint(message, "feature_index")? as u8,
            feature_type: uint(message, "feature_type")? as u8,
            feature_version: uint(message, "feature_version")? as u8,
        })
    }
}
