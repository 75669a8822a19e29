//! Message registry: binds wire coordinates to message classes.
//!
//! HID++ 2.0 features are registered per `(feature_id, version)`. A lookup
//! for a negotiated version picks the highest registered version that is
//! not newer, so a device reporting v3 of a feature we only know at v1 still
//! resolves. HID++ 1.0 registers resolve by `(sub_id, address)` with a
//! fallback to the generic register layouts.

use crate::codec::Schema;
use crate::hidpp::{features, sub_ids};
use crate::messages::hidpp10::*;
use crate::messages::hidpp20::*;
use crate::messages::notifications::*;
use crate::messages::{all_schemas, HIDPP1_ERROR, HIDPP2_ERROR};
use crate::queue::QueueName;
use lazy_static::lazy_static;
use std::collections::{BTreeMap, HashMap};

/// Request and response classes of one feature function.
#[derive(Debug, Clone, Copy)]
pub struct FunctionSlot {
    pub function: u8,
    pub name: &'static str,
    pub request: &'static Schema,
    pub response: &'static Schema,
}

/// An event a feature may emit, and where it is queued.
#[derive(Debug, Clone, Copy)]
pub struct EventSlot {
    pub function: u8,
    pub schema: &'static Schema,
    pub queue: QueueName,
}

/// Version-specific view of one feature.
#[derive(Debug, Clone)]
pub struct FeatureInterface {
    pub feature_id: u16,
    pub version: u8,
    pub name: &'static str,
    /// Queue for responses that arrive with no waiter.
    pub queue: QueueName,
    pub functions: Vec<FunctionSlot>,
    pub events: Vec<EventSlot>,
}

impl FeatureInterface {
    fn new(feature_id: u16, version: u8, name: &'static str, queue: QueueName) -> Self {
        Self {
            feature_id,
            version,
            name,
            queue,
            functions: Vec::new(),
            events: Vec::new(),
        }
    }

    fn function(
        mut self,
        function: u8,
        name: &'static str,
        request: &'static Schema,
        response: &'static Schema,
    ) -> Self {
        self.functions.push(FunctionSlot {
            function,
            name,
            request,
            response,
        });
        self
    }

    fn event(mut self, function: u8, schema: &'static Schema, queue: QueueName) -> Self {
        self.events.push(EventSlot {
            function,
            schema,
            queue,
        });
        self
    }

    /// Slot by function name, e.g. `"get_feature"`.
    pub fn slot(&self, name: &str) -> Option<&FunctionSlot> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn request(&self, name: &str) -> Option<&'static Schema> {
        self.slot(name).map(|f| f.request)
    }

    pub fn response(&self, name: &str) -> Option<&'static Schema> {
        self.slot(name).map(|f| f.response)
    }

    pub fn response_for(&self, function: u8) -> Option<&'static Schema> {
        self.functions
            .iter()
            .find(|f| f.function == function)
            .map(|f| f.response)
    }

    pub fn event_for(&self, function: u8) -> Option<&EventSlot> {
        self.events.iter().find(|e| e.function == function)
    }
}

/// The process-wide message catalogue.
pub struct Registry {
    features: HashMap<u16, BTreeMap<u8, FeatureInterface>>,
    registers: HashMap<(u8, u8), &'static Schema>,
    generic_registers: HashMap<u8, &'static Schema>,
    receiver_events: HashMap<u8, (&'static Schema, QueueName)>,
    by_name: HashMap<&'static str, &'static Schema>,
}

lazy_static! {
    static ref CATALOGUE: Registry = Registry::build();
}

impl Registry {
    /// The catalogue, built once per process.
    pub fn default_catalogue() -> &'static Registry {
        &CATALOGUE
    }

    fn build() -> Self {
        let mut registry = Self {
            features: HashMap::new(),
            registers: HashMap::new(),
            generic_registers: HashMap::new(),
            receiver_events: HashMap::new(),
            by_name: HashMap::new(),
        };

        registry.add_feature(
            FeatureInterface::new(features::ROOT, 0, "Root", QueueName::HidppImportant)
                .function(0, "get_feature", &GET_FEATURE, &GET_FEATURE_RESPONSE)
                .function(
                    1,
                    "get_protocol_version",
                    &GET_PROTOCOL_VERSION,
                    &GET_PROTOCOL_VERSION_RESPONSE,
                ),
        );
        registry.add_feature(
            FeatureInterface::new(features::FEATURE_SET, 0, "FeatureSet", QueueName::HidppImportant)
                .function(0, "get_count", &GET_FEATURE_COUNT, &GET_FEATURE_COUNT_RESPONSE)
                .function(1, "get_feature_id", &GET_FEATURE_ID, &GET_FEATURE_ID_RESPONSE),
        );

        let device_name_v0 =
            FeatureInterface::new(features::DEVICE_NAME, 0, "DeviceName", QueueName::HidppCommon)
                .function(
                    0,
                    "get_device_name_count",
                    &GET_DEVICE_NAME_COUNT,
                    &GET_DEVICE_NAME_COUNT_RESPONSE,
                )
                .function(1, "get_device_name", &GET_DEVICE_NAME, &GET_DEVICE_NAME_RESPONSE);
        let mut device_name_v1 = device_name_v0.clone().function(
            2,
            "get_device_type",
            &GET_DEVICE_TYPE,
            &GET_DEVICE_TYPE_RESPONSE,
        );
        device_name_v1.version = 1;
        registry.add_feature(device_name_v0);
        registry.add_feature(device_name_v1);

        registry.add_feature(
            FeatureInterface::new(
                features::UNIFIED_BATTERY,
                0,
                "UnifiedBattery",
                QueueName::HidppCommon,
            )
            .function(
                0,
                "get_capabilities",
                &GET_BATTERY_CAPABILITIES,
                &GET_BATTERY_CAPABILITIES_RESPONSE,
            )
            .function(1, "get_status", &GET_BATTERY_STATUS, &GET_BATTERY_STATUS_RESPONSE)
            .event(0, &BATTERY_STATUS_EVENT, QueueName::BatteryEvent),
        );
        registry.add_feature(
            FeatureInterface::new(
                features::WIRELESS_DEVICE_STATUS,
                0,
                "WirelessDeviceStatus",
                QueueName::HidppCommon,
            )
            .event(0, &WIRELESS_DEVICE_STATUS_BROADCAST, QueueName::Event),
        );
        registry.add_feature(
            FeatureInterface::new(
                features::PER_KEY_LIGHTING_V2,
                0,
                "PerKeyLightingV2",
                QueueName::HidppGaming,
            )
            .function(
                1,
                "set_individual_rgb_zones",
                &SET_INDIVIDUAL_RGB_ZONES,
                &SET_INDIVIDUAL_RGB_ZONES_RESPONSE,
            ),
        );

        for schema in [
            &*SET_ENABLE_HIDPP_REPORTING_RESPONSE,
            &*GET_ENABLE_HIDPP_REPORTING_RESPONSE,
            &*SET_CONNECTION_STATE_RESPONSE,
            &*GET_CONNECTION_STATE_RESPONSE,
            &*SET_PERFORM_DEVICE_DISCOVERY_RESPONSE,
            &*SET_PERFORM_DEVICE_CONNECTION_RESPONSE,
        ] {
            if let crate::codec::HeaderKind::Hidpp10 {
                sub_id,
                address: Some(address),
            } = schema.header
            {
                registry.registers.insert((sub_id, address), schema);
            }
        }
        registry
            .generic_registers
            .insert(sub_ids::SET_REGISTER, &SET_REGISTER_RESPONSE);
        registry
            .generic_registers
            .insert(sub_ids::GET_REGISTER, &GET_REGISTER_RESPONSE);
        registry
            .generic_registers
            .insert(sub_ids::SET_LONG_REGISTER, &SET_LONG_REGISTER_RESPONSE);
        registry
            .generic_registers
            .insert(sub_ids::GET_LONG_REGISTER, &GET_LONG_REGISTER_RESPONSE);

        for (schema, queue) in [
            (&*DEVICE_DISCONNECTION, QueueName::ReceiverConnectionEvent),
            (&*DEVICE_CONNECTION, QueueName::ReceiverConnectionEvent),
            (&*DISCOVERY_STATUS, QueueName::ReceiverEvent),
            (&*PAIRING_STATUS, QueueName::ReceiverEvent),
            (&*DEVICE_DISCOVERY, QueueName::ReceiverEvent),
            (&*REQUEST_DISPLAY_PASSKEY, QueueName::ReceiverEvent),
            (&*DISPLAY_PASSKEY_KEY, QueueName::ReceiverEvent),
        ] {
            if let crate::codec::HeaderKind::Hidpp10 { sub_id, .. } = schema.header {
                registry.receiver_events.insert(sub_id, (schema, queue));
            }
        }

        for schema in all_schemas() {
            registry.by_name.insert(schema.name, schema);
        }
        registry
    }

    fn add_feature(&mut self, interface: FeatureInterface) {
        self.features
            .entry(interface.feature_id)
            .or_default()
            .insert(interface.version, interface);
    }

    /// Feature interface for the negotiated `version`.
    pub fn feature(&self, feature_id: u16, version: u8) -> Option<&FeatureInterface> {
        self.features
            .get(&feature_id)?
            .range(..=version)
            .next_back()
            .map(|(_, interface)| interface)
    }

    pub fn knows_feature(&self, feature_id: u16) -> bool {
        self.features.contains_key(&feature_id)
    }

    pub fn response_for(&self, feature_id: u16, version: u8, function: u8) -> Option<&'static Schema> {
        self.feature(feature_id, version)?.response_for(function)
    }

    pub fn event_for(&self, feature_id: u16, version: u8, function: u8) -> Option<&EventSlot> {
        self.feature(feature_id, version)?.event_for(function)
    }

    /// Response class for a register access, falling back to the generic layout.
    pub fn register_response(&self, sub_id: u8, address: u8) -> Option<&'static Schema> {
        self.registers
            .get(&(sub_id, address))
            .or_else(|| self.generic_registers.get(&sub_id))
            .copied()
    }

    /// Notification class and queue for a receiver sub-id.
    pub fn receiver_event(&self, sub_id: u8) -> Option<(&'static Schema, QueueName)> {
        self.receiver_events.get(&sub_id).copied()
    }

    pub fn hidpp1_error(&self) -> &'static Schema {
        &HIDPP1_ERROR
    }

    pub fn hidpp2_error(&self) -> &'static Schema {
        &HIDPP2_ERROR
    }

    /// Schema by class name, e.g. `"PairingStatus"`.
    pub fn schema(&self, name: &str) -> Option<&'static Schema> {
        self.by_name.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode, Message};
    use crate::hidpp::registers;

    #[test]
    fn root_is_registered() {
        let registry = Registry::default_catalogue();
        let root = registry.feature(features::ROOT, 0).unwrap();
        assert!(root.request("get_feature").unwrap() == &*GET_FEATURE);
        assert!(root.response_for(1).unwrap() == &*GET_PROTOCOL_VERSION_RESPONSE);
    }

    #[test]
    fn version_selection_picks_highest_not_newer() {
        let registry = Registry::default_catalogue();
        let v0 = registry.feature(features::DEVICE_NAME, 0).unwrap();
        assert_eq!(v0.version, 0);
        assert!(v0.slot("get_device_type").is_none());

        let v3 = registry.feature(features::DEVICE_NAME, 3).unwrap();
        assert_eq!(v3.version, 1);
        assert!(v3.slot("get_device_type").is_some());
        assert_eq!(v3.functions.len(), 3);
    }

    #[test]
    fn unknown_feature_is_none() {
        assert!(Registry::default_catalogue().feature(0x1B04, 0).is_none());
    }

    #[test]
    fn events_route_to_declared_queues() {
        let registry = Registry::default_catalogue();
        let slot = registry
            .event_for(features::WIRELESS_DEVICE_STATUS, 0, 0)
            .unwrap();
        assert_eq!(slot.queue, QueueName::Event);
        let slot = registry.event_for(features::UNIFIED_BATTERY, 2, 0).unwrap();
        assert_eq!(slot.queue, QueueName::BatteryEvent);
        assert!(slot.queue.accepts(slot.schema));
    }

    #[test]
    fn register_lookup_falls_back_to_generic() {
        let registry = Registry::default_catalogue();
        let specific = registry
            .register_response(sub_ids::SET_LONG_REGISTER, registers::PERFORM_DEVICE_CONNECTION)
            .unwrap();
        assert_eq!(specific.name, "SetPerformDeviceConnectionResponse");
        let generic = registry.register_response(sub_ids::GET_REGISTER, 0xF1).unwrap();
        assert_eq!(generic.name, "GetRegisterResponse");
        assert!(registry.register_response(0x40, 0x00).is_none());
    }

    #[test]
    fn receiver_events_by_sub_id() {
        let registry = Registry::default_catalogue();
        let (schema, queue) = registry.receiver_event(sub_ids::DEVICE_CONNECTION).unwrap();
        assert_eq!(schema.name, "DeviceConnection");
        assert_eq!(queue, QueueName::ReceiverConnectionEvent);
        let (schema, queue) = registry.receiver_event(sub_ids::DISPLAY_PASSKEY_KEY).unwrap();
        assert_eq!(schema.name, "DisplayPassKeyKey");
        assert_eq!(queue, QueueName::ReceiverEvent);
    }

    #[test]
    fn every_registered_class_round_trips_defaults() {
        let registry = Registry::default_catalogue();
        for interfaces in registry.features.values() {
            for interface in interfaces.values() {
                for slot in &interface.functions {
                    for schema in [slot.request, slot.response] {
                        let msg = Message::new(schema);
                        let encoded = encode(&msg).unwrap();
                        assert_eq!(encoded.len(), schema.length, "{}", schema.name);
                        assert_eq!(decode(&encoded, schema).unwrap(), msg, "{}", schema.name);
                    }
                }
            }
        }
    }

    #[test]
    fn lookup_by_name() {
        let registry = Registry::default_catalogue();
        assert!(registry.schema("PairingStatus").is_some());
        assert!(registry.schema("Hidpp2ErrorCodes").is_some());
        assert!(registry.schema("Nope").is_none());
    }
}
