//! Receiver register operations: HID++ reporting, fake arrival, discovery
//! and the pairing-slot commands.

use crate::channel::Channel;
use crate::codec::{Message, Schema};
use crate::device::ReceiverFamily;
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::messages::hidpp10::{
    cancel_device_pairing, perform_device_discovery, perform_device_pairing,
    perform_device_unpairing, AuthMethod, GET_ENABLE_HIDPP_REPORTING,
    GET_ENABLE_HIDPP_REPORTING_RESPONSE, SET_CONNECTION_STATE, SET_CONNECTION_STATE_RESPONSE,
    SET_ENABLE_HIDPP_REPORTING, SET_ENABLE_HIDPP_REPORTING_RESPONSE,
    SET_PERFORM_DEVICE_CONNECTION_RESPONSE, SET_PERFORM_DEVICE_DISCOVERY_RESPONSE,
};
use crate::messages::notifications::{
    DeviceConnection, DeviceDiscovery, DiscoveryPart, DEVICE_CONNECTION, DEVICE_DISCOVERY,
};
use crate::protocol::{
    BleProAuthentication, DeviceType, DiscoveryOption, Hidpp1ErrorCode, LogitechProtocol,
};
use crate::queue::QueueName;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Quiet period that ends the slot announcements after a fake arrival.
const ANNOUNCE_QUIET: Duration = Duration::from_millis(200);

fn register_call(receiver: &Channel, request: &Message, response: &'static Schema) -> Result<Message> {
    receiver.send(request, response, receiver.config().response_timeout())
}

/// Write the wireless-notification reporting flag.
pub fn set_hidpp_reporting(receiver: &Channel, enable: bool) -> Result<()> {
    let request =
        Message::new(&SET_ENABLE_HIDPP_REPORTING).with("wireless_notifications", u64::from(enable))?;
    register_call(receiver, &request, &SET_ENABLE_HIDPP_REPORTING_RESPONSE)?;
    debug!(channel = %receiver.identifier(), enable = enable, "HID++ reporting changed");
    Ok(())
}

/// Set the wireless-notification reporting flag and return its previous
/// value. The register is only written when the value changes.
pub fn enable_hidpp_reporting(receiver: &Channel, enable: bool) -> Result<bool> {
    let current = register_call(
        receiver,
        &Message::new(&GET_ENABLE_HIDPP_REPORTING),
        &GET_ENABLE_HIDPP_REPORTING_RESPONSE,
    )?;
    let previous = current.get("wireless_notifications").unwrap_or(0) == 1;
    if previous != enable {
        set_hidpp_reporting(receiver, enable)?;
    }
    Ok(previous)
}

/// Ask the receiver to re-announce every occupied pairing slot.
pub fn perform_fake_arrival(receiver: &Channel) -> Result<()> {
    if let Some(family) = receiver
        .identifier()
        .product_id
        .and_then(ReceiverFamily::from_pid)
        .filter(|f| !f.supports_fake_arrival())
    {
        return Err(Error::Unsupported(format!("fake arrival on a {}", family.name())));
    }
    let previously_enabled = enable_hidpp_reporting(receiver, true)?;
    let request = Message::new(&SET_CONNECTION_STATE).with("fake_device_arrival", 1)?;
    register_call(receiver, &request, &SET_CONNECTION_STATE_RESPONSE)?;
    if !previously_enabled {
        set_hidpp_reporting(receiver, false)?;
    }
    Ok(())
}

/// Rebuild the slot table: drop stale connection events, force a fake
/// arrival and collect the announcements. The dispatcher marks each
/// announced slot connected or not as the events arrive.
pub fn rebuild_connection_table(receiver: &Channel) -> Result<Vec<DeviceConnection>> {
    receiver.clean_messages(QueueName::ReceiverConnectionEvent, &[]);
    perform_fake_arrival(receiver)?;
    let mut announced: BTreeMap<u8, DeviceConnection> = BTreeMap::new();
    while let Some(message) = receiver.get_only(
        QueueName::ReceiverConnectionEvent,
        &[&DEVICE_CONNECTION],
        ANNOUNCE_QUIET,
        false,
        true,
    )? {
        let connection = DeviceConnection::try_from(&message)?;
        announced.insert(connection.device_index, connection);
    }
    info!(
        channel = %receiver.identifier(),
        slots = ?announced.keys().collect::<Vec<_>>(),
        "Connection table rebuilt"
    );
    Ok(announced.into_values().collect())
}

/// Start device discovery. A `timeout_s` of 0 lets the receiver pick.
pub fn start_discovery(receiver: &Channel, timeout_s: u8) -> Result<()> {
    let request = perform_device_discovery(timeout_s, DiscoveryOption::Start)?;
    register_call(receiver, &request, &SET_PERFORM_DEVICE_DISCOVERY_RESPONSE)?;
    info!(channel = %receiver.identifier(), timeout_s = timeout_s, "Discovery started");
    Ok(())
}

pub fn cancel_discovery(receiver: &Channel) -> Result<()> {
    let request = perform_device_discovery(0, DiscoveryOption::Cancel)?;
    register_call(receiver, &request, &SET_PERFORM_DEVICE_DISCOVERY_RESPONSE)?;
    info!(channel = %receiver.identifier(), "Discovery cancelled");
    Ok(())
}

/// Send `PerformDeviceConnection(pairing)` and wait for the register ack.
pub fn request_pairing(receiver: &Channel, address: [u8; 6], method: AuthMethod, entropy: u8) -> Result<()> {
    let request = perform_device_pairing(address, method, entropy)?;
    register_call(receiver, &request, &SET_PERFORM_DEVICE_CONNECTION_RESPONSE)?;
    Ok(())
}

/// Send `PerformDeviceConnection(cancel)` and wait for the register ack.
pub fn cancel_pairing(receiver: &Channel) -> Result<()> {
    register_call(receiver, &cancel_device_pairing()?, &SET_PERFORM_DEVICE_CONNECTION_RESPONSE)?;
    Ok(())
}

/// Clear `slot`. A slot that is already empty (`UnknownDevice`) counts as
/// success.
pub fn unpair(receiver: &Channel, slot: u8, timeout: Duration) -> Result<()> {
    let request = perform_device_unpairing(slot)?;
    match receiver.send(&request, &SET_PERFORM_DEVICE_CONNECTION_RESPONSE, timeout) {
        Ok(_) => {
            info!(channel = %receiver.identifier(), slot = slot, "Slot unpaired");
            Ok(())
        }
        Err(e)
            if matches!(
                e.root(),
                Error::Protocol(ProtocolError::Hidpp1 {
                    code: Hidpp1ErrorCode::UnknownDevice,
                    ..
                })
            ) =>
        {
            debug!(channel = %receiver.identifier(), slot = slot, "Slot already empty");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// A device seen during discovery, assembled from its notification parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub bluetooth_address: [u8; 6],
    pub protocol: LogitechProtocol,
    pub device_type: DeviceType,
    pub bluetooth_pid: u16,
    pub authentication: BleProAuthentication,
    pub name: String,
    pub name_length: usize,
}

impl DiscoveredDevice {
    pub fn name_complete(&self) -> bool {
        self.name_length > 0 && self.name.len() >= self.name_length
    }
}

/// Format a bluetooth address as `AA:BB:CC:DD:EE:FF`.
pub fn format_address(address: &[u8; 6]) -> String {
    address
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse `AA:BB:CC:DD:EE:FF` (or `-` separated).
pub fn parse_address(text: &str) -> Option<[u8; 6]> {
    let mut address = [0u8; 6];
    let mut parts = text.split(|c: char| c == ':' || c == '-');
    for byte in address.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(address)
}

/// Collects `DeviceDiscovery` parts. Name parts carry only the counter,
/// so the counter of the latest part 0 links them to an address.
#[derive(Debug, Default)]
pub struct DiscoveryCollector {
    devices: Vec<DiscoveredDevice>,
    by_counter: BTreeMap<u16, [u8; 6]>,
}

impl DiscoveryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one part in; returns the device it updated.
    pub fn feed(&mut self, discovery: &DeviceDiscovery) -> Option<&DiscoveredDevice> {
        let index = match &discovery.part {
            DiscoveryPart::DeviceInfo {
                protocol,
                device_type,
                bluetooth_pid,
                bluetooth_address,
                authentication,
            } => {
                self.by_counter.insert(discovery.counter, *bluetooth_address);
                let device = DiscoveredDevice {
                    bluetooth_address: *bluetooth_address,
                    protocol: *protocol,
                    device_type: *device_type,
                    bluetooth_pid: *bluetooth_pid,
                    authentication: *authentication,
                    name: String::new(),
                    name_length: 0,
                };
                match self.position(bluetooth_address) {
                    Some(i) => {
                        let name = std::mem::take(&mut self.devices[i].name);
                        let name_length = self.devices[i].name_length;
                        self.devices[i] = DiscoveredDevice {
                            name,
                            name_length,
                            ..device
                        };
                        i
                    }
                    None => {
                        self.devices.push(device);
                        self.devices.len() - 1
                    }
                }
            }
            DiscoveryPart::NameStart { name_length, chunk } => {
                let i = self.position_for_counter(discovery.counter)?;
                let device = &mut self.devices[i];
                device.name_length = usize::from(*name_length);
                device.name = chunk_text(chunk, device.name_length);
                i
            }
            DiscoveryPart::NameContinuation { chunk } => {
                let i = self.position_for_counter(discovery.counter)?;
                let device = &mut self.devices[i];
                let missing = device.name_length.saturating_sub(device.name.len());
                device.name.push_str(&chunk_text(chunk, missing));
                i
            }
            DiscoveryPart::Unknown { part } => {
                debug!(part = part, "Ignoring unknown discovery part");
                return None;
            }
        };
        self.devices.get(index)
    }

    fn position(&self, address: &[u8; 6]) -> Option<usize> {
        self.devices.iter().position(|d| &d.bluetooth_address == address)
    }

    fn position_for_counter(&self, counter: u16) -> Option<usize> {
        match self.by_counter.get(&counter) {
            Some(address) => self.position(address),
            None => {
                warn!(counter = counter, "Discovery name part before its device info");
                None
            }
        }
    }

    pub fn get(&self, address: &[u8; 6]) -> Option<&DiscoveredDevice> {
        self.devices.iter().find(|d| &d.bluetooth_address == address)
    }

    /// Devices in order of first sighting.
    pub fn devices(&self) -> &[DiscoveredDevice] {
        &self.devices
    }
}

fn chunk_text(chunk: &[u8], limit: usize) -> String {
    let end = chunk.len().min(limit);
    String::from_utf8_lossy(&chunk[..end]).into_owned()
}

/// Wait for the first discovered device that speaks `protocol`.
pub fn wait_for_discovered(
    receiver: &Channel,
    protocol: LogitechProtocol,
    timeout: Duration,
) -> Result<DiscoveredDevice> {
    let deadline = Instant::now() + timeout;
    let mut collector = DiscoveryCollector::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(message) = receiver.get_only(
            QueueName::ReceiverEvent,
            &[&DEVICE_DISCOVERY],
            remaining,
            false,
            true,
        )?
        else {
            return Err(Error::from(TransportError::NoDevice).with_context(receiver.identifier(), None));
        };
        let discovery = DeviceDiscovery::try_from(&message)?;
        if let Some(device) = collector.feed(&discovery) {
            if matches!(discovery.part, DiscoveryPart::DeviceInfo { .. }) && device.protocol == protocol {
                info!(
                    address = %format_address(&device.bluetooth_address),
                    bluetooth_pid = format_args!("0x{:04X}", device.bluetooth_pid),
                    "Discovered device"
                );
                return Ok(device.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelIdentifier, ChannelKind};
    use crate::config::HarnessConfig;
    use crate::dispatcher::DispatchRole;
    use crate::messages::notifications::DeviceDiscovery;
    use crate::pids;
    use crate::protocol::LinkStatus;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;

    const ADDRESS: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01];

    fn receiver(mock: Arc<MockTransport>, product_id: u16) -> Channel {
        let config = Arc::new(HarnessConfig {
            tag_dwell_ms: 0,
            reader_poll_ms: 5,
            response_timeout_ms: 300,
            ..HarnessConfig::default()
        });
        let channel = Channel::direct(
            ChannelIdentifier::new().port_index(0).product_id(product_id),
            ChannelKind::Usb,
            DispatchRole::Receiver,
            mock,
            config,
        );
        channel.open().unwrap();
        channel
    }

    fn reporting_flag(mock: &MockTransport, enabled: bool) {
        mock.on_request(
            vec![0x10, 0xFF, 0x81, 0x00, 0x00, 0x00, 0x00],
            vec![vec![0x10, 0xFF, 0x81, 0x00, 0x00, u8::from(enabled), 0x00]],
        );
    }

    fn connection_frame(slot: u8, status: LinkStatus) -> Vec<u8> {
        crate::codec::encode(
            &DeviceConnection {
                device_index: slot,
                protocol: LogitechProtocol::BlePro,
                link_status: status,
                encrypted: true,
                device_type: DeviceType::Mouse,
                bluetooth_pid: 0xB023,
            }
            .to_message()
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn reporting_is_written_only_when_different() {
        let mock = Arc::new(MockTransport::new());
        reporting_flag(&mock, true);
        let rx = receiver(mock.clone(), pids::BOLT_RECEIVER);
        assert!(enable_hidpp_reporting(&rx, true).unwrap());
        assert_eq!(mock.written().len(), 1);
    }

    #[test]
    fn fake_arrival_restores_reporting() {
        let mock = Arc::new(MockTransport::new());
        reporting_flag(&mock, false);
        mock.on_request(
            vec![0x10, 0xFF, 0x80, 0x00, 0x00, 0x01, 0x00],
            vec![vec![0x10, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00]],
        );
        mock.on_request(
            vec![0x10, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00],
            vec![vec![0x10, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00]],
        );
        mock.on_request(
            vec![0x10, 0xFF, 0x80, 0x02, 0x02, 0x00, 0x00],
            vec![vec![0x10, 0xFF, 0x80, 0x02, 0x00, 0x00, 0x00]],
        );
        let rx = receiver(mock.clone(), pids::BOLT_RECEIVER);
        perform_fake_arrival(&rx).unwrap();
        let written = mock.written();
        assert_eq!(written.len(), 4);
        assert_eq!(written[1], vec![0x10, 0xFF, 0x80, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(written[2], vec![0x10, 0xFF, 0x80, 0x02, 0x02, 0x00, 0x00]);
        assert_eq!(written[3], vec![0x10, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00]);
        // the previous value is known, so restoring it needs no second read
        assert_eq!(written.iter().filter(|w| w[2] == 0x81).count(), 1);
    }

    #[test]
    fn fake_arrival_rejected_on_gotthard() {
        let mock = Arc::new(MockTransport::new());
        let rx = receiver(mock.clone(), pids::GOTTHARD_RECEIVER);
        assert!(matches!(perform_fake_arrival(&rx), Err(Error::Unsupported(_))));
        assert!(mock.written().is_empty());
    }

    #[test]
    fn connection_table_rebuilt_from_announcements() {
        let mock = Arc::new(MockTransport::new());
        reporting_flag(&mock, true);
        mock.on_request(
            vec![0x10, 0xFF, 0x80, 0x02, 0x02, 0x00, 0x00],
            vec![
                vec![0x10, 0xFF, 0x80, 0x02, 0x00, 0x00, 0x00],
                connection_frame(1, LinkStatus::Established),
                connection_frame(3, LinkStatus::NotEstablished),
            ],
        );
        let rx = receiver(mock, pids::BOLT_RECEIVER);
        let slots = rebuild_connection_table(&rx).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].device_index, 1);
        assert_eq!(slots[1].link_status, LinkStatus::NotEstablished);
        assert_eq!(rx.dispatcher().slot(3).unwrap().bluetooth_pid, 0xB023);
    }

    #[test]
    fn unpair_accepts_unknown_device() {
        let mock = Arc::new(MockTransport::new());
        mock.set_responder(|req| {
            if req[2] == 0x82 && req[3] == 0xB2 {
                vec![vec![0x10, 0xFF, 0x8F, 0x82, 0xB2, 0x08, 0x00]]
            } else {
                Vec::new()
            }
        });
        let rx = receiver(mock, pids::BOLT_RECEIVER);
        unpair(&rx, 2, Duration::from_millis(300)).unwrap();
    }

    #[test]
    fn unpair_propagates_other_errors() {
        let mock = Arc::new(MockTransport::new());
        mock.set_responder(|_| vec![vec![0x10, 0xFF, 0x8F, 0x82, 0xB2, 0x07, 0x00]]);
        let rx = receiver(mock, pids::BOLT_RECEIVER);
        let err = unpair(&rx, 2, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(
            err.root(),
            Error::Protocol(ProtocolError::Hidpp1 {
                code: Hidpp1ErrorCode::Busy,
                ..
            })
        ));
    }

    #[test]
    fn collector_assembles_name_parts() {
        let mut collector = DiscoveryCollector::new();
        let info = DeviceDiscovery::try_from(
            &DeviceDiscovery::device_info_message(
                7,
                LogitechProtocol::BlePro,
                DeviceType::Keyboard,
                0xB369,
                ADDRESS,
                BleProAuthentication::TwoButtonsPasskey,
            )
            .unwrap(),
        )
        .unwrap();
        collector.feed(&info).unwrap();

        let mut start = vec![17u8];
        start.extend_from_slice(b"MX Keys for B");
        let start = DeviceDiscovery::try_from(&DeviceDiscovery::raw_part(7, 1, &start).unwrap()).unwrap();
        let device = collector.feed(&start).unwrap();
        assert!(!device.name_complete());

        let rest = DeviceDiscovery::try_from(&DeviceDiscovery::raw_part(7, 2, b"usin").unwrap()).unwrap();
        let device = collector.feed(&rest).unwrap();
        assert_eq!(device.name, "MX Keys for Busin");
        assert!(device.name_complete());
        assert_eq!(collector.get(&ADDRESS).unwrap().bluetooth_pid, 0xB369);
    }

    #[test]
    fn orphan_name_part_is_ignored() {
        let mut collector = DiscoveryCollector::new();
        let orphan = DeviceDiscovery::try_from(&DeviceDiscovery::raw_part(3, 2, b"abc").unwrap()).unwrap();
        assert!(collector.feed(&orphan).is_none());
        assert!(collector.devices().is_empty());
    }

    #[test]
    fn address_text_round_trip() {
        assert_eq!(format_address(&ADDRESS), "AA:BB:CC:DD:EE:01");
        assert_eq!(parse_address("aa-bb-cc-dd-ee-01"), Some(ADDRESS));
        assert_eq!(parse_address("AA:BB:CC"), None);
        assert_eq!(parse_address("AA:BB:CC:DD:EE:01:02"), None);
        assert_eq!(parse_address("AA:BB:CC:DD:EE:ZZ"), None);
    }

    #[test]
    fn discovery_waits_for_matching_protocol() {
        let mock = Arc::new(MockTransport::new());
        let rx = receiver(mock.clone(), pids::BOLT_RECEIVER);
        let unifying = DeviceDiscovery::device_info_message(
            1,
            LogitechProtocol::UnifyingV2,
            DeviceType::Mouse,
            0x4082,
            [1, 2, 3, 4, 5, 6],
            BleProAuthentication::NoAuth,
        )
        .unwrap();
        let ble = DeviceDiscovery::device_info_message(
            2,
            LogitechProtocol::BlePro,
            DeviceType::Keyboard,
            0xB369,
            ADDRESS,
            BleProAuthentication::TwoButtonsPasskey,
        )
        .unwrap();
        mock.inject(crate::codec::encode(&unifying).unwrap());
        mock.inject(crate::codec::encode(&ble).unwrap());
        let device = wait_for_discovered(&rx, LogitechProtocol::BlePro, Duration::from_millis(500)).unwrap();
        assert_eq!(device.bluetooth_address, ADDRESS);

        let err = wait_for_discovered(&rx, LogitechProtocol::BlePro, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err.root(), Error::Transport(TransportError::NoDevice)));
    }
}
