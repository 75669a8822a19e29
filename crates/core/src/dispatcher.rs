//! Inbound report routing.
//!
//! Every report a reader thread pulls off the wire lands in
//! [`Dispatcher::handle_report`]. The dispatcher decides, in order:
//!
//! 1. non-HID++ reports go to the `HID` queue;
//! 2. on a receiver, reports addressed to a paired slot are forwarded to that
//!    slot's dispatcher (receiver notifications stay here);
//! 3. HID++ errors go to `ERROR` and fail the matching waiter;
//! 4. receiver notifications update the slot table, then queue;
//! 5. responses wake their waiter, anything else is decoded as an event and
//!    queued by the registry's routing.

use crate::channel::ChannelIdentifier;
use crate::codec::{decode, Message, Schema};
use crate::config::HarnessConfig;
use crate::error::{Error, ProtocolError, TransportError};
use crate::feature_cache::FeatureCache;
use crate::hidpp::{sub_ids, FrameKind, Header, RECEIVER_DEVICE_INDEX};
use crate::messages::notifications::{
    DeviceConnection, DeviceDisconnection, DEVICE_CONNECTION, DEVICE_DISCONNECTION,
};
use crate::messages::HID_REPORT;
use crate::pending::{Correlation, PendingTable};
use crate::protocol::{DisconnectionType, LinkStatus};
use crate::queue::{MessageQueue, QueueName};
use crate::registry::Registry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// What sits at the far end of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchRole {
    /// A device talked to directly or through a receiver.
    Device,
    /// A receiver multiplexing paired slots.
    Receiver,
}

/// Per-channel inbound state: queues, waiters, feature table and, on a
/// receiver, the slot table and the dispatchers of paired devices.
pub struct Dispatcher {
    identifier: ChannelIdentifier,
    role: DispatchRole,
    registry: &'static Registry,
    queues: Vec<MessageQueue>,
    pending: PendingTable,
    features: FeatureCache,
    open: AtomicBool,
    connected: AtomicBool,
    children: RwLock<HashMap<u8, Arc<Dispatcher>>>,
    slots: RwLock<HashMap<u8, DeviceConnection>>,
}

impl Dispatcher {
    pub fn new(identifier: ChannelIdentifier, role: DispatchRole, config: &HarnessConfig) -> Self {
        let queues = QueueName::ALL
            .iter()
            .map(|&name| MessageQueue::new(name, config.queue_capacity))
            .collect();
        Self {
            identifier,
            role,
            registry: Registry::default_catalogue(),
            queues,
            pending: PendingTable::new(config.tag_dwell()),
            features: FeatureCache::new(),
            open: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            children: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn identifier(&self) -> &ChannelIdentifier {
        &self.identifier
    }

    pub fn role(&self) -> DispatchRole {
        self.role
    }

    pub fn queue(&self, name: QueueName) -> &MessageQueue {
        // `queues` is built from `QueueName::ALL`, whose order follows the
        // enum declaration.
        &self.queues[name as usize]
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn features(&self) -> &FeatureCache {
        &self.features
    }

    pub fn registry(&self) -> &'static Registry {
        self.registry
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Stop accepting reports, flush every queue and fail every waiter with
    /// `LinkLost`. Paired-slot dispatchers are closed with it. The feature
    /// table survives.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let flushed: usize = self.queues.iter().map(MessageQueue::clear).sum();
        let failed = self.pending.fail_all(TransportError::LinkLost.into());
        debug!(
            channel = %self.identifier,
            flushed = flushed,
            failed = failed,
            "Dispatcher closed"
        );
        for child in self.children.read().values() {
            child.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was != connected {
            info!(channel = %self.identifier, connected = connected, "Device connection changed");
        }
    }

    /// The link to the device went down: forget its features and wake every
    /// waiter with `LinkLost`.
    pub fn link_lost(&self) {
        self.set_connected(false);
        self.features.clear();
        let failed = self.pending.fail_all(TransportError::LinkLost.into());
        if failed > 0 {
            warn!(channel = %self.identifier, failed = failed, "Link lost with requests outstanding");
        }
    }

    pub fn attach_child(&self, device_index: u8, child: Arc<Dispatcher>) {
        self.children.write().insert(device_index, child);
    }

    pub fn detach_child(&self, device_index: u8) -> Option<Arc<Dispatcher>> {
        self.children.write().remove(&device_index)
    }

    pub fn child(&self, device_index: u8) -> Option<Arc<Dispatcher>> {
        self.children.read().get(&device_index).cloned()
    }

    /// Last `DeviceConnection` seen for a pairing slot.
    pub fn slot(&self, device_index: u8) -> Option<DeviceConnection> {
        self.slots.read().get(&device_index).copied()
    }

    /// Every known slot, ordered by device index.
    pub fn slots(&self) -> Vec<DeviceConnection> {
        let mut slots: Vec<DeviceConnection> = self.slots.read().values().copied().collect();
        slots.sort_by_key(|s| s.device_index);
        slots
    }

    pub fn forget_slot(&self, device_index: u8) {
        self.slots.write().remove(&device_index);
    }

    /// Route one inbound report.
    pub fn handle_report(&self, data: &[u8]) {
        if !self.is_open() {
            trace!(channel = %self.identifier, "Dropping report on closed dispatcher");
            return;
        }
        let frame = FrameKind::classify(data);
        trace!(
            channel = %self.identifier,
            report_hex = format_args!("{:02X?}", data),
            "HID++ RX"
        );

        if let FrameKind::Hid { .. } = frame {
            self.enqueue_raw(data, QueueName::Hid, &HID_REPORT);
            return;
        }

        if self.role == DispatchRole::Receiver {
            let device_index = data[1];
            let notification = matches!(
                frame,
                FrameKind::Hidpp(header) if sub_ids::is_receiver_notification(header.sub_id())
            );
            if device_index != RECEIVER_DEVICE_INDEX && !notification {
                match self.child(device_index) {
                    Some(child) => child.handle_report(data),
                    None => warn!(
                        channel = %self.identifier,
                        device_index = format_args!("0x{:02X}", device_index),
                        "Report for a slot with no channel"
                    ),
                }
                return;
            }
        }

        match frame {
            FrameKind::Hidpp2Error {
                feature_index,
                function_sw,
                code,
                ..
            } => self.on_hidpp2_error(data, feature_index, function_sw, code),
            FrameKind::Hidpp1Error {
                sub_id,
                address,
                code,
                ..
            } => self.on_hidpp1_error(data, sub_id, address, code),
            FrameKind::Hidpp(header) => {
                if self.role == DispatchRole::Receiver
                    && sub_ids::is_receiver_notification(header.sub_id())
                {
                    self.on_receiver_notification(data, header);
                } else if sub_ids::is_register(header.sub_id()) {
                    self.on_register(data, header);
                } else {
                    self.on_feature_report(data, header);
                }
            }
            FrameKind::Hid { .. } => {}
        }
    }

    fn on_hidpp2_error(&self, data: &[u8], feature_index: u8, function_sw: u8, code: u8) {
        self.enqueue_raw(data, QueueName::Error, self.registry.hidpp2_error());
        let key = Correlation::Feature {
            feature_index,
            function: function_sw >> 4,
            tag: function_sw & 0x0F,
        };
        if let Some(waiter) = self.pending.take(&key) {
            waiter.complete(Err(ProtocolError::Hidpp2 {
                feature_index,
                function: function_sw >> 4,
                code: code.into(),
            }
            .into()));
        }
    }

    fn on_hidpp1_error(&self, data: &[u8], sub_id: u8, address: u8, code: u8) {
        self.enqueue_raw(data, QueueName::Error, self.registry.hidpp1_error());
        let key = Correlation::Register { sub_id, address };
        if let Some(waiter) = self.pending.take(&key) {
            waiter.complete(Err(ProtocolError::Hidpp1 {
                sub_id,
                address,
                code: code.into(),
            }
            .into()));
        }
    }

    fn on_receiver_notification(&self, data: &[u8], header: Header) {
        let Some((schema, queue)) = self.registry.receiver_event(header.sub_id()) else {
            warn!(
                channel = %self.identifier,
                sub_id = format_args!("0x{:02X}", header.sub_id()),
                "Unregistered receiver notification"
            );
            return;
        };
        let message = match decode(data, schema) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %self.identifier, error = %e, "Undecodable receiver notification");
                return;
            }
        };

        if message.is(&DEVICE_CONNECTION) {
            if let Ok(connection) = DeviceConnection::try_from(&message) {
                self.on_device_connection(connection);
            }
        } else if message.is(&DEVICE_DISCONNECTION) {
            if let Ok(disconnection) = DeviceDisconnection::try_from(&message) {
                self.on_device_disconnection(disconnection);
            }
        }
        self.enqueue(message, queue);
    }

    fn on_device_connection(&self, connection: DeviceConnection) {
        let device_index = connection.device_index;
        self.slots.write().insert(device_index, connection);
        debug!(
            channel = %self.identifier,
            device_index = device_index,
            link_status = ?connection.link_status,
            bluetooth_pid = format_args!("0x{:04X}", connection.bluetooth_pid),
            "Slot connection update"
        );
        if let Some(child) = self.child(device_index) {
            match connection.link_status {
                LinkStatus::Established => child.set_connected(true),
                LinkStatus::NotEstablished => child.link_lost(),
            }
        }
    }

    fn on_device_disconnection(&self, disconnection: DeviceDisconnection) {
        let device_index = disconnection.device_index;
        if disconnection.disconnection_type == DisconnectionType::Permanent {
            self.forget_slot(device_index);
        } else if let Some(slot) = self.slots.write().get_mut(&device_index) {
            slot.link_status = LinkStatus::NotEstablished;
        }
        if let Some(child) = self.child(device_index) {
            child.set_connected(false);
        }
    }

    fn on_register(&self, data: &[u8], header: Header) {
        let key = Correlation::Register {
            sub_id: header.sub_id(),
            address: header.address(),
        };
        if let Some(waiter) = self.pending.take(&key) {
            let expected = waiter.expected;
            waiter.complete(decode(data, expected).map_err(Error::from));
            return;
        }
        match self
            .registry
            .register_response(header.sub_id(), header.address())
        {
            Some(schema) => self.enqueue_raw(data, QueueName::ReceiverResponse, schema),
            None => warn!(
                channel = %self.identifier,
                sub_id = format_args!("0x{:02X}", header.sub_id()),
                address = format_args!("0x{:02X}", header.address()),
                "Unregistered register response"
            ),
        }
    }

    fn on_feature_report(&self, data: &[u8], header: Header) {
        let key = Correlation::Feature {
            feature_index: header.feature_index,
            function: header.function(),
            tag: header.software_id(),
        };
        if let Some(waiter) = self.pending.take(&key) {
            let expected = waiter.expected;
            waiter.complete(decode(data, expected).map_err(Error::from));
            return;
        }

        let Some(entry) = self.features.by_index(header.feature_index) else {
            warn!(
                channel = %self.identifier,
                feature_index = format_args!("0x{:02X}", header.feature_index),
                "Report for an unmapped feature index"
            );
            return;
        };
        let Some(interface) = self.registry.feature(entry.feature_id, entry.version) else {
            warn!(
                channel = %self.identifier,
                feature_id = format_args!("0x{:04X}", entry.feature_id),
                "Report for a feature with no registered messages"
            );
            return;
        };
        if let Some(event) = interface.event_for(header.function()) {
            self.enqueue_raw(data, event.queue, event.schema);
        } else if let Some(response) = interface.response_for(header.function()) {
            debug!(
                channel = %self.identifier,
                feature = interface.name,
                tag = header.software_id(),
                "Late response with no waiter"
            );
            self.enqueue_raw(data, interface.queue, response);
        } else {
            warn!(
                channel = %self.identifier,
                feature = interface.name,
                function = header.function(),
                "Unknown function in feature report"
            );
        }
    }

    fn enqueue_raw(&self, data: &[u8], queue: QueueName, schema: &'static Schema) {
        match decode(data, schema) {
            Ok(message) => self.enqueue(message, queue),
            Err(e) => warn!(
                channel = %self.identifier,
                queue = %queue,
                error = %e,
                "Dropping undecodable report"
            ),
        }
    }

    fn enqueue(&self, message: Message, queue: QueueName) {
        if !queue.accepts(message.schema()) {
            warn!(
                channel = %self.identifier,
                queue = %queue,
                message = message.name(),
                "Queue does not accept message class"
            );
            return;
        }
        self.queue(queue).push(message);
    }
}
