//! Logical communication channels.
//!
//! A channel is either a direct link (USB or BLE) with its own reader
//! threads, or a device reached through a receiver, which shares the
//! receiver's transport and sees only the reports addressed to its slot.

use crate::codec::{encode, HeaderKind, Message, Schema};
use crate::config::HarnessConfig;
use crate::dispatcher::{DispatchRole, Dispatcher};
use crate::error::{CodecError, Error, Result, TransportError};
use crate::feature_cache::FeatureEntry;
use crate::hidpp::{features, RECEIVER_DEVICE_INDEX};
use crate::messages::hidpp20::{
    get_feature, FeatureLookup, GET_FEATURE_RESPONSE, GET_PROTOCOL_VERSION,
    GET_PROTOCOL_VERSION_RESPONSE,
};
use crate::pending::Correlation;
use crate::protocol::{LinkStatus, LogitechProtocol};
use crate::queue::{matches_filter, QueueName};
use crate::transport::{HidTransport, SubLink};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Handle of a channel in the manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Usb,
    Ble,
    BleProThroughReceiver,
}

/// Channel lookup key. Unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ChannelIdentifier {
    pub port_index: Option<i32>,
    pub device_index: Option<u8>,
    pub transport_id: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub protocol: Option<LogitechProtocol>,
}

impl ChannelIdentifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port_index(mut self, port_index: i32) -> Self {
        self.port_index = Some(port_index);
        self
    }

    pub fn device_index(mut self, device_index: u8) -> Self {
        self.device_index = Some(device_index);
        self
    }

    pub fn transport_id(mut self, transport_id: impl Into<String>) -> Self {
        self.transport_id = Some(transport_id.into());
        self
    }

    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    pub fn product_id(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }

    pub fn protocol(mut self, protocol: LogitechProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Whether every field set in `pattern` equals ours.
    pub fn matches(&self, pattern: &ChannelIdentifier) -> bool {
        fn field<T: PartialEq>(ours: &Option<T>, wanted: &Option<T>) -> bool {
            wanted.is_none() || ours == wanted
        }
        field(&self.port_index, &pattern.port_index)
            && field(&self.device_index, &pattern.device_index)
            && field(&self.transport_id, &pattern.transport_id)
            && field(&self.vendor_id, &pattern.vendor_id)
            && field(&self.product_id, &pattern.product_id)
            && field(&self.protocol, &pattern.protocol)
    }

    /// Device index written into outgoing headers.
    pub fn wire_device_index(&self) -> u8 {
        self.device_index.unwrap_or(RECEIVER_DEVICE_INDEX)
    }
}

impl fmt::Display for ChannelIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(v) = self.port_index {
            parts.push(format!("port_index({v})"));
        }
        if let Some(v) = self.device_index {
            parts.push(format!("device_index({v})"));
        }
        if let Some(v) = &self.transport_id {
            parts.push(format!("transport_id({v})"));
        }
        if let Some(v) = self.vendor_id {
            parts.push(format!("vendor_id(0x{v:04X})"));
        }
        if let Some(v) = self.product_id {
            parts.push(format!("product_id(0x{v:04X})"));
        }
        if let Some(v) = self.protocol {
            parts.push(format!("protocol({v:?})"));
        }
        if parts.is_empty() {
            f.write_str("any")
        } else {
            f.write_str(&parts.join(", "))
        }
    }
}

enum Link {
    Direct {
        transport: Arc<dyn HidTransport>,
    },
    ThroughReceiver {
        parent: ChannelId,
        parent_dispatcher: Weak<Dispatcher>,
        transport: Arc<dyn HidTransport>,
        device_index: u8,
    },
}

/// A logical pipe to a receiver or a device.
pub struct Channel {
    identifier: ChannelIdentifier,
    kind: ChannelKind,
    link: Link,
    dispatcher: Arc<Dispatcher>,
    config: Arc<HarnessConfig>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    protocol_version: Mutex<Option<(u8, u8)>>,
}

impl Channel {
    /// A channel with its own physical link.
    pub fn direct(
        identifier: ChannelIdentifier,
        kind: ChannelKind,
        role: DispatchRole,
        transport: Arc<dyn HidTransport>,
        config: Arc<HarnessConfig>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(identifier.clone(), role, &config));
        Self {
            identifier,
            kind,
            link: Link::Direct { transport },
            dispatcher,
            config,
            readers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            protocol_version: Mutex::new(None),
        }
    }

    /// A device behind `receiver`, addressed as `device_index`.
    pub fn through_receiver(
        parent: ChannelId,
        receiver: &Channel,
        device_index: u8,
        config: Arc<HarnessConfig>,
    ) -> Self {
        let identifier = ChannelIdentifier {
            device_index: Some(device_index),
            protocol: receiver
                .dispatcher
                .slot(device_index)
                .map(|slot| slot.protocol)
                .or(Some(LogitechProtocol::BlePro)),
            product_id: receiver
                .dispatcher
                .slot(device_index)
                .map(|slot| slot.bluetooth_pid)
                .or(receiver.identifier.product_id),
            ..receiver.identifier.clone()
        };
        let dispatcher = Arc::new(Dispatcher::new(
            identifier.clone(),
            DispatchRole::Device,
            &config,
        ));
        Self {
            identifier,
            kind: ChannelKind::BleProThroughReceiver,
            link: Link::ThroughReceiver {
                parent,
                parent_dispatcher: Arc::downgrade(&receiver.dispatcher),
                transport: receiver.transport().clone(),
                device_index,
            },
            dispatcher,
            config,
            readers: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            protocol_version: Mutex::new(None),
        }
    }

    pub fn identifier(&self) -> &ChannelIdentifier {
        &self.identifier
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Arena handle of the receiver this channel tunnels through.
    pub fn parent(&self) -> Option<ChannelId> {
        match &self.link {
            Link::Direct { .. } => None,
            Link::ThroughReceiver { parent, .. } => Some(*parent),
        }
    }

    pub fn is_receiver(&self) -> bool {
        self.dispatcher.role() == DispatchRole::Receiver
    }

    pub fn is_open(&self) -> bool {
        self.dispatcher.is_open()
    }

    pub fn is_device_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    pub fn wire_device_index(&self) -> u8 {
        self.identifier.wire_device_index()
    }

    fn transport(&self) -> &Arc<dyn HidTransport> {
        match &self.link {
            Link::Direct { transport } | Link::ThroughReceiver { transport, .. } => transport,
        }
    }

    /// Start receiving. Idempotent.
    pub fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        match &self.link {
            Link::Direct { transport } => {
                self.shutdown.store(false, Ordering::SeqCst);
                self.dispatcher.open();
                let mut readers = self.readers.lock();
                for link in transport.sub_links() {
                    match self.spawn_reader(transport.clone(), link) {
                        Ok(handle) => readers.push(handle),
                        Err(e) => {
                            drop(readers);
                            self.close();
                            return Err(e);
                        }
                    }
                }
            }
            Link::ThroughReceiver {
                parent_dispatcher,
                device_index,
                ..
            } => {
                let parent = parent_dispatcher
                    .upgrade()
                    .filter(|p| p.is_open())
                    .ok_or(TransportError::ChannelClosed)
                    .map_err(|e| Error::from(e).with_context(&self.identifier, None))?;
                self.dispatcher.open();
                parent.attach_child(*device_index, self.dispatcher.clone());
                let connected = parent
                    .slot(*device_index)
                    .map_or(true, |slot| slot.link_status == LinkStatus::Established);
                self.dispatcher.set_connected(connected);
            }
        }
        info!(channel = %self.identifier, kind = ?self.kind, "Channel opened");
        Ok(())
    }

    fn spawn_reader(&self, transport: Arc<dyn HidTransport>, link: SubLink) -> Result<JoinHandle<()>> {
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();
        let poll = self.config.reader_poll();
        let name = format!(
            "hidpp-rx-{}-{}",
            self.identifier.port_index.unwrap_or(-1),
            link.as_str()
        );
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    match transport.read_report(link, poll) {
                        Ok(Some(data)) => dispatcher.handle_report(&data),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                channel = %dispatcher.identifier(),
                                link = link.as_str(),
                                error = %e,
                                "Reader stopped"
                            );
                            break;
                        }
                    }
                }
            })
            .map_err(|e| TransportError::Hid(format!("cannot spawn reader: {e}")).into())
    }

    /// Stop readers, flush queues and fail waiters. The feature table is kept.
    pub fn close(&self) {
        match &self.link {
            Link::Direct { .. } => {
                self.shutdown.store(true, Ordering::SeqCst);
                let readers: Vec<JoinHandle<()>> = self.readers.lock().drain(..).collect();
                for reader in readers {
                    if reader.join().is_err() {
                        warn!(channel = %self.identifier, "Reader thread panicked");
                    }
                }
            }
            Link::ThroughReceiver {
                parent_dispatcher,
                device_index,
                ..
            } => {
                if let Some(parent) = parent_dispatcher.upgrade() {
                    parent.detach_child(*device_index);
                }
            }
        }
        if self.is_open() {
            self.dispatcher.close();
            info!(channel = %self.identifier, "Channel closed");
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::from(TransportError::ChannelClosed).with_context(&self.identifier, None));
        }
        if let Link::ThroughReceiver {
            parent_dispatcher, ..
        } = &self.link
        {
            if !parent_dispatcher.upgrade().is_some_and(|p| p.is_open()) {
                return Err(
                    Error::from(TransportError::ChannelClosed).with_context(&self.identifier, None)
                );
            }
        }
        Ok(())
    }

    fn addressed(&self, request: &Message) -> Message {
        request.clone().with_device_index(self.wire_device_index())
    }

    fn write(&self, frame: &[u8]) -> Result<()> {
        trace!(
            channel = %self.identifier,
            report_hex = format_args!("{:02X?}", frame),
            "HID++ TX"
        );
        self.transport().write_report(frame)
    }

    /// Write `request` without waiting for anything back. The message's own
    /// software id is sent unchanged.
    pub fn send_only(&self, request: &Message) -> Result<()> {
        self.ensure_open()?;
        let frame = encode(&self.addressed(request))
            .map_err(|e| Error::from(e).with_context(&self.identifier, None))?;
        self.write(&frame)
            .map_err(|e| e.with_context(&self.identifier, None))
    }

    /// Write `request` and wait for its `response` class.
    ///
    /// Codec errors are raised before a tag is reserved, so an invalid
    /// request never reaches the wire.
    pub fn send(&self, request: &Message, response: &'static Schema, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        self.ensure_open()?;
        if !self.is_device_connected() {
            return Err(Error::from(TransportError::LinkLost).with_context(&self.identifier, None));
        }
        let message = self.addressed(request);
        let mut frame =
            encode(&message).map_err(|e| Error::from(e).with_context(&self.identifier, None))?;

        let schema = message.schema();
        let feature_index = message.header.feature_index;
        let register_address = message.header.function_sw;
        let key_for = |tag: u8| match schema.header {
            HeaderKind::Hidpp10 { sub_id, address } => Correlation::Register {
                sub_id,
                address: address.unwrap_or(register_address),
            },
            _ => Correlation::Feature {
                feature_index,
                function: match schema.header {
                    HeaderKind::Hidpp20 { function } => function,
                    _ => 0,
                },
                tag,
            },
        };
        if schema.header == HeaderKind::None {
            return Err(Error::from(CodecError::SchemaMismatch {
                expected: "HID++ request",
                actual: schema.name,
            })
            .with_context(&self.identifier, None));
        }

        let ticket = self
            .dispatcher
            .pending()
            .reserve(response, deadline, key_for)
            .map_err(|e| e.with_context(&self.identifier, None))?;
        if let Some(tag) = ticket.key.wire_tag() {
            frame[3] = (frame[3] & 0xF0) | tag;
        }
        if let Err(e) = self.write(&frame) {
            self.dispatcher.pending().cancel(&ticket);
            return Err(e.with_context(&self.identifier, Some(ticket.tag)));
        }
        self.dispatcher
            .pending()
            .wait(&ticket, deadline)
            .map_err(|e| e.with_context(&self.identifier, Some(ticket.tag)))
    }

    /// Feature table entry for `feature_id`, asking the device when the
    /// cache has nothing confirmed.
    pub fn feature_entry(&self, feature_id: u16) -> Result<FeatureEntry> {
        let cached = self.dispatcher.features().get(feature_id);
        if let Some(entry) = cached.filter(|e| !e.advisory) {
            return Ok(entry);
        }
        let request = get_feature(self.wire_device_index(), feature_id)
            .map_err(|e| Error::from(e).with_context(&self.identifier, None))?;
        let response = self.send(&request, &GET_FEATURE_RESPONSE, self.config.response_timeout())?;
        let lookup = FeatureLookup::try_from(&response)
            .map_err(|e| Error::from(e).with_context(&self.identifier, None))?;
        if let Some(advisory) = cached {
            if advisory.feature_index != lookup.feature_index {
                warn!(
                    channel = %self.identifier,
                    feature_id = format_args!("0x{:04X}", feature_id),
                    advisory = advisory.feature_index,
                    actual = lookup.feature_index,
                    "Advisory feature index was stale"
                );
            }
        }
        let entry = FeatureEntry::new(feature_id, lookup.feature_index, lookup.feature_version);
        self.dispatcher.features().insert(entry);
        debug!(
            channel = %self.identifier,
            feature_id = format_args!("0x{:04X}", feature_id),
            feature_index = entry.feature_index,
            version = entry.version,
            "Feature mapped"
        );
        Ok(entry)
    }

    /// Feature index of `feature_id`. With `skip_if_missing`, an unsupported
    /// feature yields 0 instead of an error.
    pub fn update_feature_mapping(&self, feature_id: u16, skip_if_missing: bool) -> Result<u8> {
        let entry = self.feature_entry(feature_id)?;
        if entry.is_supported() || skip_if_missing {
            Ok(entry.feature_index)
        } else {
            Err(Error::FeatureNotSupported(feature_id).with_context(&self.identifier, None))
        }
    }

    pub fn supports(&self, feature_id: u16) -> Result<bool> {
        Ok(self.feature_entry(feature_id)?.is_supported())
    }

    /// HID++ protocol `(major, minor)`, cached after the first ping.
    pub fn protocol_version(&self) -> Result<(u8, u8)> {
        if let Some(version) = *self.protocol_version.lock() {
            return Ok(version);
        }
        const PING: u64 = 0x5A;
        let request = Message::new(&GET_PROTOCOL_VERSION)
            .with("ping_data", PING)
            .map_err(|e| Error::from(e).with_context(&self.identifier, None))?;
        let response = self.send(
            &request,
            &GET_PROTOCOL_VERSION_RESPONSE,
            self.config.response_timeout(),
        )?;
        let version = (
            response.get("protocol_num").unwrap_or(0) as u8,
            response.get("target_sw").unwrap_or(0) as u8,
        );
        *self.protocol_version.lock() = Some(version);
        Ok(version)
    }

    /// Read one message from `queue`.
    ///
    /// With `check_first`, the head of the queue is taken and must match
    /// `filter`; otherwise the first matching message is removed and the
    /// rest stay in place. `allow_empty` turns a timeout into `Ok(None)`.
    pub fn get_only(
        &self,
        queue: QueueName,
        filter: &[&'static Schema],
        timeout: Duration,
        check_first: bool,
        allow_empty: bool,
    ) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        let queue = self.dispatcher.queue(queue);
        let found = if check_first {
            match queue.pop(deadline) {
                Some(message) if matches_filter(&message, filter) => Some(message),
                Some(message) => {
                    let expected = filter.iter().map(|s| s.name).collect::<Vec<_>>().join(", ");
                    return Err(Error::UnexpectedMessage {
                        expected,
                        actual: message.name(),
                    }
                    .with_context(&self.identifier, None));
                }
                None => None,
            }
        } else {
            queue.pop_matching(filter, deadline)
        };
        match found {
            Some(message) => Ok(Some(message)),
            None if allow_empty => Ok(None),
            None => Err(Error::from(TransportError::Timeout).with_context(&self.identifier, None)),
        }
    }

    /// Remove and return every message of `filter` from `queue`.
    pub fn clean_messages(&self, queue: QueueName, filter: &[&'static Schema]) -> Vec<Message> {
        self.dispatcher.queue(queue).drain_matching(filter)
    }

    pub fn empty_queue(&self, queue: QueueName) -> usize {
        self.dispatcher.queue(queue).clear()
    }

    /// Root lookup of the root feature itself, bypassing the cache. Used to
    /// prove a freshly paired link carries traffic.
    pub fn ping(&self) -> Result<()> {
        let request = get_feature(self.wire_device_index(), features::ROOT)
            .map_err(|e| Error::from(e).with_context(&self.identifier, None))?;
        self.send(&request, &GET_FEATURE_RESPONSE, self.config.response_timeout())
            .map(|_| ())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
