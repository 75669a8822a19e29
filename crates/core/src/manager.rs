//! Channel manager.
//!
//! Channels live in an arena indexed by [`ChannelId`]. A through-receiver
//! channel refers to its receiver by id, so removing a receiver collects its
//! children in the same pass. Readers take an immutable snapshot of the
//! arena and never hold the mutation lock.

use crate::channel::{Channel, ChannelId, ChannelIdentifier, ChannelKind};
use crate::config::HarnessConfig;
use crate::device::{DeviceBundle, DeviceEnumerator};
use crate::dispatcher::DispatchRole;
use crate::error::{Error, Result, TransportError};
use crate::feature_cache::AdvisoryCache;
use crate::messages::hidpp20::WIRELESS_DEVICE_STATUS_BROADCAST;
use crate::messages::notifications::{DeviceConnection, DEVICE_CONNECTION};
use crate::protocol::LinkStatus;
use crate::queue::QueueName;
use crate::receiver;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type Snapshot = Arc<Vec<(ChannelId, Arc<Channel>)>>;

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Arc<Channel>>>,
    bundles: HashMap<ChannelId, DeviceBundle>,
    next_port: i32,
}

impl Arena {
    fn insert(&mut self, channel: Channel) -> ChannelId {
        let id = ChannelId(self.slots.len());
        self.slots.push(Some(Arc::new(channel)));
        id
    }

    fn take(&mut self, id: ChannelId) -> Option<Arc<Channel>> {
        self.bundles.remove(&id);
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    fn children_of(&self, parent: ChannelId) -> Vec<ChannelId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|c| c.parent() == Some(parent))
                    .map(|_| ChannelId(i))
            })
            .collect()
    }
}

/// Outcome of [`ChannelManager::refresh`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub added: Vec<ChannelId>,
    pub removed: Vec<ChannelId>,
}

/// Owner of every channel in the process.
pub struct ChannelManager {
    config: Arc<HarnessConfig>,
    enumerator: Box<dyn DeviceEnumerator>,
    arena: Mutex<Arena>,
    snapshot: RwLock<Snapshot>,
    active: Mutex<Option<ChannelId>>,
    advisory: AdvisoryCache,
}

impl ChannelManager {
    pub fn new(enumerator: Box<dyn DeviceEnumerator>, config: Arc<HarnessConfig>) -> Self {
        Self {
            config,
            enumerator,
            arena: Mutex::new(Arena::default()),
            snapshot: RwLock::new(Arc::new(Vec::new())),
            active: Mutex::new(None),
            advisory: AdvisoryCache::new(),
        }
    }

    pub fn config(&self) -> &Arc<HarnessConfig> {
        &self.config
    }

    /// First-seen feature indices shared by every channel of this manager.
    pub fn advisory(&self) -> &AdvisoryCache {
        &self.advisory
    }

    fn publish(&self, arena: &Arena) {
        let entries = arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|c| (ChannelId(i), c.clone())))
            .collect();
        *self.snapshot.write() = Arc::new(entries);
    }

    /// Current channels, in arena order.
    pub fn channels(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    pub fn channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels()
            .iter()
            .find(|(cid, _)| *cid == id)
            .map(|(_, c)| c.clone())
    }

    fn require(&self, id: ChannelId) -> Result<Arc<Channel>> {
        self.channel(id)
            .ok_or_else(|| Error::DeviceNotFound(format!("channel {id}")))
    }

    /// First channel matching `pattern`. With `check_connected`, channels
    /// whose device link is down are skipped.
    pub fn get_channel(
        &self,
        pattern: &ChannelIdentifier,
        check_connected: bool,
    ) -> Option<(ChannelId, Arc<Channel>)> {
        self.channels()
            .iter()
            .find(|(_, c)| c.identifier().matches(pattern) && (!check_connected || c.is_device_connected()))
            .cloned()
    }

    /// Enumeration bundle a direct channel was created from.
    pub fn bundle(&self, id: ChannelId) -> Option<DeviceBundle> {
        self.arena.lock().bundles.get(&id).cloned()
    }

    pub fn active(&self) -> Option<ChannelId> {
        *self.active.lock()
    }

    /// Create one USB channel per bundle not already known. Returns the new
    /// channel ids.
    pub fn discover(&self) -> Result<Vec<ChannelId>> {
        let bundles = self.enumerator.enumerate()?;
        let mut added = Vec::new();
        for bundle in bundles {
            let known = self
                .arena
                .lock()
                .bundles
                .values()
                .any(|b| b.transport_id == bundle.transport_id);
            if known {
                continue;
            }
            match self.add_bundle(bundle) {
                Ok(id) => added.push(id),
                Err(e) => warn!(error = %e, "Skipping device that failed to open"),
            }
        }
        debug!(added = added.len(), "Discovery complete");
        Ok(added)
    }

    fn add_bundle(&self, bundle: DeviceBundle) -> Result<ChannelId> {
        let transport = self.enumerator.open(&bundle)?;
        let role = if bundle.is_receiver() {
            DispatchRole::Receiver
        } else {
            DispatchRole::Device
        };
        let mut arena = self.arena.lock();
        let port_index = arena.next_port;
        arena.next_port += 1;
        let identifier = ChannelIdentifier::new()
            .port_index(port_index)
            .transport_id(bundle.transport_id.clone())
            .vendor_id(bundle.vendor_id)
            .product_id(bundle.product_id);
        let channel = Channel::direct(identifier, ChannelKind::Usb, role, transport, self.config.clone());
        let id = arena.insert(channel);
        info!(
            channel = %id,
            label = %bundle.label(),
            port_index = port_index,
            receiver = bundle.is_receiver(),
            "Channel added"
        );
        arena.bundles.insert(id, bundle);
        self.publish(&arena);
        Ok(id)
    }

    /// Register an externally built channel.
    pub fn add_channel(&self, channel: Channel) -> ChannelId {
        let mut arena = self.arena.lock();
        let identifier = channel.identifier().clone();
        let id = arena.insert(channel);
        self.publish(&arena);
        info!(channel = %id, identifier = %identifier, "Channel added");
        id
    }

    /// Channel for the device in `device_index` behind `receiver`, created
    /// on first use. It is opened right away when the receiver is open.
    pub fn add_through_receiver(&self, receiver: ChannelId, device_index: u8) -> Result<ChannelId> {
        let parent = self.require(receiver)?;
        if let Some((id, _)) = self
            .channels()
            .iter()
            .find(|(_, c)| c.parent() == Some(receiver) && c.identifier().device_index == Some(device_index))
        {
            return Ok(*id);
        }
        let channel = Channel::through_receiver(receiver, &parent, device_index, self.config.clone());
        if parent.is_open() {
            channel.open()?;
        }
        Ok(self.add_channel(channel))
    }

    /// Remove and close the channels at `port_index` with exactly this
    /// `device_index`. Removing a receiver removes its children too.
    pub fn remove_channel(&self, port_index: i32, device_index: Option<u8>) -> Vec<ChannelId> {
        let mut arena = self.arena.lock();
        let targets: Vec<ChannelId> = arena
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .filter(|c| {
                        c.identifier().port_index == Some(port_index)
                            && c.identifier().device_index == device_index
                    })
                    .map(|_| ChannelId(i))
            })
            .collect();
        let removed = self.collect(&mut arena, &targets);
        self.publish(&arena);
        removed
    }

    fn collect(&self, arena: &mut Arena, targets: &[ChannelId]) -> Vec<ChannelId> {
        let mut removed = Vec::new();
        for &id in targets {
            for child in arena.children_of(id) {
                if let Some(channel) = arena.take(child) {
                    channel.close();
                    removed.push(child);
                }
            }
            if let Some(channel) = arena.take(id) {
                channel.close();
                removed.push(id);
            }
        }
        let mut active = self.active.lock();
        if active.is_some_and(|a| removed.contains(&a)) {
            *active = None;
        }
        for id in &removed {
            info!(channel = %id, "Channel removed");
        }
        removed
    }

    /// Reconcile with the OS device list: drop channels whose device is
    /// gone, add new ones, leave the rest alone.
    pub fn refresh(&self) -> Result<RefreshReport> {
        let present: Vec<String> = self
            .enumerator
            .enumerate()?
            .into_iter()
            .map(|b| b.transport_id)
            .collect();
        let removed = {
            let mut arena = self.arena.lock();
            let stale: Vec<ChannelId> = arena
                .bundles
                .iter()
                .filter(|(_, b)| !present.contains(&b.transport_id))
                .map(|(id, _)| *id)
                .collect();
            let removed = self.collect(&mut arena, &stale);
            self.publish(&arena);
            removed
        };
        let added = self.discover()?;
        Ok(RefreshReport { added, removed })
    }

    /// Make `id` the active channel: close the previous one unless it is
    /// the receiver `id` tunnels through, open `id` (and its receiver), and
    /// seed its feature table.
    pub fn set_channel(&self, id: ChannelId) -> Result<Arc<Channel>> {
        let channel = self.require(id)?;
        let mut active = self.active.lock();
        let previous_id = active.filter(|p| *p != id);
        if let Some(previous) = previous_id.and_then(|p| self.channel(p)) {
            let protocol = channel.identifier().protocol;
            if protocol.is_some()
                && previous.identifier().protocol == protocol
                && channel.dispatcher().features().is_empty()
            {
                channel
                    .dispatcher()
                    .features()
                    .copy_from(previous.dispatcher().features());
                debug!(from = %previous.identifier(), to = %channel.identifier(), "Copied feature table");
            }
            if channel.parent() != previous_id {
                previous.close();
            }
        }
        if let Some(parent) = channel.parent() {
            self.require(parent)?.open()?;
        }
        channel.open()?;
        let primed = self.advisory.prime(channel.dispatcher().features());
        if primed > 0 {
            debug!(channel = %channel.identifier(), primed = primed, "Primed advisory feature indices");
        }
        *active = Some(id);
        Ok(channel)
    }

    /// Resolve `feature_id` on channel `id`, remembering the first index
    /// seen for the advisory features.
    pub fn update_feature_mapping(&self, id: ChannelId, feature_id: u16, skip_if_missing: bool) -> Result<u8> {
        let channel = self.require(id)?;
        let index = channel.update_feature_mapping(feature_id, skip_if_missing)?;
        if let Some(entry) = channel.dispatcher().features().get(feature_id) {
            self.advisory.record(entry);
        }
        Ok(index)
    }

    /// Rebuild the receiver's connection table and create a channel for every
    /// announced slot.
    pub fn attach_connected(&self, receiver_id: ChannelId) -> Result<Vec<ChannelId>> {
        let receiver = self.require(receiver_id)?;
        receiver.open()?;
        let slots = receiver::rebuild_connection_table(&receiver)?;
        slots
            .iter()
            .map(|slot| self.add_through_receiver(receiver_id, slot.device_index))
            .collect()
    }

    /// Wait for a fresh `DeviceConnection(LINK_ESTABLISHED)` on
    /// `device_index`. Other connection messages are consumed.
    pub fn wait_for_connection(
        &self,
        receiver_id: ChannelId,
        device_index: u8,
        timeout: Duration,
    ) -> Result<DeviceConnection> {
        let receiver = self.require(receiver_id)?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = receiver
                .get_only(
                    QueueName::ReceiverConnectionEvent,
                    &[&DEVICE_CONNECTION],
                    remaining,
                    false,
                    true,
                )?
                .ok_or_else(|| {
                    Error::from(TransportError::Timeout).with_context(receiver.identifier(), None)
                })?;
            let connection = DeviceConnection::try_from(&message)?;
            if connection.device_index == device_index && connection.link_status == LinkStatus::Established {
                return Ok(connection);
            }
            debug!(
                device_index = connection.device_index,
                link_status = ?connection.link_status,
                "Ignoring connection event"
            );
        }
    }

    /// Wait for the device's wireless status broadcast, sent once its
    /// firmware is up after a reset.
    pub fn wait_for_wake(&self, id: ChannelId, timeout: Duration) -> Result<()> {
        let channel = self.require(id)?;
        channel
            .get_only(
                QueueName::Event,
                &[&WIRELESS_DEVICE_STATUS_BROADCAST],
                timeout,
                false,
                false,
            )
            .map(|_| ())
    }

    /// Close every channel, children before their receivers.
    pub fn close_all(&self) {
        let channels = self.channels();
        for (_, channel) in channels.iter().filter(|(_, c)| c.parent().is_some()) {
            channel.close();
        }
        for (_, channel) in channels.iter().filter(|(_, c)| c.parent().is_none()) {
            channel.close();
        }
        *self.active.lock() = None;
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::fake::FakeEnumerator;
    use crate::feature_cache::FeatureEntry;
    use crate::hidpp::features;
    use crate::pids;
    use crate::protocol::{DeviceType, LogitechProtocol};
    use crate::transport::mock::MockTransport;

    fn config() -> Arc<HarnessConfig> {
        Arc::new(HarnessConfig {
            tag_dwell_ms: 0,
            reader_poll_ms: 5,
            ..HarnessConfig::default()
        })
    }

    fn manager_with(setup: impl FnOnce(&FakeEnumerator)) -> ChannelManager {
        let enumerator = FakeEnumerator::new();
        setup(&enumerator);
        ChannelManager::new(Box::new(enumerator), config())
    }

    fn connection(slot: u8, status: LinkStatus) -> Vec<u8> {
        crate::codec::encode(
            &DeviceConnection {
                device_index: slot,
                protocol: LogitechProtocol::BlePro,
                link_status: status,
                encrypted: true,
                device_type: DeviceType::Keyboard,
                bluetooth_pid: 0xB369,
            }
            .to_message()
            .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn discover_creates_one_channel_per_bundle() {
        let manager = manager_with(|e| {
            e.plug("rx", pids::BOLT_RECEIVER);
            e.plug("mouse", 0xC08B);
        });
        let ids = manager.discover().unwrap();
        assert_eq!(ids, vec![ChannelId(0), ChannelId(1)]);
        assert!(manager.channel(ChannelId(0)).unwrap().is_receiver());
        assert!(!manager.channel(ChannelId(1)).unwrap().is_receiver());
        assert!(manager.discover().unwrap().is_empty());
        let (id, _) = manager
            .get_channel(&ChannelIdentifier::new().product_id(0xC08B), false)
            .unwrap();
        assert_eq!(id, ChannelId(1));
        assert!(manager
            .get_channel(&ChannelIdentifier::new().product_id(0x1234), false)
            .is_none());
    }

    #[test]
    fn refresh_removes_stale_and_keeps_known() {
        let enumerator = FakeEnumerator::new();
        enumerator.plug("a", 0xC08B);
        enumerator.plug("b", 0xC08D);
        let enumerator = Arc::new(enumerator);

        struct Shared(Arc<FakeEnumerator>);
        impl DeviceEnumerator for Shared {
            fn enumerate(&self) -> Result<Vec<DeviceBundle>> {
                self.0.enumerate()
            }
            fn open(&self, bundle: &DeviceBundle) -> Result<Arc<dyn crate::transport::HidTransport>> {
                self.0.open(bundle)
            }
        }

        let manager = ChannelManager::new(Box::new(Shared(enumerator.clone())), config());
        manager.discover().unwrap();
        enumerator.unplug("a");
        enumerator.plug("c", 0xC548);
        let report = manager.refresh().unwrap();
        assert_eq!(report.removed, vec![ChannelId(0)]);
        assert_eq!(report.added, vec![ChannelId(2)]);
        assert!(manager.channel(ChannelId(1)).is_some());
        assert_eq!(manager.channels().len(), 2);
    }

    #[test]
    fn removing_a_receiver_collects_its_children() {
        let manager = manager_with(|e| {
            e.plug("rx", pids::BOLT_RECEIVER);
        });
        let receiver = manager.discover().unwrap()[0];
        manager.set_channel(receiver).unwrap();
        let child = manager.add_through_receiver(receiver, 2).unwrap();
        assert_eq!(manager.add_through_receiver(receiver, 2).unwrap(), child);
        assert!(manager.channel(child).unwrap().is_open());

        let removed = manager.remove_channel(0, Some(2));
        assert_eq!(removed, vec![child]);
        let child = manager.add_through_receiver(receiver, 2).unwrap();
        let removed = manager.remove_channel(0, None);
        assert_eq!(removed, vec![child, receiver]);
        assert!(manager.channels().is_empty());
        assert_eq!(manager.active(), None);
    }

    #[test]
    fn set_channel_switches_and_keeps_parent_open() {
        let manager = manager_with(|e| {
            e.plug("rx", pids::BOLT_RECEIVER);
            e.plug("mouse", 0xC08B);
        });
        let ids = manager.discover().unwrap();
        let (receiver, mouse) = (ids[0], ids[1]);
        manager.set_channel(mouse).unwrap();
        assert!(manager.channel(mouse).unwrap().is_open());

        manager.set_channel(receiver).unwrap();
        assert!(!manager.channel(mouse).unwrap().is_open());

        let child = manager.add_through_receiver(receiver, 1).unwrap();
        manager.set_channel(child).unwrap();
        assert!(manager.channel(receiver).unwrap().is_open());
        assert_eq!(manager.active(), Some(child));
    }

    #[test]
    fn feature_table_copied_between_same_protocol_channels() {
        let manager = manager_with(|e| {
            e.plug("rx", pids::BOLT_RECEIVER);
        });
        let receiver = manager.discover().unwrap()[0];
        manager.set_channel(receiver).unwrap();
        let first = manager.add_through_receiver(receiver, 1).unwrap();
        let second = manager.add_through_receiver(receiver, 2).unwrap();
        manager
            .channel(first)
            .unwrap()
            .dispatcher()
            .features()
            .insert(FeatureEntry::new(features::DEVICE_NAME, 0x03, 0));
        manager.set_channel(first).unwrap();
        manager.set_channel(second).unwrap();
        let copied = manager
            .channel(second)
            .unwrap()
            .dispatcher()
            .features()
            .get(features::DEVICE_NAME)
            .unwrap();
        assert_eq!(copied.feature_index, 0x03);
    }

    #[test]
    fn advisory_indices_prime_new_channels() {
        let mock = Arc::new(MockTransport::new());
        mock.on_short_request(0xFF, 0x00, 0x00, &[0x1D, 0x4B], &[0x05, 0x00, 0x00]);
        let manager = manager_with(|_| {});
        let device = manager.add_channel(Channel::direct(
            ChannelIdentifier::new().port_index(7),
            ChannelKind::Ble,
            DispatchRole::Device,
            mock,
            config(),
        ));
        manager.set_channel(device).unwrap();
        assert_eq!(
            manager
                .update_feature_mapping(device, features::WIRELESS_DEVICE_STATUS, false)
                .unwrap(),
            5
        );
        let other = manager.add_channel(Channel::direct(
            ChannelIdentifier::new().port_index(8),
            ChannelKind::Ble,
            DispatchRole::Device,
            Arc::new(MockTransport::new()),
            config(),
        ));
        manager.set_channel(other).unwrap();
        let primed = manager
            .channel(other)
            .unwrap()
            .dispatcher()
            .features()
            .get(features::WIRELESS_DEVICE_STATUS)
            .unwrap();
        assert!(primed.advisory);
        assert_eq!(primed.feature_index, 5);
    }

    #[test]
    fn connection_events_drive_child_state() {
        let manager = manager_with(|e| {
            e.plug("rx", pids::BOLT_RECEIVER);
        });
        let receiver = manager.discover().unwrap()[0];
        manager.set_channel(receiver).unwrap();
        let child = manager.add_through_receiver(receiver, 3).unwrap();
        let child_channel = manager.channel(child).unwrap();
        child_channel
            .dispatcher()
            .features()
            .insert(FeatureEntry::new(features::DEVICE_NAME, 0x03, 0));

        let rx = manager.channel(receiver).unwrap();
        rx.dispatcher()
            .handle_report(&connection(3, LinkStatus::NotEstablished));
        assert!(!child_channel.is_device_connected());
        assert!(child_channel.dispatcher().features().is_empty());
        assert!(manager
            .get_channel(&ChannelIdentifier::new().device_index(3), true)
            .is_none());

        rx.dispatcher().handle_report(&connection(3, LinkStatus::Established));
        assert!(child_channel.is_device_connected());
        let connection = manager
            .wait_for_connection(receiver, 3, Duration::from_millis(200))
            .unwrap();
        assert_eq!(connection.bluetooth_pid, 0xB369);
    }

    #[test]
    fn wait_for_connection_times_out() {
        let manager = manager_with(|e| {
            e.plug("rx", pids::BOLT_RECEIVER);
        });
        let receiver = manager.discover().unwrap()[0];
        manager.set_channel(receiver).unwrap();
        let err = manager
            .wait_for_connection(receiver, 1, Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
