//! The small surface test benches call.
//!
//! Every operation addresses channels by [`ChannelId`] and reports each
//! failure exactly once, as a `warn!` line carrying the channel, the error
//! class and the request tag.

use crate::channel::{Channel, ChannelId, ChannelIdentifier};
use crate::codec::{Message, Schema};
use crate::comm::ErrorClass;
use crate::config::HarnessConfig;
use crate::device::{DeviceEnumerator, HidapiEnumerator};
use crate::error::{Error, Result};
use crate::manager::ChannelManager;
use crate::messages::hidpp10::AuthMethod;
use crate::pairing::{self, PairedDevice, PairingRequest, UserActionEmulator};
use crate::queue::QueueName;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct Harness {
    manager: ChannelManager,
}

impl Harness {
    pub fn new(enumerator: Box<dyn DeviceEnumerator>, config: HarnessConfig) -> Self {
        Self {
            manager: ChannelManager::new(enumerator, Arc::new(config)),
        }
    }

    /// Harness over the real USB devices.
    pub fn with_hidapi(config: HarnessConfig) -> Self {
        Self::new(Box::new(HidapiEnumerator::new()), config)
    }

    pub fn manager(&self) -> &ChannelManager {
        &self.manager
    }

    pub fn config(&self) -> &HarnessConfig {
        self.manager.config()
    }

    fn report<T>(&self, operation: &'static str, target: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            let channel = match e {
                Error::WithContext { channel, .. } => channel.to_string(),
                _ => target.to_string(),
            };
            warn!(
                operation = operation,
                channel = %channel,
                kind = %ErrorClass::classify(e),
                tag = ?e.tag(),
                error = %e.root(),
                "Harness operation failed"
            );
        }
        result
    }

    fn lookup(&self, id: ChannelId) -> Result<Arc<Channel>> {
        self.manager
            .channel(id)
            .ok_or_else(|| Error::DeviceNotFound(format!("channel {id}")))
    }

    /// First channel matching `pattern`, enumerating devices when none is
    /// known yet. The channel becomes the active one.
    pub fn open_channel(&self, pattern: &ChannelIdentifier) -> Result<ChannelId> {
        let result = self.find_or_discover(pattern).and_then(|id| {
            self.manager.set_channel(id)?;
            Ok(id)
        });
        self.report("open_channel", &pattern.to_string(), result)
    }

    fn find_or_discover(&self, pattern: &ChannelIdentifier) -> Result<ChannelId> {
        if let Some((id, _)) = self.manager.get_channel(pattern, false) {
            return Ok(id);
        }
        self.manager.discover()?;
        self.manager
            .get_channel(pattern, false)
            .map(|(id, _)| id)
            .ok_or_else(|| Error::DeviceNotFound(pattern.to_string()))
    }

    /// Write `request` without waiting for a reply.
    pub fn send_only(&self, id: ChannelId, request: &Message) -> Result<()> {
        let result = self.lookup(id).and_then(|c| c.send_only(request));
        self.report("send_only", &id.to_string(), result)
    }

    /// Write `request` and wait up to `timeout` for its `response` class.
    pub fn send(
        &self,
        id: ChannelId,
        request: &Message,
        response: &'static Schema,
        timeout: Duration,
    ) -> Result<Message> {
        let result = self.lookup(id).and_then(|c| c.send(request, response, timeout));
        self.report("send", &id.to_string(), result)
    }

    /// Read the next message of `filter` from `queue`.
    ///
    /// With `check_first`, a head of another class is an error. With
    /// `allow_empty`, a timeout yields `None`.
    pub fn get_only(
        &self,
        id: ChannelId,
        queue: QueueName,
        filter: &[&'static Schema],
        timeout: Duration,
        check_first: bool,
        allow_empty: bool,
    ) -> Result<Option<Message>> {
        let result = self
            .lookup(id)
            .and_then(|c| c.get_only(queue, filter, timeout, check_first, allow_empty));
        self.report("get_only", &id.to_string(), result)
    }

    pub fn clean_messages(
        &self,
        id: ChannelId,
        queue: QueueName,
        filter: &[&'static Schema],
    ) -> Result<Vec<Message>> {
        let result = self.lookup(id).map(|c| c.clean_messages(queue, filter));
        self.report("clean_messages", &id.to_string(), result)
    }

    /// Drop everything in `queue`; returns how many messages were discarded.
    pub fn empty_queue(&self, id: ChannelId, queue: QueueName) -> Result<usize> {
        let result = self.lookup(id).map(|c| c.empty_queue(queue));
        self.report("empty_queue", &id.to_string(), result)
    }

    pub fn update_feature_mapping(&self, id: ChannelId, feature_id: u16, skip_if_missing: bool) -> Result<u8> {
        let result = self
            .manager
            .update_feature_mapping(id, feature_id, skip_if_missing);
        self.report("update_feature_mapping", &id.to_string(), result)
    }

    /// Pair the device at `address` (discovered when `None`) through
    /// `receiver` and return its slot.
    pub fn pair_device(
        &self,
        receiver: ChannelId,
        address: Option<[u8; 6]>,
        method: AuthMethod,
        entropy: u8,
        emulator: &dyn UserActionEmulator,
    ) -> Result<PairedDevice> {
        let request = PairingRequest::new(address, method, entropy);
        let result = pairing::pair_device(&self.manager, receiver, &request, emulator);
        self.report("pair_device", &receiver.to_string(), result)
    }

    pub fn unpair_slot(&self, receiver: ChannelId, slot: u8) -> Result<()> {
        let result = pairing::unpair_slot(&self.manager, receiver, slot);
        self.report("unpair_slot", &receiver.to_string(), result)
    }

    /// Close every channel.
    pub fn close(&self) {
        self.manager.close_all();
    }
}
