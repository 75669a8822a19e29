//! Named, bounded message queues.
//!
//! Each channel owns one queue per [`QueueName`]. Queues are strict FIFO;
//! when full, the oldest message is dropped with a warning.

use crate::codec::{HeaderKind, Message, MessageKind, Schema};
use crate::hidpp::sub_ids;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;
use tracing::warn;

/// Standard per-channel queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueName {
    Hid,
    HidppCommon,
    HidppImportant,
    HidppGaming,
    ReceiverResponse,
    ReceiverEvent,
    ReceiverConnectionEvent,
    Event,
    Error,
    BatteryEvent,
}

impl QueueName {
    pub const ALL: &'static [QueueName] = &[
        QueueName::Hid,
        QueueName::HidppCommon,
        QueueName::HidppImportant,
        QueueName::HidppGaming,
        QueueName::ReceiverResponse,
        QueueName::ReceiverEvent,
        QueueName::ReceiverConnectionEvent,
        QueueName::Event,
        QueueName::Error,
        QueueName::BatteryEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Hid => "HID",
            QueueName::HidppCommon => "HIDPP_COMMON",
            QueueName::HidppImportant => "HIDPP_IMPORTANT",
            QueueName::HidppGaming => "HIDPP_GAMING",
            QueueName::ReceiverResponse => "RECEIVER_RESPONSE",
            QueueName::ReceiverEvent => "RECEIVER_EVENT",
            QueueName::ReceiverConnectionEvent => "RECEIVER_CONNECTION_EVENT",
            QueueName::Event => "EVENT",
            QueueName::Error => "ERROR",
            QueueName::BatteryEvent => "BATTERY_EVENT",
        }
    }

    /// Parse a queue name, case-insensitively.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|q| q.as_str().eq_ignore_ascii_case(name))
    }

    /// Whether a message class may be stored in this queue.
    pub fn accepts(&self, schema: &Schema) -> bool {
        let hidpp10_sub_id = match schema.header {
            HeaderKind::Hidpp10 { sub_id, .. } => Some(sub_id),
            _ => None,
        };
        let hidpp20 = matches!(schema.header, HeaderKind::Hidpp20 { .. });
        match self {
            QueueName::Hid => schema.kind == MessageKind::Hid,
            QueueName::Error => schema.kind == MessageKind::Error,
            QueueName::ReceiverResponse => {
                schema.kind == MessageKind::Response && hidpp10_sub_id.is_some()
            }
            QueueName::ReceiverConnectionEvent => matches!(
                hidpp10_sub_id,
                Some(sub_ids::DEVICE_CONNECTION | sub_ids::DEVICE_DISCONNECTION)
            ) && schema.kind == MessageKind::Event,
            QueueName::ReceiverEvent => {
                schema.kind == MessageKind::Event && hidpp10_sub_id.is_some()
            }
            QueueName::HidppCommon
            | QueueName::HidppImportant
            | QueueName::HidppGaming
            | QueueName::Event
            | QueueName::BatteryEvent => {
                hidpp20 && matches!(schema.kind, MessageKind::Event | MessageKind::Response)
            }
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts a message when the filter is empty or names its class.
pub fn matches_filter(message: &Message, filter: &[&'static Schema]) -> bool {
    filter.is_empty() || filter.iter().any(|schema| message.is(schema))
}

/// A bounded FIFO of decoded messages.
pub struct MessageQueue {
    name: QueueName,
    capacity: usize,
    messages: Mutex<VecDeque<Message>>,
    arrived: Condvar,
}

impl MessageQueue {
    pub fn new(name: QueueName, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            messages: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Append a message, dropping the oldest one if the queue is full.
    pub fn push(&self, message: Message) {
        let mut messages = self.messages.lock();
        if messages.len() >= self.capacity {
            if let Some(dropped) = messages.pop_front() {
                warn!(
                    queue = %self.name,
                    capacity = self.capacity,
                    dropped = dropped.name(),
                    "Queue full, dropping oldest message"
                );
            }
        }
        messages.push_back(message);
        self.arrived.notify_all();
    }

    /// Pop the head of the queue, waiting until `deadline`.
    pub fn pop(&self, deadline: Instant) -> Option<Message> {
        let mut messages = self.messages.lock();
        loop {
            if let Some(message) = messages.pop_front() {
                return Some(message);
            }
            if self.arrived.wait_until(&mut messages, deadline).timed_out() {
                return messages.pop_front();
            }
        }
    }

    /// Remove the first message matching `filter`, leaving others in place.
    pub fn pop_matching(&self, filter: &[&'static Schema], deadline: Instant) -> Option<Message> {
        let mut messages = self.messages.lock();
        loop {
            if let Some(pos) = messages.iter().position(|m| matches_filter(m, filter)) {
                return messages.remove(pos);
            }
            if self.arrived.wait_until(&mut messages, deadline).timed_out() {
                let pos = messages.iter().position(|m| matches_filter(m, filter))?;
                return messages.remove(pos);
            }
        }
    }

    /// Remove and return every message matching `filter`.
    pub fn drain_matching(&self, filter: &[&'static Schema]) -> Vec<Message> {
        let mut messages = self.messages.lock();
        let mut removed = Vec::new();
        messages.retain(|m| {
            if matches_filter(m, filter) {
                removed.push(m.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop everything; returns how many messages were discarded.
    pub fn clear(&self) -> usize {
        let mut messages = self.messages.lock();
        let count = messages.len();
        messages.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the queued messages, oldest first.
    pub fn peek_names(&self) -> Vec<&'static str> {
        self.messages.lock().iter().map(|m| m.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::hidpp20::{BATTERY_STATUS_EVENT, WIRELESS_DEVICE_STATUS_BROADCAST};
    use crate::messages::notifications::{DEVICE_CONNECTION, PAIRING_STATUS};
    use crate::messages::HID_REPORT;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn event(status: u64) -> Message {
        Message::new(&WIRELESS_DEVICE_STATUS_BROADCAST)
            .with("status", status)
            .unwrap()
    }

    #[test]
    fn fifo_order() {
        let queue = MessageQueue::new(QueueName::Event, 8);
        for i in 0..5 {
            queue.push(event(i));
        }
        let deadline = Instant::now();
        let order: Vec<u64> = (0..5)
            .map(|_| queue.pop(deadline).unwrap().get("status").unwrap())
            .collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert!(queue.pop(deadline).is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = MessageQueue::new(QueueName::Event, 2);
        queue.push(event(1));
        queue.push(event(2));
        queue.push(event(3));
        assert_eq!(queue.len(), 2);
        let first = queue.pop(Instant::now()).unwrap();
        assert_eq!(first.get("status"), Some(2));
    }

    #[test]
    fn pop_matching_skips_other_classes() {
        let queue = MessageQueue::new(QueueName::Event, 8);
        queue.push(Message::new(&BATTERY_STATUS_EVENT));
        queue.push(event(7));
        let found = queue
            .pop_matching(&[&WIRELESS_DEVICE_STATUS_BROADCAST], Instant::now())
            .unwrap();
        assert_eq!(found.get("status"), Some(7));
        assert_eq!(queue.peek_names(), vec!["BatteryStatusEvent"]);
    }

    #[test]
    fn drain_matching_keeps_the_rest() {
        let queue = MessageQueue::new(QueueName::Event, 8);
        queue.push(event(1));
        queue.push(Message::new(&BATTERY_STATUS_EVENT));
        queue.push(event(2));
        let removed = queue.drain_matching(&[&WIRELESS_DEVICE_STATUS_BROADCAST]);
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn pop_wakes_on_push() {
        let queue = Arc::new(MessageQueue::new(QueueName::Event, 8));
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.push(event(9));
            })
        };
        let got = queue.pop(Instant::now() + Duration::from_secs(2));
        producer.join().unwrap();
        assert_eq!(got.unwrap().get("status"), Some(9));
    }

    #[test]
    fn pop_times_out() {
        let queue = MessageQueue::new(QueueName::Event, 8);
        let start = Instant::now();
        assert!(queue.pop(start + Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn acceptance_by_class() {
        assert!(QueueName::Hid.accepts(&HID_REPORT));
        assert!(!QueueName::Hid.accepts(&DEVICE_CONNECTION));
        assert!(QueueName::ReceiverConnectionEvent.accepts(&DEVICE_CONNECTION));
        assert!(!QueueName::ReceiverConnectionEvent.accepts(&PAIRING_STATUS));
        assert!(QueueName::ReceiverEvent.accepts(&PAIRING_STATUS));
        assert!(QueueName::Event.accepts(&WIRELESS_DEVICE_STATUS_BROADCAST));
        assert!(!QueueName::Event.accepts(&PAIRING_STATUS));
    }

    #[test]
    fn parse_names() {
        assert_eq!(QueueName::parse("receiver_event"), Some(QueueName::ReceiverEvent));
        assert_eq!(QueueName::parse("nope"), None);
    }
}
