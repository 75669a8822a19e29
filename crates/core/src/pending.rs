//! Outstanding request table and software-id tag pool.
//!
//! A channel has 16 software-id tags. A sender reserves one, records what it
//! expects back, and parks on a one-shot completion. The dispatcher looks the
//! waiter up by the wire coordinates of each inbound report.
//!
//! Released tags go to the back of a FIFO and rest for a configurable dwell
//! before reuse so a late response cannot be mistaken for the answer to a
//! fresh request. Tag 0 starts at the back of the pool: devices send their
//! events with software id 0.

use crate::codec::{Message, Schema};
use crate::error::{Error, Result, TransportError};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Number of software-id values.
pub const TAG_COUNT: u8 = 16;

/// Wire coordinates a response is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Correlation {
    /// HID++ 2.0: echoed feature index, function and software id.
    Feature {
        feature_index: u8,
        function: u8,
        tag: u8,
    },
    /// HID++ 1.0: echoed sub-id and register address. Registers carry no tag.
    Register {
        sub_id: u8,
        address: u8,
    },
}

impl Correlation {
    /// Software id carried on the wire, if any.
    pub fn wire_tag(&self) -> Option<u8> {
        match self {
            Correlation::Feature { tag, .. } => Some(*tag),
            Correlation::Register { .. } => None,
        }
    }
}

type Completion = flume::Sender<Result<Message>>;

struct Slot {
    tag: u8,
    generation: u64,
    key: Correlation,
    expected: &'static Schema,
    completion: Completion,
}

struct Inner {
    /// Free tags, oldest release first. `None` means never used.
    free: VecDeque<(u8, Option<Instant>)>,
    /// Outstanding requests in reservation order.
    slots: Vec<Slot>,
    next_generation: u64,
}

/// A reserved tag and the receiving end of its completion.
pub struct Ticket {
    pub tag: u8,
    pub key: Correlation,
    generation: u64,
    receiver: flume::Receiver<Result<Message>>,
}

/// Handed to the dispatcher when an inbound report matches a waiter.
pub struct Waiter {
    pub expected: &'static Schema,
    pub tag: u8,
    completion: Completion,
}

impl Waiter {
    pub fn complete(self, result: Result<Message>) {
        // The sender may have given up already; nothing to do then.
        let _ = self.completion.send(result);
    }
}

/// Per-channel pending request table.
pub struct PendingTable {
    inner: Mutex<Inner>,
    tag_freed: Condvar,
    dwell: Duration,
}

impl PendingTable {
    pub fn new(dwell: Duration) -> Self {
        let free = (1..TAG_COUNT)
            .chain(std::iter::once(0))
            .map(|tag| (tag, None))
            .collect();
        Self {
            inner: Mutex::new(Inner {
                free,
                slots: Vec::new(),
                next_generation: 0,
            }),
            tag_freed: Condvar::new(),
            dwell,
        }
    }

    /// Reserve a tag and register a waiter for the key built from it.
    ///
    /// Blocks until a tag has finished its dwell, or fails with `Timeout`
    /// once `deadline` passes.
    pub fn reserve(
        &self,
        expected: &'static Schema,
        deadline: Instant,
        key_for: impl FnOnce(u8) -> Correlation,
    ) -> Result<Ticket> {
        let mut inner = self.inner.lock();
        let tag = loop {
            let now = Instant::now();
            let ready_at = inner
                .free
                .front()
                .map(|(_, released)| released.map_or(now, |r| r + self.dwell));
            match ready_at {
                Some(ready_at) if ready_at <= now => {
                    if let Some((tag, _)) = inner.free.pop_front() {
                        break tag;
                    }
                }
                Some(ready_at) => {
                    if now >= deadline {
                        return Err(TransportError::Timeout.into());
                    }
                    self.tag_freed.wait_until(&mut inner, ready_at.min(deadline));
                }
                None => {
                    if self.tag_freed.wait_until(&mut inner, deadline).timed_out()
                        && inner.free.is_empty()
                    {
                        debug!("No software-id tag freed before the deadline");
                        return Err(TransportError::Timeout.into());
                    }
                }
            }
        };

        let key = key_for(tag);
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let (completion, receiver) = flume::bounded(1);
        inner.slots.push(Slot {
            tag,
            generation,
            key,
            expected,
            completion,
        });
        trace!(tag = tag, key = ?key, expected = expected.name, "Reserved software id");
        Ok(Ticket {
            tag,
            key,
            generation,
            receiver,
        })
    }

    /// Park until the ticket completes or `deadline` passes.
    ///
    /// On timeout the slot is cancelled and its tag released.
    pub fn wait(&self, ticket: &Ticket, deadline: Instant) -> Result<Message> {
        match ticket.receiver.recv_deadline(deadline) {
            Ok(result) => result,
            Err(flume::RecvTimeoutError::Timeout) => {
                self.cancel(ticket);
                // A response may have raced the deadline.
                match ticket.receiver.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout.into()),
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => Err(TransportError::LinkLost.into()),
        }
    }

    /// Drop the ticket's slot if it is still outstanding.
    pub fn cancel(&self, ticket: &Ticket) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner
            .slots
            .iter()
            .position(|s| s.tag == ticket.tag && s.generation == ticket.generation)
        {
            let slot = inner.slots.remove(pos);
            Self::release(&mut inner, slot.tag);
            self.tag_freed.notify_all();
        }
    }

    /// Remove the oldest waiter for `key`.
    pub fn take(&self, key: &Correlation) -> Option<Waiter> {
        let mut inner = self.inner.lock();
        let pos = inner.slots.iter().position(|s| s.key == *key)?;
        let slot = inner.slots.remove(pos);
        Self::release(&mut inner, slot.tag);
        self.tag_freed.notify_all();
        Some(Waiter {
            expected: slot.expected,
            tag: slot.tag,
            completion: slot.completion,
        })
    }

    /// Whether a waiter for `key` exists.
    pub fn contains(&self, key: &Correlation) -> bool {
        self.inner.lock().slots.iter().any(|s| s.key == *key)
    }

    /// Complete every outstanding request with `err`.
    pub fn fail_all(&self, err: Error) -> usize {
        let mut inner = self.inner.lock();
        let slots: Vec<Slot> = inner.slots.drain(..).collect();
        for slot in &slots {
            Self::release(&mut inner, slot.tag);
        }
        drop(inner);
        self.tag_freed.notify_all();
        for slot in &slots {
            let _ = slot.completion.send(Err(err.clone()));
        }
        if !slots.is_empty() {
            debug!(count = slots.len(), error = %err, "Failed outstanding requests");
        }
        slots.len()
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Whether `tag` is back in the free pool.
    pub fn is_free(&self, tag: u8) -> bool {
        self.inner.lock().free.iter().any(|(t, _)| *t == tag)
    }

    fn release(inner: &mut Inner, tag: u8) {
        inner.free.push_back((tag, Some(Instant::now())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::hidpp20::GET_FEATURE_RESPONSE;
    use std::sync::Arc;
    use std::thread;

    fn feature_key(tag: u8) -> Correlation {
        Correlation::Feature {
            feature_index: 0,
            function: 0,
            tag,
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(200)
    }

    #[test]
    fn tag_zero_is_used_last() {
        let table = PendingTable::new(Duration::ZERO);
        let tags: Vec<u8> = (0..TAG_COUNT)
            .map(|_| table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap().tag)
            .collect();
        assert_eq!(tags[0], 1);
        assert_eq!(tags[14], 15);
        assert_eq!(tags[15], 0);
    }

    #[test]
    fn reserve_times_out_when_exhausted() {
        let table = PendingTable::new(Duration::ZERO);
        let _tickets: Vec<Ticket> = (0..TAG_COUNT)
            .map(|_| table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap())
            .collect();
        let start = Instant::now();
        let err = table
            .reserve(
                &GET_FEATURE_RESPONSE,
                start + Duration::from_millis(50),
                feature_key,
            )
            .err()
            .unwrap();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn released_tags_are_reused_fifo() {
        let table = PendingTable::new(Duration::ZERO);
        let first = table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap();
        table.cancel(&first);
        assert!(table.is_free(first.tag));
        // The released tag queues behind the 15 never-used ones.
        let mut tags = Vec::new();
        for _ in 0..TAG_COUNT {
            let ticket = table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap();
            tags.push(ticket.tag);
        }
        assert_eq!(*tags.last().unwrap(), first.tag);
    }

    #[test]
    fn dwell_delays_reuse() {
        let table = PendingTable::new(Duration::from_millis(60));
        let mut tickets: Vec<Ticket> = (0..TAG_COUNT)
            .map(|_| table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap())
            .collect();
        let released = tickets.remove(0);
        table.cancel(&released);
        let start = Instant::now();
        let reused = table
            .reserve(
                &GET_FEATURE_RESPONSE,
                start + Duration::from_secs(1),
                feature_key,
            )
            .unwrap();
        assert_eq!(reused.tag, released.tag);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn take_completes_the_waiter() {
        let table = Arc::new(PendingTable::new(Duration::ZERO));
        let ticket = table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap();
        let key = ticket.key;
        let dispatcher = {
            let table = table.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let waiter = table.take(&key).unwrap();
                assert!(waiter.expected == &*GET_FEATURE_RESPONSE);
                waiter.complete(Ok(Message::new(&GET_FEATURE_RESPONSE)));
            })
        };
        let message = table.wait(&ticket, soon()).unwrap();
        dispatcher.join().unwrap();
        assert!(message.is(&GET_FEATURE_RESPONSE));
        assert_eq!(table.outstanding(), 0);
        assert!(table.is_free(ticket.tag));
    }

    #[test]
    fn wait_times_out_and_releases() {
        let table = PendingTable::new(Duration::ZERO);
        let ticket = table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap();
        let err = table
            .wait(&ticket, Instant::now() + Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(table.is_free(ticket.tag));
        assert!(!table.contains(&ticket.key));
    }

    #[test]
    fn stale_cancel_does_not_evict_new_owner() {
        let table = PendingTable::new(Duration::ZERO);
        let mut tickets: Vec<Ticket> = (0..TAG_COUNT)
            .map(|_| table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap())
            .collect();
        let old = tickets.remove(0);
        table.cancel(&old);
        let new = table.reserve(&GET_FEATURE_RESPONSE, soon(), feature_key).unwrap();
        assert_eq!(new.tag, old.tag);
        table.cancel(&old);
        assert!(table.contains(&new.key));
    }

    #[test]
    fn fail_all_wakes_everyone() {
        let table = Arc::new(PendingTable::new(Duration::ZERO));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    let ticket = table
                        .reserve(&GET_FEATURE_RESPONSE, soon(), feature_key)
                        .unwrap();
                    table.wait(&ticket, Instant::now() + Duration::from_secs(5))
                })
            })
            .collect();
        while table.outstanding() < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(table.fail_all(TransportError::LinkLost.into()), 3);
        for handle in handles {
            assert!(handle.join().unwrap().unwrap_err().is_link_lost());
        }
    }

    #[test]
    fn register_keys_resolve_in_order() {
        let table = PendingTable::new(Duration::ZERO);
        let key = Correlation::Register {
            sub_id: 0x81,
            address: 0x00,
        };
        let first = table.reserve(&GET_FEATURE_RESPONSE, soon(), |_| key).unwrap();
        let second = table.reserve(&GET_FEATURE_RESPONSE, soon(), |_| key).unwrap();
        assert_eq!(table.take(&key).unwrap().tag, first.tag);
        assert_eq!(table.take(&key).unwrap().tag, second.tag);
        assert!(table.take(&key).is_none());
        assert_eq!(key.wire_tag(), None);
    }
}
