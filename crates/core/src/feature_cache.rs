//! Feature-index caches.
//!
//! Each channel keeps a `feature_id -> (feature_index, version)` map filled
//! lazily by root lookups. The manager also keeps an advisory map of the
//! first index ever seen for a few well-known features so a reconnect
//! handler can route events before the device has been asked again.

use crate::hidpp::features;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// One feature table entry. An index of 0 on a non-root feature records
/// that the device does not support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureEntry {
    pub feature_index: u8,
    pub feature_id: u16,
    pub version: u8,
    /// Copied from the advisory cache and not yet confirmed by the device.
    pub advisory: bool,
}

impl FeatureEntry {
    pub fn new(feature_id: u16, feature_index: u8, version: u8) -> Self {
        Self {
            feature_index,
            feature_id,
            version,
            advisory: false,
        }
    }

    pub fn root() -> Self {
        Self::new(features::ROOT, 0, 0)
    }

    pub fn is_supported(&self) -> bool {
        self.feature_id == features::ROOT || self.feature_index != 0
    }
}

/// Per-channel feature table. Root is always present at index 0.
#[derive(Default)]
pub struct FeatureCache {
    entries: RwLock<HashMap<u16, FeatureEntry>>,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, feature_id: u16) -> Option<FeatureEntry> {
        if feature_id == features::ROOT {
            return Some(FeatureEntry::root());
        }
        self.entries.read().get(&feature_id).copied()
    }

    pub fn insert(&self, entry: FeatureEntry) {
        if entry.feature_id == features::ROOT {
            return;
        }
        self.entries.write().insert(entry.feature_id, entry);
    }

    /// Entry currently mapped at `feature_index`.
    pub fn by_index(&self, feature_index: u8) -> Option<FeatureEntry> {
        if feature_index == 0 {
            return Some(FeatureEntry::root());
        }
        self.entries
            .read()
            .values()
            .find(|e| e.feature_index == feature_index)
            .copied()
    }

    pub fn remove(&self, feature_id: u16) -> Option<FeatureEntry> {
        self.entries.write().remove(&feature_id)
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        if !entries.is_empty() {
            debug!(count = entries.len(), "Clearing feature cache");
        }
        entries.clear();
    }

    /// Replace this table with a copy of `other`.
    pub fn copy_from(&self, other: &FeatureCache) {
        let snapshot = other.entries.read().clone();
        *self.entries.write() = snapshot;
    }

    /// Entries sorted by feature index, root excluded.
    pub fn snapshot(&self) -> Vec<FeatureEntry> {
        let mut entries: Vec<FeatureEntry> = self.entries.read().values().copied().collect();
        entries.sort_by_key(|e| (e.feature_index, e.feature_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Features whose first-seen index is remembered across channels.
pub const ADVISORY_FEATURES: &[u16] = &[features::WIRELESS_DEVICE_STATUS, features::UNIFIED_BATTERY];

/// First-seen indices of [`ADVISORY_FEATURES`], scoped to one manager.
#[derive(Default)]
pub struct AdvisoryCache {
    first_seen: RwLock<HashMap<u16, FeatureEntry>>,
}

impl AdvisoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember `entry` if it is tracked and not seen before.
    pub fn record(&self, entry: FeatureEntry) {
        if !ADVISORY_FEATURES.contains(&entry.feature_id) || !entry.is_supported() {
            return;
        }
        self.first_seen
            .write()
            .entry(entry.feature_id)
            .or_insert(FeatureEntry {
                advisory: false,
                ..entry
            });
    }

    pub fn get(&self, feature_id: u16) -> Option<FeatureEntry> {
        self.first_seen.read().get(&feature_id).copied()
    }

    /// Seed `cache` with advisory entries for features it does not know.
    pub fn prime(&self, cache: &FeatureCache) -> usize {
        let mut primed = 0;
        for entry in self.first_seen.read().values() {
            if cache.get(entry.feature_id).is_none() {
                cache.insert(FeatureEntry {
                    advisory: true,
                    ..*entry
                });
                primed += 1;
            }
        }
        primed
    }

    pub fn clear(&self) {
        self.first_seen.write().clear();
    }
}
