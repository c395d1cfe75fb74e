//! Notification identity bookkeeping and the in-memory device registry.
//!
//! Every desktop notification the shell owns is tracked here under a slot
//! key, so a newer event for the same concern replaces the visible bubble
//! instead of stacking a second one.

use std::collections::HashMap;

use gnomeconnect_engine::{Device, KnownDevice};

/// Identity slot for a notification the shell owns.
///
/// At most one live notification exists per key. Mirrored notifications get
/// one slot per (device, remote id) pair; call and battery state get one
/// rotating slot per device; membership gets one presence slot per device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandleKey {
    Presence(String),
    Battery(String),
    Call(String),
    Mirror { device: String, remote_id: String },
}

impl HandleKey {
    pub fn mirror(device: &str, remote_id: &str) -> Self {
        Self::Mirror {
            device: device.to_string(),
            remote_id: remote_id.to_string(),
        }
    }
}

/// Bidirectional map between slot keys and server notification handles.
///
/// The reverse index exists for NotificationClosed: the server reports a
/// handle, and the slot behind it must be cleared so the next event for
/// that concern gets a fresh bubble.
#[derive(Debug, Default)]
pub struct HandleTable {
    by_key: HashMap<HandleKey, u32>,
    by_handle: HashMap<u32, HandleKey>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a handle for a slot. Returns the handle it displaced, if any;
    /// the caller decides whether the old bubble still needs closing.
    pub fn insert(&mut self, key: HandleKey, handle: u32) -> Option<u32> {
        let old = self.by_key.insert(key.clone(), handle);
        if let Some(old) = old {
            self.by_handle.remove(&old);
        }
        self.by_handle.insert(handle, key);
        old
    }

    pub fn get(&self, key: &HandleKey) -> Option<u32> {
        self.by_key.get(key).copied()
    }

    pub fn remove(&mut self, key: &HandleKey) -> Option<u32> {
        let handle = self.by_key.remove(key)?;
        self.by_handle.remove(&handle);
        Some(handle)
    }

    /// Look up the slot behind a server handle, if we own it.
    pub fn key_for_handle(&self, handle: u32) -> Option<&HandleKey> {
        self.by_handle.get(&handle)
    }

    /// Clear whichever slot holds this handle. Used when the server reports
    /// a notification closed; unknown handles are ignored.
    pub fn remove_handle(&mut self, handle: u32) -> Option<HandleKey> {
        let key = self.by_handle.remove(&handle)?;
        self.by_key.remove(&key);
        Some(key)
    }

    pub fn contains(&self, key: &HandleKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Take every live handle, emptying the table. Shutdown path.
    pub fn drain_handles(&mut self) -> Vec<u32> {
        self.by_key.clear();
        self.by_handle.drain().map(|(handle, _)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Devices currently visible to the engine plus the persisted known list.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    present: HashMap<String, Device>,
    known: Vec<KnownDevice>,
}

impl DeviceRegistry {
    pub fn new(known: Vec<KnownDevice>) -> Self {
        Self {
            present: HashMap::new(),
            known,
        }
    }

    pub fn upsert(&mut self, device: Device) {
        self.present.insert(device.id.clone(), device);
    }

    pub fn remove(&mut self, device_id: &str) -> Option<Device> {
        self.present.remove(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.present.get(device_id)
    }

    pub fn set_paired(&mut self, device_id: &str, paired: bool) {
        if let Some(device) = self.present.get_mut(device_id) {
            device.paired = paired;
        }
    }

    /// Record a completed pairing in the known list. Returns true when the
    /// list changed and should be persisted.
    pub fn mark_known(&mut self, device: &Device) -> bool {
        match self.known.iter_mut().find(|k| k.id == device.id) {
            Some(existing) if existing.name == device.name => false,
            Some(existing) => {
                existing.name = device.name.clone();
                true
            }
            None => {
                self.known.push(KnownDevice {
                    id: device.id.clone(),
                    name: device.name.clone(),
                });
                true
            }
        }
    }

    /// Drop a device from the known list. Returns true when it was present.
    pub fn forget_known(&mut self, device_id: &str) -> bool {
        let before = self.known.len();
        self.known.retain(|k| k.id != device_id);
        self.known.len() != before
    }

    pub fn known(&self) -> &[KnownDevice] {
        &self.known
    }

    pub fn present(&self) -> impl Iterator<Item = &Device> {
        self.present.values()
    }

    /// Present devices that are paired, for presence reconciliation.
    pub fn paired_present(&self) -> Vec<Device> {
        self.present.values().filter(|d| d.paired).cloned().collect()
    }
}
