use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;

/// Replica count per device.
///
/// A device missing from the map is treated as hosting zero replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaPlacement(BTreeMap<DeviceId, u32>);

impl ReplicaPlacement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device: &DeviceId) -> u32 {
        self.0.get(device).copied().unwrap_or(0)
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.0.contains_key(device)
    }

    pub fn set(&mut self, device: DeviceId, count: u32) {
        self.0.insert(device, count);
    }

    pub fn entry_mut(&mut self, device: &DeviceId) -> Option<&mut u32> {
        self.0.get_mut(device)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, u32)> {
        self.0.iter().map(|(d, n)| (d, *n))
    }

    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(DeviceId, u32)> for ReplicaPlacement {
    fn from_iter<T: IntoIterator<Item = (DeviceId, u32)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Operation a worker must apply to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaOp {
    Add,
    Remove,
}

impl std::fmt::Display for ReplicaOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaOp::Add => write!(f, "add"),
            ReplicaOp::Remove => write!(f, "remove"),
        }
    }
}

/// One device's slice of a replica diff.
///
/// Serialized as `{"op": "add", "curr_num": 1, "target_num": 2}` so that the
/// payload shape stays stable for workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DiffEntry {
    Add {
        #[serde(rename = "curr_num")]
        curr: u32,
        #[serde(rename = "target_num")]
        target: u32,
    },
    Remove {
        #[serde(rename = "curr_num")]
        curr: u32,
        #[serde(rename = "target_num")]
        target: u32,
    },
}

impl DiffEntry {
    pub fn op(&self) -> ReplicaOp {
        match self {
            DiffEntry::Add { .. } => ReplicaOp::Add,
            DiffEntry::Remove { .. } => ReplicaOp::Remove,
        }
    }

    pub fn curr(&self) -> u32 {
        match *self {
            DiffEntry::Add { curr, .. } | DiffEntry::Remove { curr, .. } => curr,
        }
    }

    pub fn target(&self) -> u32 {
        match *self {
            DiffEntry::Add { target, .. } | DiffEntry::Remove { target, .. } => target,
        }
    }

    /// Number of unit operations this entry stands for, or `None` when the
    /// entry contradicts its own op (e.g. an add that shrinks).
    pub fn op_count(&self) -> Option<u32> {
        match *self {
            DiffEntry::Add { curr, target } if target > curr => Some(target - curr),
            DiffEntry::Remove { curr, target } if target < curr => Some(curr - target),
            _ => None,
        }
    }
}

/// Per-device diff between target and observed placement. Devices that need
/// no change are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaDiff(BTreeMap<DeviceId, DiffEntry>);

impl ReplicaDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: DeviceId, entry: DiffEntry) {
        self.0.insert(device, entry);
    }

    pub fn get(&self, device: &DeviceId) -> Option<&DiffEntry> {
        self.0.get(device)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceId, &DiffEntry)> {
        self.0.iter()
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
