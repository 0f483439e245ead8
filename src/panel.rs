// MIT License - Copyright (c) 2026 Peter Wright

//! The in-process model of the panel: partition and zone registries.
//!
//! Entities are created during startup synchronization only. Once
//! [`PanelModel::mark_synced`] has been called the registries refuse to
//! grow; a message referencing an unknown index after that point is logged
//! and dropped by the caller.

use std::collections::BTreeMap;

use tracing::error;

use crate::devices::partition::Partition;
use crate::devices::zone::Zone;

pub struct PanelModel {
    panel_uid: String,
    partitions: BTreeMap<u8, Partition>,
    zones: BTreeMap<u8, Zone>,
    synced: bool,
    panel_id: Option<u8>,
    firmware: Option<String>,
    partition_mask: Option<u8>,
}

impl PanelModel {
    pub fn new(panel_uid: impl Into<String>) -> Self {
        Self {
            panel_uid: panel_uid.into(),
            partitions: BTreeMap::new(),
            zones: BTreeMap::new(),
            synced: false,
            panel_id: None,
            firmware: None,
            partition_mask: None,
        }
    }

    pub fn panel_uid(&self) -> &str {
        &self.panel_uid
    }

    pub fn synced(&self) -> bool {
        self.synced
    }

    /// Latch the end of startup synchronization. Irreversible for the
    /// lifetime of the process.
    pub fn mark_synced(&mut self) {
        self.synced = true;
    }

    /// Create a partition confirmed by the panel's partition mask.
    /// Returns `None` (and logs) if synchronization already completed.
    pub fn register_partition(&mut self, index: u8) -> Option<&mut Partition> {
        if self.synced && !self.partitions.contains_key(&index) {
            error!("Refusing to register partition {index} after synchronization");
            return None;
        }
        let entry = self.partitions.entry(index).or_insert_with(|| {
            let mut partition = Partition::new(index, &self.panel_uid);
            partition.valid = true;
            partition
        });
        Some(entry)
    }

    /// Create a zone discovered during synchronization. Returns `None`
    /// (and logs) if synchronization already completed.
    pub fn register_zone(&mut self, index: u8, name: &str) -> Option<&mut Zone> {
        if self.synced && !self.zones.contains_key(&index) {
            error!("Refusing to register zone {index} after synchronization");
            return None;
        }
        let entry = self
            .zones
            .entry(index)
            .or_insert_with(|| Zone::new(index, name, &self.panel_uid));
        Some(entry)
    }

    pub fn partition(&self, index: u8) -> Option<&Partition> {
        self.partitions.get(&index)
    }

    pub fn partition_mut(&mut self, index: u8) -> Option<&mut Partition> {
        self.partitions.get_mut(&index)
    }

    pub fn zone(&self, index: u8) -> Option<&Zone> {
        self.zones.get(&index)
    }

    pub fn zone_mut(&mut self, index: u8) -> Option<&mut Zone> {
        self.zones.get_mut(&index)
    }

    pub fn partition_by_uid(&self, uid: &str) -> Option<&Partition> {
        self.partitions.values().find(|p| p.uid == uid)
    }

    pub fn zone_by_uid(&self, uid: &str) -> Option<&Zone> {
        self.zones.values().find(|z| z.uid == uid)
    }

    /// Partitions in index order.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    /// Zones in index order.
    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.values()
    }

    pub fn panel_id(&self) -> Option<u8> {
        self.panel_id
    }

    pub fn set_panel_id(&mut self, id: u8) {
        self.panel_id = Some(id);
    }

    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    pub fn set_firmware(&mut self, firmware: impl Into<String>) {
        self.firmware = Some(firmware.into());
    }

    pub fn partition_mask(&self) -> Option<u8> {
        self.partition_mask
    }

    pub fn set_partition_mask(&mut self, mask: u8) {
        self.partition_mask = Some(mask);
    }
}
