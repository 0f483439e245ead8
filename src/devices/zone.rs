// MIT License - Copyright (c) 2026 Peter Wright

use bitflags::bitflags;

bitflags! {
    /// Zone type flags from the three type bytes of a Zone Status
    /// response (little-endian on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ZoneTypeFlags: u32 {
        /// Fire zone
        const FIRE               = 1 << 0;
        /// 24-hour zone
        const HOUR_24            = 1 << 1;
        /// Keyswitch zone
        const KEY_SWITCH         = 1 << 2;
        /// Follower zone
        const FOLLOWER           = 1 << 3;
        /// Entry/exit delay 1 zone
        const ENTRY_EXIT_DELAY_1 = 1 << 4;
        /// Entry/exit delay 2 zone
        const ENTRY_EXIT_DELAY_2 = 1 << 5;
        /// Interior zone
        const INTERIOR           = 1 << 6;
        /// Local only
        const LOCAL_ONLY         = 1 << 7;
        /// Keypad sounder zone
        const KEYPAD_SOUNDER     = 1 << 8;
        /// Yelping siren zone
        const YELPING_SIREN      = 1 << 9;
        /// Steady siren zone
        const STEADY_SIREN       = 1 << 10;
        /// Chime zone
        const CHIME              = 1 << 11;
        /// Bypassable
        const BYPASSABLE         = 1 << 12;
        /// Group bypassable
        const GROUP_BYPASSABLE   = 1 << 13;
        /// Force armable
        const FORCE_ARMABLE      = 1 << 14;
        /// Entry guard zone
        const ENTRY_GUARD        = 1 << 15;
        /// Fast loop response zone
        const FAST_LOOP_RESPONSE = 1 << 16;
        /// Double EOL tamper zone
        const DOUBLE_EOL_TAMPER  = 1 << 17;
        /// Trouble zone
        const TROUBLE            = 1 << 18;
        /// Cross zone
        const CROSS_ZONE         = 1 << 19;
        /// Dialer delay zone
        const DIALER_DELAY       = 1 << 20;
        /// Swinger shutdown zone
        const SWINGER_SHUTDOWN   = 1 << 21;
        /// Restorable
        const RESTORABLE         = 1 << 22;
        /// Listen-in zone
        const LISTEN_IN          = 1 << 23;
    }
}

impl ZoneTypeFlags {
    pub fn from_wire(bytes: [u8; 3]) -> Self {
        Self::from_bits_retain(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }
}

bitflags! {
    /// Zone condition flags from the two condition bytes of a Zone Status
    /// response (little-endian on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ZoneConditionFlags: u16 {
        /// Faulted (tripped)
        const FAULTED          = 1 << 0;
        /// Tampered
        const TAMPERED         = 1 << 1;
        /// Trouble condition
        const TROUBLE          = 1 << 2;
        /// Bypassed
        const BYPASSED         = 1 << 3;
        /// Inhibited (force armed)
        const INHIBITED        = 1 << 4;
        /// Low battery
        const LOW_BATTERY      = 1 << 5;
        /// Supervision lost
        const SUPERVISION_LOST = 1 << 6;
        /// Communication failure
        const COMM_FAILURE     = 1 << 7;
        /// Zone triggered the last alarm event
        const ALARM_MEMORY     = 1 << 8;
        /// Zone was bypassed during the last alarm event
        const BYPASS_MEMORY    = 1 << 9;
    }
}

impl ZoneConditionFlags {
    pub fn from_wire(bytes: [u8; 2]) -> Self {
        Self::from_bits_retain(u16::from_le_bytes(bytes))
    }

    /// Everything that counts as a trouble condition for the trouble
    /// binary sensor.
    const TROUBLE_ANY: ZoneConditionFlags = ZoneConditionFlags::TAMPERED
        .union(ZoneConditionFlags::TROUBLE)
        .union(ZoneConditionFlags::INHIBITED)
        .union(ZoneConditionFlags::LOW_BATTERY)
        .union(ZoneConditionFlags::SUPERVISION_LOST)
        .union(ZoneConditionFlags::COMM_FAILURE);
}

/// A single alarm zone.
#[derive(Debug, Clone)]
pub struct Zone {
    pub index: u8,
    pub uid: String,
    pub name: String,
    partition_mask: u8,
    type_flags: ZoneTypeFlags,
    condition: ZoneConditionFlags,
    touched: bool,
}

impl Zone {
    pub fn new(index: u8, name: impl Into<String>, panel_uid: &str) -> Self {
        Self {
            index,
            uid: format!("{panel_uid}_zone_{index}"),
            name: name.into(),
            partition_mask: 0,
            type_flags: ZoneTypeFlags::empty(),
            condition: ZoneConditionFlags::empty(),
            touched: false,
        }
    }

    /// Update from the data bytes of a Zone Status response.
    pub fn set_masks(&mut self, partition_mask: u8, type_bytes: [u8; 3], condition_bytes: [u8; 2]) {
        self.partition_mask = partition_mask;
        self.type_flags = ZoneTypeFlags::from_wire(type_bytes);
        self.condition = ZoneConditionFlags::from_wire(condition_bytes);
        self.touched = true;
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// A Zone Snapshot referenced this zone. The snapshot bit layout is
    /// unconfirmed, so only freshness is recorded.
    pub fn touch(&mut self) {
        self.touched = true;
    }

    pub fn is_touched(&self) -> bool {
        self.touched
    }

    pub fn faulted(&self) -> bool {
        self.condition.contains(ZoneConditionFlags::FAULTED)
    }

    pub fn bypassed(&self) -> bool {
        self.condition.contains(ZoneConditionFlags::BYPASSED)
    }

    pub fn trouble(&self) -> bool {
        self.condition.intersects(ZoneConditionFlags::TROUBLE_ANY)
    }

    pub fn condition(&self) -> ZoneConditionFlags {
        self.condition
    }

    pub fn type_flags(&self) -> ZoneTypeFlags {
        self.type_flags
    }

    pub fn partition_mask(&self) -> u8 {
        self.partition_mask
    }

    /// Whether this zone belongs to the given 1-based partition.
    pub fn in_partition(&self, partition_index: u8) -> bool {
        partition_index >= 1 && self.partition_mask & (1 << (partition_index - 1)) != 0
    }
}
