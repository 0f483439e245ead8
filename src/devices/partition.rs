// MIT License - Copyright (c) 2026 Peter Wright

use bitflags::bitflags;

bitflags! {
    /// Partition condition flags from the six condition bytes of a
    /// Partition Status response.
    ///
    /// The 48-bit field is composed with the first condition byte as the
    /// most significant byte, so each literal below reads in wire order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PartitionConditionFlags: u64 {
        /// User code required to bypass zones
        const BYPASS_CODE_REQUIRED    = 0b_00000001_00000000_00000000_00000000_00000000_00000000;
        /// Fire trouble
        const FIRE_TROUBLE            = 0b_00000010_00000000_00000000_00000000_00000000_00000000;
        /// Fire alarm
        const FIRE                    = 0b_00000100_00000000_00000000_00000000_00000000_00000000;
        /// Pulsing buzzer
        const PULSING_BUZZER          = 0b_00001000_00000000_00000000_00000000_00000000_00000000;
        /// Telephone line fault memory
        const TLM_FAULT_MEMORY        = 0b_00010000_00000000_00000000_00000000_00000000_00000000;
        /// Armed
        const ARMED                   = 0b_01000000_00000000_00000000_00000000_00000000_00000000;
        /// Instant mode
        const INSTANT_MODE            = 0b_10000000_00000000_00000000_00000000_00000000_00000000;
        /// Previous alarm
        const PREVIOUS_ALARM          = 0b_00000000_00000001_00000000_00000000_00000000_00000000;
        /// Siren on
        const SIREN_ON                = 0b_00000000_00000010_00000000_00000000_00000000_00000000;
        /// Steady siren on
        const STEADY_SIREN_ON         = 0b_00000000_00000100_00000000_00000000_00000000_00000000;
        /// Alarm memory
        const ALARM_MEMORY            = 0b_00000000_00001000_00000000_00000000_00000000_00000000;
        /// Tamper
        const TAMPER                  = 0b_00000000_00010000_00000000_00000000_00000000_00000000;
        /// Cancel command entered
        const CANCEL_ENTERED          = 0b_00000000_00100000_00000000_00000000_00000000_00000000;
        /// Code entered
        const CODE_ENTERED            = 0b_00000000_01000000_00000000_00000000_00000000_00000000;
        /// Cancel pending
        const CANCEL_PENDING          = 0b_00000000_10000000_00000000_00000000_00000000_00000000;
        /// Silent exit enabled
        const SILENT_EXIT_ENABLED     = 0b_00000000_00000000_00000010_00000000_00000000_00000000;
        /// Entryguard (stay mode)
        const STAY_MODE               = 0b_00000000_00000000_00000100_00000000_00000000_00000000;
        /// Chime mode
        const CHIME_MODE              = 0b_00000000_00000000_00001000_00000000_00000000_00000000;
        /// Entry delay running
        const ENTRY_DELAY             = 0b_00000000_00000000_00010000_00000000_00000000_00000000;
        /// Delay expiration warning
        const DELAY_EXPIRATION_WARN   = 0b_00000000_00000000_00100000_00000000_00000000_00000000;
        /// Exit delay 1 running
        const EXIT_DELAY_1            = 0b_00000000_00000000_01000000_00000000_00000000_00000000;
        /// Exit delay 2 running
        const EXIT_DELAY_2            = 0b_00000000_00000000_10000000_00000000_00000000_00000000;
        /// LED extinguish
        const LED_EXTINGUISH          = 0b_00000000_00000000_00000000_00000001_00000000_00000000;
        /// Cross timing
        const CROSS_TIMING            = 0b_00000000_00000000_00000000_00000010_00000000_00000000;
        /// Recent close being timed
        const RECENT_CLOSE_TIMED      = 0b_00000000_00000000_00000000_00000100_00000000_00000000;
        /// Exit error triggered
        const EXIT_ERROR_TRIGGERED    = 0b_00000000_00000000_00000000_00010000_00000000_00000000;
        /// Auto home inhibited
        const AUTO_HOME_INHIBITED     = 0b_00000000_00000000_00000000_00100000_00000000_00000000;
        /// Sensor low battery
        const SENSOR_LOW_BATTERY      = 0b_00000000_00000000_00000000_01000000_00000000_00000000;
        /// Sensor lost supervision
        const SENSOR_LOST_SUPERVISION = 0b_00000000_00000000_00000000_10000000_00000000_00000000;
        /// Zone bypassed
        const ZONE_BYPASSED           = 0b_00000000_00000000_00000000_00000000_00000001_00000000;
        /// Force arm triggered by auto arm
        const FORCE_ARM_TRIGGERED     = 0b_00000000_00000000_00000000_00000000_00000010_00000000;
        /// Ready to arm
        const READY_TO_ARM            = 0b_00000000_00000000_00000000_00000000_00000100_00000000;
        /// Ready to force arm
        const READY_TO_FORCE_ARM      = 0b_00000000_00000000_00000000_00000000_00001000_00000000;
        /// Valid PIN accepted
        const VALID_PIN_ACCEPTED      = 0b_00000000_00000000_00000000_00000000_00010000_00000000;
        /// Chime on (sounding)
        const CHIME_ON                = 0b_00000000_00000000_00000000_00000000_00100000_00000000;
        /// Error beep (triple beep)
        const ERROR_BEEP              = 0b_00000000_00000000_00000000_00000000_01000000_00000000;
        /// Tone on (activation tone)
        const TONE_ON                 = 0b_00000000_00000000_00000000_00000000_10000000_00000000;
        /// Entry 1
        const ENTRY_1                 = 0b_00000000_00000000_00000000_00000000_00000000_00000001;
        /// Open period
        const OPEN_PERIOD             = 0b_00000000_00000000_00000000_00000000_00000000_00000010;
        /// Alarm sent using phone number 1
        const ALARM_SENT_PHONE_1      = 0b_00000000_00000000_00000000_00000000_00000000_00000100;
        /// Alarm sent using phone number 2
        const ALARM_SENT_PHONE_2      = 0b_00000000_00000000_00000000_00000000_00000000_00001000;
        /// Alarm sent using phone number 3
        const ALARM_SENT_PHONE_3      = 0b_00000000_00000000_00000000_00000000_00000000_00010000;
        /// Cancel report in the stack
        const CANCEL_IN_STACK         = 0b_00000000_00000000_00000000_00000000_00000000_00100000;
        /// Keyswitch armed
        const KEYSWITCH_ARMED         = 0b_00000000_00000000_00000000_00000000_00000000_01000000;
        /// Delay trip in progress (common zone)
        const DELAY_TRIP_IN_PROGRESS  = 0b_00000000_00000000_00000000_00000000_00000000_10000000;
    }
}

impl PartitionConditionFlags {
    /// Compose the 48-bit field from the six condition bytes in wire
    /// order. Undocumented bits are kept as-is.
    pub fn from_wire(bytes: [u8; 6]) -> Self {
        let mut value = 0u64;
        for byte in bytes {
            value = (value << 8) | u64::from(byte);
        }
        Self::from_bits_retain(value)
    }
}

/// Alarm state of a partition as Home Assistant understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Disarmed,
    ArmedHome,
    ArmedAway,
    Pending,
    Triggered,
    Arming,
    Disarming,
    Unknown,
}

impl PartitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionState::Disarmed => "disarmed",
            PartitionState::ArmedHome => "armed_home",
            PartitionState::ArmedAway => "armed_away",
            PartitionState::Pending => "pending",
            PartitionState::Triggered => "triggered",
            PartitionState::Arming => "arming",
            PartitionState::Disarming => "disarming",
            PartitionState::Unknown => "unknown",
        }
    }
}

/// Derive the alarm state from a condition field. First match wins:
///
/// 1. siren or previous alarm -> triggered
/// 2. entry delay -> pending
/// 3. exit delay before the panel reports armed -> arming
/// 4. armed + stay -> armed home
/// 5. armed -> armed away
/// 6. otherwise disarmed
pub fn derive_state(flags: PartitionConditionFlags) -> PartitionState {
    use PartitionConditionFlags as F;
    if flags.intersects(F::SIREN_ON | F::PREVIOUS_ALARM) {
        PartitionState::Triggered
    } else if flags.contains(F::ENTRY_DELAY) {
        PartitionState::Pending
    } else if flags.intersects(F::EXIT_DELAY_1 | F::EXIT_DELAY_2) && !flags.contains(F::ARMED) {
        PartitionState::Arming
    } else if flags.contains(F::ARMED) && flags.contains(F::STAY_MODE) {
        PartitionState::ArmedHome
    } else if flags.contains(F::ARMED) {
        PartitionState::ArmedAway
    } else {
        PartitionState::Disarmed
    }
}

/// A single alarm partition.
#[derive(Debug, Clone)]
pub struct Partition {
    pub index: u8,
    pub uid: String,
    /// Set once the panel has confirmed the partition exists via the
    /// System Status partition mask.
    pub valid: bool,
    condition: Option<PartitionConditionFlags>,
}

impl Partition {
    pub fn new(index: u8, panel_uid: &str) -> Self {
        Self {
            index,
            uid: format!("{panel_uid}_partition_{index}"),
            valid: false,
            condition: None,
        }
    }

    /// Replace the condition field from the six wire bytes.
    pub fn set_condition(&mut self, bytes: [u8; 6]) {
        self.condition = Some(PartitionConditionFlags::from_wire(bytes));
    }

    pub fn condition(&self) -> Option<PartitionConditionFlags> {
        self.condition
    }

    /// Current alarm state, computed from the condition field at call
    /// time. Unknown until the first Partition Status arrives.
    pub fn state(&self) -> PartitionState {
        self.condition.map(derive_state).unwrap_or(PartitionState::Unknown)
    }
}
