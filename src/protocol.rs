// MIT License - Copyright (c) 2026 Peter Wright

//! NX-584 message catalog and protocol constants.

use bitflags::bitflags;

use crate::error::{BridgeError, Result};

/// NX-584 message type identifiers.
///
/// Responses from the panel live in 0x01-0x1F, requests to the panel in
/// 0x21-0x3F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    InterfaceConfigRsp = 0x01,
    ZoneNameRsp = 0x03,
    ZoneStatusRsp = 0x04,
    ZoneSnapshotRsp = 0x05,
    PartitionStatusRsp = 0x06,
    PartitionSnapshotRsp = 0x07,
    SystemStatusRsp = 0x08,
    X10MessageInd = 0x09,
    LogEventInd = 0x0A,
    KeypadButtonInd = 0x0B,
    ProgramDataRsp = 0x10,
    UserInfoRsp = 0x12,
    Failed = 0x1C,
    Ack = 0x1D,
    Nack = 0x1E,
    Rejected = 0x1F,

    InterfaceConfigReq = 0x21,
    ZoneNameReq = 0x23,
    ZoneStatusReq = 0x24,
    ZoneSnapshotReq = 0x25,
    PartitionStatusReq = 0x26,
    PartitionSnapshotReq = 0x27,
    SystemStatusReq = 0x28,
    X10MessageReq = 0x29,
    LogEventReq = 0x2A,
    KeypadTextMsgReq = 0x2B,
    KeypadTerminalModeReq = 0x2C,
    ProgramDataReq = 0x30,
    ProgramDataCmd = 0x31,
    UserInfoReqPin = 0x32,
    UserInfoReqNoPin = 0x33,
    SetUserCodePin = 0x34,
    SetUserCodeNoPin = 0x35,
    SetUserAuthorityPin = 0x36,
    SetUserAuthorityNoPin = 0x37,
    SetClockCalendar = 0x3B,
    PrimaryKeypadFuncPin = 0x3C,
    PrimaryKeypadFuncNoPin = 0x3D,
    SecondaryKeypadFunc = 0x3E,
    ZoneBypassToggle = 0x3F,
}

impl MessageType {
    /// The six-bit wire code of this message type.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let t = match code {
            0x01 => Self::InterfaceConfigRsp,
            0x03 => Self::ZoneNameRsp,
            0x04 => Self::ZoneStatusRsp,
            0x05 => Self::ZoneSnapshotRsp,
            0x06 => Self::PartitionStatusRsp,
            0x07 => Self::PartitionSnapshotRsp,
            0x08 => Self::SystemStatusRsp,
            0x09 => Self::X10MessageInd,
            0x0A => Self::LogEventInd,
            0x0B => Self::KeypadButtonInd,
            0x10 => Self::ProgramDataRsp,
            0x12 => Self::UserInfoRsp,
            0x1C => Self::Failed,
            0x1D => Self::Ack,
            0x1E => Self::Nack,
            0x1F => Self::Rejected,
            0x21 => Self::InterfaceConfigReq,
            0x23 => Self::ZoneNameReq,
            0x24 => Self::ZoneStatusReq,
            0x25 => Self::ZoneSnapshotReq,
            0x26 => Self::PartitionStatusReq,
            0x27 => Self::PartitionSnapshotReq,
            0x28 => Self::SystemStatusReq,
            0x29 => Self::X10MessageReq,
            0x2A => Self::LogEventReq,
            0x2B => Self::KeypadTextMsgReq,
            0x2C => Self::KeypadTerminalModeReq,
            0x30 => Self::ProgramDataReq,
            0x31 => Self::ProgramDataCmd,
            0x32 => Self::UserInfoReqPin,
            0x33 => Self::UserInfoReqNoPin,
            0x34 => Self::SetUserCodePin,
            0x35 => Self::SetUserCodeNoPin,
            0x36 => Self::SetUserAuthorityPin,
            0x37 => Self::SetUserAuthorityNoPin,
            0x3B => Self::SetClockCalendar,
            0x3C => Self::PrimaryKeypadFuncPin,
            0x3D => Self::PrimaryKeypadFuncNoPin,
            0x3E => Self::SecondaryKeypadFunc,
            0x3F => Self::ZoneBypassToggle,
            _ => return None,
        };
        Some(t)
    }
}

/// Handler binding for inbound messages. Dispatch is a match on this tag
/// rather than per-type callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    InterfaceConfig,
    ZoneName,
    ZoneStatus,
    ZoneSnapshot,
    PartitionStatus,
    SystemStatus,
    Ack,
    Nack,
    Rejection,
    None,
}

/// Static per-type metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSpec {
    pub msg_type: MessageType,
    /// Valid value of the wire length byte: type byte plus data bytes.
    pub valid_length: u8,
    /// Whether the panel answers this request with a bare ACK instead of a
    /// typed response.
    pub expects_ack: bool,
    pub handler: Handler,
}

impl MessageSpec {
    pub const fn of(msg_type: MessageType) -> MessageSpec {
        use Handler as H;
        use MessageType as M;
        let (valid_length, expects_ack, handler) = match msg_type {
            M::InterfaceConfigRsp => (11, false, H::InterfaceConfig),
            M::ZoneNameRsp => (18, false, H::ZoneName),
            M::ZoneStatusRsp => (8, false, H::ZoneStatus),
            M::ZoneSnapshotRsp => (10, false, H::ZoneSnapshot),
            M::PartitionStatusRsp => (9, false, H::PartitionStatus),
            M::PartitionSnapshotRsp => (9, false, H::None),
            M::SystemStatusRsp => (12, false, H::SystemStatus),
            M::X10MessageInd => (4, false, H::None),
            M::LogEventInd => (10, false, H::None),
            M::KeypadButtonInd => (3, false, H::None),
            M::ProgramDataRsp => (13, false, H::None),
            M::UserInfoRsp => (17, false, H::None),
            M::Failed => (1, false, H::Rejection),
            M::Ack => (1, false, H::Ack),
            M::Nack => (1, false, H::Nack),
            M::Rejected => (1, false, H::Rejection),
            M::InterfaceConfigReq => (1, false, H::None),
            M::ZoneNameReq => (2, false, H::None),
            M::ZoneStatusReq => (2, false, H::None),
            M::ZoneSnapshotReq => (2, false, H::None),
            M::PartitionStatusReq => (2, false, H::None),
            M::PartitionSnapshotReq => (1, false, H::None),
            M::SystemStatusReq => (1, false, H::None),
            M::X10MessageReq => (4, true, H::None),
            M::LogEventReq => (2, false, H::None),
            M::KeypadTextMsgReq => (12, true, H::None),
            M::KeypadTerminalModeReq => (3, true, H::None),
            M::ProgramDataReq => (4, false, H::None),
            M::ProgramDataCmd => (13, true, H::None),
            M::UserInfoReqPin => (5, false, H::None),
            M::UserInfoReqNoPin => (2, false, H::None),
            M::SetUserCodePin => (8, false, H::None),
            M::SetUserCodeNoPin => (5, false, H::None),
            M::SetUserAuthorityPin => (7, true, H::None),
            M::SetUserAuthorityNoPin => (4, true, H::None),
            M::SetClockCalendar => (7, true, H::Ack),
            M::PrimaryKeypadFuncPin => (6, true, H::Ack),
            M::PrimaryKeypadFuncNoPin => (4, true, H::Ack),
            M::SecondaryKeypadFunc => (3, true, H::Ack),
            M::ZoneBypassToggle => (2, true, H::Ack),
        };
        MessageSpec { msg_type, valid_length, expects_ack, handler }
    }

    pub fn for_code(code: u8) -> Option<MessageSpec> {
        MessageType::from_code(code).map(Self::of)
    }

    /// Whether the panel sends this type spontaneously as a transition
    /// broadcast.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self.msg_type,
            MessageType::InterfaceConfigRsp
                | MessageType::ZoneStatusRsp
                | MessageType::ZoneSnapshotRsp
                | MessageType::PartitionStatusRsp
                | MessageType::PartitionSnapshotRsp
                | MessageType::SystemStatusRsp
        )
    }
}

bitflags! {
    /// Transition-broadcast enable bits from the Interface Configuration
    /// response (2 bytes, little-endian on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransitionFlags: u16 {
        const INTERFACE_CONFIG   = 1 << 1;
        const ZONE_STATUS        = 1 << 4;
        const ZONE_SNAPSHOT      = 1 << 5;
        const PARTITION_STATUS   = 1 << 6;
        const PARTITION_SNAPSHOT = 1 << 7;
        const SYSTEM_STATUS      = 1 << 8;
        const X10_MESSAGE        = 1 << 9;
        const LOG_EVENT          = 1 << 10;
        const KEYPAD_BUTTON      = 1 << 11;
    }
}

bitflags! {
    /// Request/command enable bits from the Interface Configuration
    /// response (4 bytes, little-endian on the wire).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        const INTERFACE_CONFIG      = 1 << 1;
        const ZONE_NAME             = 1 << 3;
        const ZONE_STATUS           = 1 << 4;
        const ZONE_SNAPSHOT         = 1 << 5;
        const PARTITION_STATUS      = 1 << 6;
        const PARTITION_SNAPSHOT    = 1 << 7;
        const SYSTEM_STATUS         = 1 << 8;
        const X10_MESSAGE           = 1 << 9;
        const LOG_EVENT             = 1 << 10;
        const KEYPAD_TEXT_MESSAGE   = 1 << 11;
        const KEYPAD_TERMINAL_MODE  = 1 << 12;
        const PROGRAM_DATA          = 1 << 16;
        const PROGRAM_DATA_COMMAND  = 1 << 17;
        const USER_INFO_PIN         = 1 << 18;
        const USER_INFO_NO_PIN      = 1 << 19;
        const SET_USER_CODE_PIN     = 1 << 20;
        const SET_USER_CODE_NO_PIN  = 1 << 21;
        const SET_USER_AUTH_PIN     = 1 << 22;
        const SET_USER_AUTH_NO_PIN  = 1 << 23;
        const SET_CLOCK_CALENDAR    = 1 << 27;
        const PRIMARY_KEYPAD_PIN    = 1 << 28;
        const PRIMARY_KEYPAD_NO_PIN = 1 << 29;
        const SECONDARY_KEYPAD      = 1 << 30;
        const ZONE_BYPASS_TOGGLE    = 1 << 31;
    }
}

/// Transition broadcasts the panel must have enabled.
pub const REQUIRED_TRANSITIONS: TransitionFlags = TransitionFlags::INTERFACE_CONFIG
    .union(TransitionFlags::ZONE_STATUS)
    .union(TransitionFlags::ZONE_SNAPSHOT)
    .union(TransitionFlags::PARTITION_STATUS)
    .union(TransitionFlags::PARTITION_SNAPSHOT)
    .union(TransitionFlags::SYSTEM_STATUS);

/// Requests the panel must have enabled.
pub const REQUIRED_REQUESTS: RequestFlags = RequestFlags::INTERFACE_CONFIG
    .union(RequestFlags::ZONE_NAME)
    .union(RequestFlags::ZONE_STATUS)
    .union(RequestFlags::PARTITION_STATUS)
    .union(RequestFlags::SYSTEM_STATUS)
    .union(RequestFlags::SET_CLOCK_CALENDAR);

/// Decoded Interface Configuration response.
#[derive(Debug, Clone)]
pub struct InterfaceCapabilities {
    pub firmware: String,
    pub transitions: TransitionFlags,
    pub requests: RequestFlags,
}

impl InterfaceCapabilities {
    /// Parse the 10 data bytes of an Interface Configuration response:
    /// 4 ASCII firmware bytes, 2 transition-mask bytes, 4 request-mask
    /// bytes.
    pub fn parse(body: &[u8]) -> Self {
        let firmware = String::from_utf8_lossy(&body[0..4]).trim_end().to_string();
        let transitions =
            TransitionFlags::from_bits_retain(u16::from_le_bytes([body[4], body[5]]));
        let requests = RequestFlags::from_bits_retain(u32::from_le_bytes([
            body[6], body[7], body[8], body[9],
        ]));
        Self { firmware, transitions, requests }
    }

    /// Names of the required capabilities the panel does not have enabled.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        for (name, flag) in [
            ("Interface Config transition", TransitionFlags::INTERFACE_CONFIG),
            ("Zone Status transition", TransitionFlags::ZONE_STATUS),
            ("Zone Snapshot transition", TransitionFlags::ZONE_SNAPSHOT),
            ("Partition Status transition", TransitionFlags::PARTITION_STATUS),
            ("Partition Snapshot transition", TransitionFlags::PARTITION_SNAPSHOT),
            ("System Status transition", TransitionFlags::SYSTEM_STATUS),
        ] {
            if !self.transitions.contains(flag) {
                missing.push(name);
            }
        }
        for (name, flag) in [
            ("Interface Config request", RequestFlags::INTERFACE_CONFIG),
            ("Zone Name request", RequestFlags::ZONE_NAME),
            ("Zone Status request", RequestFlags::ZONE_STATUS),
            ("Partition Status request", RequestFlags::PARTITION_STATUS),
            ("System Status request", RequestFlags::SYSTEM_STATUS),
            ("Set Clock/Calendar request", RequestFlags::SET_CLOCK_CALENDAR),
        ] {
            if !self.requests.contains(flag) {
                missing.push(name);
            }
        }
        // Either keypad authentication path will do.
        if !self
            .requests
            .intersects(RequestFlags::PRIMARY_KEYPAD_PIN | RequestFlags::PRIMARY_KEYPAD_NO_PIN)
        {
            missing.push("Primary Keypad Function request");
        }
        missing
    }
}

/// Primary keypad function codes for partition control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeypadFunction {
    Disarm = 0x00,
    ArmAway = 0x02,
    ArmStay = 0x03,
}

/// Pack a 4- or 6-digit PIN into the 3-byte wire form: two digits per
/// byte, first digit in the low nibble.
///
/// `"1234"` packs to `[0x21, 0x43, 0x00]`.
pub fn pack_pin(pin: &str) -> Result<[u8; 3]> {
    if pin.len() != 4 && pin.len() != 6 {
        return Err(BridgeError::InvalidPin("PIN must be 4 or 6 digits".into()));
    }
    let digits: Vec<u8> = pin
        .chars()
        .map(|c| {
            c.to_digit(10)
                .map(|d| d as u8)
                .ok_or_else(|| BridgeError::InvalidPin("PIN must be numeric".into()))
        })
        .collect::<Result<_>>()?;

    let mut packed = [0u8; 3];
    for (i, pair) in digits.chunks(2).enumerate() {
        packed[i] = pair[0] | (pair[1] << 4);
    }
    Ok(packed)
}

/// Panel indices are 0-based on the wire; the model is 1-based.
pub fn wire_index(model_index: u8) -> u8 {
    model_index.wrapping_sub(1)
}

pub fn model_index(wire_index: u8) -> u8 {
    wire_index.wrapping_add(1)
}
