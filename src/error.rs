// MIT License - Copyright (c) 2026 Peter Wright

use crate::frame::FrameError;
use crate::protocol::MessageType;

/// All errors that can occur in the caddx2mqtt bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("panel interface configuration is missing required messages")]
    PanelMisconfigured,

    #[error("command {msg_type:?} failed after {attempts} attempts")]
    CommandFailed { msg_type: MessageType, attempts: u32 },

    #[error("serial device error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("invalid PIN: {0}")]
    InvalidPin(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether this error should terminate the process.
    ///
    /// Frame errors other than a closed link are recovered locally (flush
    /// and continue), and a failed command is logged and dropped.
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Frame(e) => e.is_fatal(),
            BridgeError::PanelMisconfigured
            | BridgeError::Serial(_)
            | BridgeError::Config(_) => true,
            BridgeError::CommandFailed { .. }
            | BridgeError::Mqtt(_)
            | BridgeError::InvalidPin(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
