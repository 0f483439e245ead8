// MIT License - Copyright (c) 2026 Peter Wright

//! Bridge configuration.
//!
//! Every setting can come from the environment or from the command line;
//! a command-line flag wins over its environment variable.

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Parser;

use crate::error::{BridgeError, Result};
use crate::mqtt::sanitize_id;
use crate::protocol::pack_pin;

#[derive(Parser, Debug, Clone)]
#[command(name = "caddx2mqtt")]
#[command(about = "Bridge between a Caddx NX-series alarm panel and Home Assistant over MQTT")]
#[command(version)]
pub struct Config {
    /// Serial device path (e.g. /dev/ttyUSB0)
    #[arg(long, env = "SERIAL")]
    pub serial: String,

    /// Serial baud rate
    #[arg(long, env = "BAUD", default_value_t = 38400)]
    pub baud: u32,

    /// MQTT broker host
    #[arg(long, env = "MQTT_HOST")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT user name
    #[arg(long, env = "MQTT_USER")]
    pub mqtt_user: Option<String>,

    /// MQTT password
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub mqtt_password: Option<String>,

    /// MQTT QoS level for state, discovery and command topics (0-2)
    #[arg(long, env = "QOS", default_value_t = 1)]
    pub qos: u8,

    /// Home Assistant discovery prefix
    #[arg(long, env = "TOPIC_ROOT", default_value = "homeassistant")]
    pub topic_root: String,

    /// Identifier stem for this panel's topics and unique ids
    #[arg(long, env = "PANEL_UNIQUE_ID", default_value = "caddx_panel")]
    pub panel_unique_id: String,

    /// Display name for this panel's entities
    #[arg(long, env = "PANEL_NAME", default_value = "Caddx Alarm Panel")]
    pub panel_name: String,

    /// Highest zone index polled during synchronization
    #[arg(long, env = "MAX_ZONES", default_value_t = 8)]
    pub max_zones: u8,

    /// Comma-separated zone indices to skip (e.g. "3,5")
    #[arg(long, env = "IGNORED_ZONES")]
    pub ignored_zones: Option<String>,

    /// PIN for arm/disarm (4 or 6 digits). Mutually exclusive with --user.
    #[arg(long, env = "CODE", hide_env_values = true)]
    pub code: Option<String>,

    /// Panel user number for PIN-less arm/disarm (1-99)
    ///
    /// Parsed as a string because the USER environment variable usually
    /// holds the login name; a non-numeric value is ignored when a PIN is
    /// configured.
    #[arg(long, env = "USER")]
    pub user: Option<String>,

    /// Log level (DEBUG/INFO/WARN/ERROR)
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: String,

    /// Optional log file; rotates at 10 MB keeping 5 files
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Milliseconds between per-zone discovery publishes
    #[arg(long, env = "DISCOVERY_SPACING_MS", default_value_t = 1000)]
    pub discovery_spacing_ms: u64,
}

/// How arm/disarm commands authenticate against the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmAuth {
    Pin(String),
    User(u8),
}

impl Config {
    /// Check cross-field constraints that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.panel_uid().is_empty() {
            return Err(BridgeError::Config(
                "PANEL_UNIQUE_ID contains no usable characters".into(),
            ));
        }
        if self.qos > 2 {
            return Err(BridgeError::Config(format!("QOS must be 0, 1 or 2, got {}", self.qos)));
        }
        if self.max_zones == 0 {
            return Err(BridgeError::Config("MAX_ZONES must be at least 1".into()));
        }
        match (&self.code, self.user_number()) {
            (Some(_), Some(_)) => {
                return Err(BridgeError::Config("set either CODE or USER, not both".into()));
            }
            (Some(code), None) => {
                pack_pin(code)?;
            }
            (None, Some(user)) => {
                if !(1..=99).contains(&user) {
                    return Err(BridgeError::Config(format!(
                        "USER must be between 1 and 99, got {user}"
                    )));
                }
            }
            (None, None) => {
                return Err(BridgeError::Config(
                    "one of CODE or USER (a number 1-99) is required".into(),
                ));
            }
        }
        self.ignored_zone_set()?;
        Ok(())
    }

    fn user_number(&self) -> Option<u8> {
        self.user.as_deref().and_then(|raw| raw.trim().parse().ok())
    }

    /// The sanitized identifier stem used in topics and unique ids.
    pub fn panel_uid(&self) -> String {
        sanitize_id(self.panel_unique_id.trim())
    }

    pub fn arm_auth(&self) -> Result<ArmAuth> {
        match (&self.code, self.user_number()) {
            (Some(code), _) => Ok(ArmAuth::Pin(code.clone())),
            (None, Some(user)) => Ok(ArmAuth::User(user)),
            (None, None) => Err(BridgeError::Config("one of CODE or USER is required".into())),
        }
    }

    pub fn ignored_zone_set(&self) -> Result<BTreeSet<u8>> {
        let Some(raw) = &self.ignored_zones else {
            return Ok(BTreeSet::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u8>().map_err(|_| {
                    BridgeError::Config(format!("IGNORED_ZONES entry '{part}' is not a zone index"))
                })
            })
            .collect()
    }
}
