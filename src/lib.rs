// MIT License - Copyright (c) 2026 Peter Wright

//! # caddx2mqtt
//!
//! Direct serial communication with Caddx/GE/Interlogix NX-series alarm
//! panels over the NX-584 binary protocol, bridged to Home Assistant via
//! MQTT Discovery.
//!
//! The controller owns the serial link and a sequential command queue;
//! the MQTT client runs on its own task and feeds commands back through
//! an inbox channel, so one loop orders all state mutation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use tokio::sync::watch;
//! use tokio_serial::SerialPortBuilderExt;
//!
//! use caddx2mqtt::config::Config;
//! use caddx2mqtt::controller::{Controller, ControllerOptions};
//! use caddx2mqtt::frame::PanelLink;
//! use caddx2mqtt::mqtt::{self, HassBridge, Topics};
//! use caddx2mqtt::panel::PanelModel;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::parse();
//!     config.validate()?;
//!
//!     let stream = tokio_serial::new(&config.serial, config.baud).open_native_async()?;
//!     let topics = Topics::new(&config.topic_root, &config.panel_uid());
//!     let (publisher, requests, _mqtt_task) = mqtt::connect(&config, topics.clone());
//!     let bridge = HassBridge::new(publisher, topics, config.panel_name.clone());
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     let mut controller = Controller::new(
//!         PanelLink::new(stream),
//!         PanelModel::new(config.panel_uid()),
//!         bridge,
//!         requests,
//!         ControllerOptions::from_config(&config)?,
//!         shutdown_rx,
//!     );
//!     controller.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod controller;
pub mod devices;
pub mod error;
pub mod frame;
pub mod mqtt;
pub mod panel;
pub mod protocol;

// Re-exports for convenience
pub use config::{ArmAuth, Config};
pub use controller::{Controller, ControllerOptions};
pub use devices::partition::{Partition, PartitionConditionFlags, PartitionState, derive_state};
pub use devices::zone::{Zone, ZoneConditionFlags, ZoneTypeFlags};
pub use error::{BridgeError, Result};
pub use frame::{Frame, FrameError, PanelLink, fletcher16, stuff, unstuff};
pub use mqtt::{ArmMode, BridgeRequest, HassBridge, Publisher, Topics, ZoneSensorKind, sanitize_id};
pub use panel::PanelModel;
pub use protocol::{KeypadFunction, MessageSpec, MessageType, pack_pin};
