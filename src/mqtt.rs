// MIT License - Copyright (c) 2026 Peter Wright

//! Home Assistant MQTT bridge: discovery payloads, retained state topics,
//! availability, and command intake.
//!
//! The rumqttc event loop runs on its own task and never touches panel
//! state. Inbound commands are parsed into [`BridgeRequest`] values and
//! pushed onto an mpsc inbox that the controller drains, so the controller
//! stays the single ordering authority.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::devices::partition::Partition;
use crate::devices::zone::Zone;
use crate::error::Result;
use crate::panel::PanelModel;

/// Home Assistant's birth/will topic. HA publishes "online" here when it
/// (re)starts, which triggers a full discovery + state republish.
pub const HA_STATUS_TOPIC: &str = "homeassistant/status";

const MANUFACTURER: &str = "Caddx";
const MODEL: &str = "NX-584";

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const PAYLOAD_ON: &str = "ON";
const PAYLOAD_OFF: &str = "OFF";

/// Reduce an identifier to `[A-Za-z0-9_-]`, replacing everything else
/// with `_`. Idempotent.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// The three binary sensors published per zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSensorKind {
    Faulted,
    Bypassed,
    Trouble,
}

impl ZoneSensorKind {
    pub const ALL: [ZoneSensorKind; 3] =
        [ZoneSensorKind::Faulted, ZoneSensorKind::Bypassed, ZoneSensorKind::Trouble];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneSensorKind::Faulted => "faulted",
            ZoneSensorKind::Bypassed => "bypassed",
            ZoneSensorKind::Trouble => "trouble",
        }
    }

    fn display_name(&self) -> &'static str {
        match self {
            ZoneSensorKind::Faulted => "Faulted",
            ZoneSensorKind::Bypassed => "Bypassed",
            ZoneSensorKind::Trouble => "Trouble",
        }
    }

    fn device_class(&self) -> &'static str {
        match self {
            ZoneSensorKind::Faulted => "door",
            ZoneSensorKind::Bypassed => "safety",
            ZoneSensorKind::Trouble => "tamper",
        }
    }

    fn value(&self, zone: &Zone) -> bool {
        match self {
            ZoneSensorKind::Faulted => zone.faulted(),
            ZoneSensorKind::Bypassed => zone.bypassed(),
            ZoneSensorKind::Trouble => zone.trouble(),
        }
    }
}

/// Topic builder for one panel under one discovery prefix.
#[derive(Debug, Clone)]
pub struct Topics {
    root: String,
    panel_uid: String,
}

impl Topics {
    pub fn new(root: &str, panel_uid: &str) -> Self {
        Self { root: root.to_string(), panel_uid: panel_uid.to_string() }
    }

    pub fn panel_uid(&self) -> &str {
        &self.panel_uid
    }

    pub fn availability(&self) -> String {
        format!("{}/alarm_control_panel/{}/availability", self.root, self.panel_uid)
    }

    pub fn partition_config(&self, partition_uid: &str) -> String {
        format!("{}/alarm_control_panel/{}/{}/config", self.root, self.panel_uid, partition_uid)
    }

    pub fn partition_state(&self, partition_uid: &str) -> String {
        format!("{}/alarm_control_panel/{}/{}/state", self.root, self.panel_uid, partition_uid)
    }

    pub fn partition_command(&self, partition_uid: &str) -> String {
        format!("{}/alarm_control_panel/{}/{}/set", self.root, self.panel_uid, partition_uid)
    }

    /// Wildcard subscription covering every partition command topic.
    pub fn partition_command_filter(&self) -> String {
        format!("{}/alarm_control_panel/{}/+/set", self.root, self.panel_uid)
    }

    pub fn zone_config(&self, zone_uid: &str, kind: ZoneSensorKind) -> String {
        format!("{}/binary_sensor/{}/{}_{}/config", self.root, self.panel_uid, zone_uid, kind.as_str())
    }

    pub fn zone_state(&self, zone_uid: &str, kind: ZoneSensorKind) -> String {
        format!("{}/binary_sensor/{}/{}_{}/state", self.root, self.panel_uid, zone_uid, kind.as_str())
    }

    /// Extract the 1-based partition index from a command topic, or `None`
    /// if the topic does not name one of this panel's partitions.
    pub fn partition_index_from_command_topic(&self, topic: &str) -> Option<u8> {
        let prefix = format!("{}/alarm_control_panel/{}/", self.root, self.panel_uid);
        let uid = topic.strip_prefix(&prefix)?.strip_suffix("/set")?;
        let index = uid.strip_prefix(&format!("{}_partition_", self.panel_uid))?;
        index.parse::<u8>().ok().filter(|i| (1..=8).contains(i))
    }
}

// ---------------------------------------------------------------------------
// Discovery payloads
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct DeviceInfo {
    identifiers: Vec<String>,
    name: String,
    manufacturer: &'static str,
    model: &'static str,
}

#[derive(Serialize)]
struct AlarmPanelConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    command_topic: String,
    availability_topic: String,
    payload_arm_home: &'static str,
    payload_arm_away: &'static str,
    payload_disarm: &'static str,
    code_arm_required: bool,
    code_disarm_required: bool,
    supported_features: Vec<&'static str>,
    device: DeviceInfo,
}

#[derive(Serialize)]
struct BinarySensorConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    availability_topic: String,
    device_class: &'static str,
    payload_on: &'static str,
    payload_off: &'static str,
    device: DeviceInfo,
}

/// Build the discovery (topic, JSON payload) pair for a partition's alarm
/// control panel entity.
pub fn partition_discovery(
    topics: &Topics,
    panel_name: &str,
    partition: &Partition,
) -> (String, String) {
    let config = AlarmPanelConfig {
        name: format!("{} Partition {}", panel_name, partition.index),
        unique_id: partition.uid.clone(),
        state_topic: topics.partition_state(&partition.uid),
        command_topic: topics.partition_command(&partition.uid),
        availability_topic: topics.availability(),
        payload_arm_home: "ARM_HOME",
        payload_arm_away: "ARM_AWAY",
        payload_disarm: "DISARM",
        code_arm_required: false,
        code_disarm_required: false,
        supported_features: vec!["arm_home", "arm_away"],
        device: DeviceInfo {
            identifiers: vec![partition.uid.clone()],
            name: format!("{} Partition {}", panel_name, partition.index),
            manufacturer: MANUFACTURER,
            model: MODEL,
        },
    };
    let payload = serde_json::to_string(&config).unwrap_or_else(|e| {
        error!("Failed to serialize discovery payload: {e}");
        String::new()
    });
    (topics.partition_config(&partition.uid), payload)
}

/// Build the discovery (topic, JSON payload) pair for one of a zone's
/// binary sensors.
pub fn zone_discovery(
    topics: &Topics,
    panel_name: &str,
    zone: &Zone,
    kind: ZoneSensorKind,
) -> (String, String) {
    let config = BinarySensorConfig {
        name: format!("{} {}", zone.name, kind.display_name()),
        unique_id: format!("{}_{}", zone.uid, kind.as_str()),
        state_topic: topics.zone_state(&zone.uid, kind),
        availability_topic: topics.availability(),
        device_class: kind.device_class(),
        payload_on: PAYLOAD_ON,
        payload_off: PAYLOAD_OFF,
        device: DeviceInfo {
            identifiers: vec![zone.uid.clone()],
            name: format!("{} {}", panel_name, zone.name),
            manufacturer: MANUFACTURER,
            model: MODEL,
        },
    };
    let payload = serde_json::to_string(&config).unwrap_or_else(|e| {
        error!("Failed to serialize discovery payload: {e}");
        String::new()
    });
    (topics.zone_config(&zone.uid, kind), payload)
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

/// Seam between bridge semantics and the MQTT client, so tests can record
/// publications instead of talking to a broker.
#[allow(async_fn_in_trait)]
pub trait Publisher {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()>;
}

/// rumqttc-backed publisher. All publishes use the configured QoS and the
/// retain flag requested by the caller.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
}

impl MqttPublisher {
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> Result<()> {
        self.client.publish(topic, self.qos, retain, payload).await?;
        Ok(())
    }
}

/// Bridge semantics: what gets published where.
///
/// A failed publish is logged and dropped rather than propagated; the
/// client library reconnects to the broker on its own and panel handling
/// must continue in the meantime.
pub struct HassBridge<P> {
    publisher: P,
    topics: Topics,
    panel_name: String,
}

impl<P: Publisher> HassBridge<P> {
    pub fn new(publisher: P, topics: Topics, panel_name: impl Into<String>) -> Self {
        Self { publisher, topics, panel_name: panel_name.into() }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    async fn send(&self, topic: &str, payload: &str) {
        if let Err(e) = self.publisher.publish(topic, payload, true).await {
            error!("Failed to publish to {topic}: {e}");
        }
    }

    pub async fn publish_online(&self) {
        self.send(&self.topics.availability(), PAYLOAD_ONLINE).await;
    }

    pub async fn publish_offline(&self) {
        self.send(&self.topics.availability(), PAYLOAD_OFFLINE).await;
    }

    pub async fn publish_partition_config(&self, partition: &Partition) {
        let (topic, payload) = partition_discovery(&self.topics, &self.panel_name, partition);
        self.send(&topic, &payload).await;
    }

    pub async fn publish_zone_configs(&self, zone: &Zone) {
        for kind in ZoneSensorKind::ALL {
            let (topic, payload) = zone_discovery(&self.topics, &self.panel_name, zone, kind);
            self.send(&topic, &payload).await;
        }
    }

    pub async fn publish_partition_state(&self, partition: &Partition) {
        let topic = self.topics.partition_state(&partition.uid);
        self.send(&topic, partition.state().as_str()).await;
    }

    pub async fn publish_zone_states(&self, zone: &Zone) {
        for kind in ZoneSensorKind::ALL {
            let topic = self.topics.zone_state(&zone.uid, kind);
            let payload = if kind.value(zone) { PAYLOAD_ON } else { PAYLOAD_OFF };
            self.send(&topic, payload).await;
        }
    }

    /// Publish discovery configs for every registered entity. Zone configs
    /// are spaced out to avoid overrunning the broker.
    pub async fn publish_all_configs(&self, model: &PanelModel, spacing: Duration) {
        for partition in model.partitions() {
            self.publish_partition_config(partition).await;
        }
        let mut first = true;
        for zone in model.zones() {
            if !first && !spacing.is_zero() {
                sleep(spacing).await;
            }
            first = false;
            self.publish_zone_configs(zone).await;
        }
    }

    /// Publish current state for every registered entity.
    pub async fn publish_all_states(&self, model: &PanelModel) {
        for partition in model.partitions() {
            self.publish_partition_state(partition).await;
        }
        for zone in model.zones() {
            self.publish_zone_states(zone).await;
        }
    }

    /// Full republish: availability, discovery, then state. Used after a
    /// broker reconnect or a Home Assistant restart. Never issues panel
    /// commands.
    pub async fn republish_all(&self, model: &PanelModel, spacing: Duration) {
        self.publish_online().await;
        self.publish_all_configs(model, spacing).await;
        self.publish_all_states(model).await;
    }
}

// ---------------------------------------------------------------------------
// Command intake
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmMode {
    Home,
    Away,
}

/// Requests pushed from MQTT callbacks onto the controller's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRequest {
    Arm { partition: u8, mode: ArmMode },
    Disarm { partition: u8 },
    RepublishAll,
}

/// Parse an inbound MQTT publish into a bridge request.
pub fn request_from_publish(topics: &Topics, topic: &str, payload: &str) -> Option<BridgeRequest> {
    if topic == HA_STATUS_TOPIC {
        return (payload.trim() == PAYLOAD_ONLINE).then_some(BridgeRequest::RepublishAll);
    }
    let partition = topics.partition_index_from_command_topic(topic)?;
    match payload.trim() {
        "ARM_HOME" => Some(BridgeRequest::Arm { partition, mode: ArmMode::Home }),
        "ARM_AWAY" => Some(BridgeRequest::Arm { partition, mode: ArmMode::Away }),
        "DISARM" => Some(BridgeRequest::Disarm { partition }),
        _ => None,
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Connect to the broker and spawn the MQTT event-loop task.
///
/// The LWT is preset to `offline` on the availability topic. Returns the
/// shared publisher, the request inbox, and the task handle.
pub fn connect(
    config: &Config,
    topics: Topics,
) -> (MqttPublisher, mpsc::Receiver<BridgeRequest>, tokio::task::JoinHandle<()>) {
    let qos = qos_from_level(config.qos);

    let mut options =
        MqttOptions::new(format!("caddx2mqtt-{}", topics.panel_uid()), &config.mqtt_host, config.mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(topics.availability(), PAYLOAD_OFFLINE, qos, true));
    if let Some(user) = &config.mqtt_user {
        options.set_credentials(user, config.mqtt_password.clone().unwrap_or_default());
    }

    let (client, mut event_loop) = AsyncClient::new(options, 64);
    let publisher = MqttPublisher { client: client.clone(), qos };
    let (request_tx, request_rx) = mpsc::channel(32);

    let command_filter = topics.partition_command_filter();
    let task = tokio::spawn(async move {
        let mut first_connect = true;
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    // Subscriptions do not survive a reconnect.
                    if let Err(e) = client.subscribe(&command_filter, qos).await {
                        error!("Failed to subscribe to {command_filter}: {e}");
                    }
                    if let Err(e) = client.subscribe(HA_STATUS_TOPIC, qos).await {
                        error!("Failed to subscribe to {HA_STATUS_TOPIC}: {e}");
                    }
                    if first_connect {
                        first_connect = false;
                    } else if request_tx.send(BridgeRequest::RepublishAll).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload);
                    match request_from_publish(&topics, &publish.topic, &payload) {
                        Some(request) => {
                            info!("MQTT request on {}: {payload}", publish.topic);
                            if request_tx.send(request).await.is_err() {
                                break;
                            }
                        }
                        None if publish.topic == HA_STATUS_TOPIC => {
                            debug!("Home Assistant status: {payload}");
                        }
                        None => {
                            warn!("Unhandled MQTT message on {}: {payload}", publish.topic);
                        }
                    }
                }
                Ok(event) => {
                    debug!("MQTT event: {event:?}");
                }
                Err(e) => {
                    // rumqttc reconnects on the next poll.
                    error!("MQTT event loop error: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        debug!("MQTT event loop task finished");
    });

    (publisher, request_rx, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_id("caddx_panel"), "caddx_panel");
        assert_eq!(sanitize_id("my panel #2"), "my_panel__2");
        assert_eq!(sanitize_id("a.b/c"), "a_b_c");
        assert_eq!(sanitize_id("AB-cd_9"), "AB-cd_9");
    }

    #[test]
    fn test_sanitize_idempotent() {
        for raw in ["caddx panel", "x/y#z", "___", "weird\u{e9}name"] {
            let once = sanitize_id(raw);
            assert_eq!(sanitize_id(&once), once);
            assert!(once.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        }
    }

    #[test]
    fn test_topic_layout() {
        let topics = Topics::new("homeassistant", "test_panel");
        assert_eq!(
            topics.availability(),
            "homeassistant/alarm_control_panel/test_panel/availability"
        );
        assert_eq!(
            topics.partition_config("test_panel_partition_1"),
            "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/config"
        );
        assert_eq!(
            topics.partition_state("test_panel_partition_1"),
            "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/state"
        );
        assert_eq!(
            topics.partition_command("test_panel_partition_1"),
            "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/set"
        );
        assert_eq!(
            topics.zone_config("test_panel_zone_1", ZoneSensorKind::Faulted),
            "homeassistant/binary_sensor/test_panel/test_panel_zone_1_faulted/config"
        );
        assert_eq!(
            topics.zone_state("test_panel_zone_1", ZoneSensorKind::Trouble),
            "homeassistant/binary_sensor/test_panel/test_panel_zone_1_trouble/state"
        );
    }

    #[test]
    fn test_topic_custom_root() {
        let topics = Topics::new("my_root", "bedroom_panel");
        assert_eq!(
            topics.partition_state("bedroom_panel_partition_2"),
            "my_root/alarm_control_panel/bedroom_panel/bedroom_panel_partition_2/state"
        );
    }

    #[test]
    fn test_partition_index_from_command_topic() {
        let topics = Topics::new("homeassistant", "test_panel");
        assert_eq!(
            topics.partition_index_from_command_topic(
                "homeassistant/alarm_control_panel/test_panel/test_panel_partition_3/set"
            ),
            Some(3)
        );
        assert_eq!(
            topics.partition_index_from_command_topic(
                "homeassistant/alarm_control_panel/test_panel/test_panel_partition_0/set"
            ),
            None
        );
        assert_eq!(
            topics.partition_index_from_command_topic(
                "homeassistant/alarm_control_panel/other_panel/other_panel_partition_1/set"
            ),
            None
        );
        assert_eq!(
            topics.partition_index_from_command_topic(
                "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/state"
            ),
            None
        );
    }

    #[test]
    fn test_request_from_publish() {
        let topics = Topics::new("homeassistant", "test_panel");
        let set = "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/set";
        assert_eq!(
            request_from_publish(&topics, set, "ARM_HOME"),
            Some(BridgeRequest::Arm { partition: 1, mode: ArmMode::Home })
        );
        assert_eq!(
            request_from_publish(&topics, set, "ARM_AWAY"),
            Some(BridgeRequest::Arm { partition: 1, mode: ArmMode::Away })
        );
        assert_eq!(
            request_from_publish(&topics, set, "DISARM"),
            Some(BridgeRequest::Disarm { partition: 1 })
        );
        assert_eq!(request_from_publish(&topics, set, "EXPLODE"), None);
        assert_eq!(
            request_from_publish(&topics, HA_STATUS_TOPIC, "online"),
            Some(BridgeRequest::RepublishAll)
        );
        assert_eq!(request_from_publish(&topics, HA_STATUS_TOPIC, "offline"), None);
    }

    #[test]
    fn test_partition_discovery_payload() {
        let topics = Topics::new("homeassistant", "test_panel");
        let partition = Partition::new(1, "test_panel");
        let (topic, payload) = partition_discovery(&topics, "Test Alarm Panel", &partition);
        assert_eq!(
            topic,
            "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/config"
        );

        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["unique_id"], "test_panel_partition_1");
        assert_eq!(
            value["state_topic"],
            "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/state"
        );
        assert_eq!(
            value["command_topic"],
            "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/set"
        );
        assert_eq!(
            value["availability_topic"],
            "homeassistant/alarm_control_panel/test_panel/availability"
        );
        assert_eq!(value["code_disarm_required"], false);
        assert_eq!(value["payload_arm_home"], "ARM_HOME");
        assert_eq!(value["supported_features"], serde_json::json!(["arm_home", "arm_away"]));
        assert_eq!(value["device"]["manufacturer"], "Caddx");
        assert_eq!(value["device"]["model"], "NX-584");
        assert_eq!(value["device"]["identifiers"], serde_json::json!(["test_panel_partition_1"]));
    }

    #[test]
    fn test_zone_discovery_payloads() {
        let topics = Topics::new("homeassistant", "test_panel");
        let zone = Zone::new(1, "Front Door", "test_panel");

        let (topic, payload) =
            zone_discovery(&topics, "Test Alarm Panel", &zone, ZoneSensorKind::Bypassed);
        assert_eq!(
            topic,
            "homeassistant/binary_sensor/test_panel/test_panel_zone_1_bypassed/config"
        );
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["unique_id"], "test_panel_zone_1_bypassed");
        assert_eq!(value["device_class"], "safety");
        assert_eq!(value["name"], "Front Door Bypassed");
        assert_eq!(value["payload_on"], "ON");

        let (_, payload) =
            zone_discovery(&topics, "Test Alarm Panel", &zone, ZoneSensorKind::Trouble);
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["device_class"], "tamper");
        assert_eq!(
            value["state_topic"],
            "homeassistant/binary_sensor/test_panel/test_panel_zone_1_trouble/state"
        );
    }
}
