// End-to-end bridge tests.
//
// A scripted panel sits on the far side of an in-memory duplex pipe and
// answers synchronization requests; a recording publisher captures what
// would go to the MQTT broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use caddx2mqtt::config::ArmAuth;
use caddx2mqtt::controller::{Controller, ControllerOptions};
use caddx2mqtt::frame::{Frame, FrameError, PanelLink, fletcher16, stuff};
use caddx2mqtt::mqtt::{ArmMode, BridgeRequest, HassBridge, Publisher, Topics};
use caddx2mqtt::panel::PanelModel;
use caddx2mqtt::error::BridgeError;
use caddx2mqtt::protocol::{
    MessageType, REQUIRED_REQUESTS, REQUIRED_TRANSITIONS, RequestFlags, TransitionFlags,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Publication {
    topic: String,
    payload: String,
    retain: bool,
}

#[derive(Clone, Default)]
struct RecordingPublisher {
    records: Arc<Mutex<Vec<Publication>>>,
}

impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> caddx2mqtt::Result<()> {
        self.records.lock().unwrap().push(Publication {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }
}

enum Inject {
    Frame(MessageType, Vec<u8>, bool),
    Raw(Vec<u8>),
}

#[derive(Clone)]
struct PanelBehavior {
    partition_mask: u8,
    /// Names by wire index (zone 1 first); an empty name marks the zone
    /// inactive.
    zone_names: Vec<&'static str>,
    /// Whether keypad function requests are acknowledged.
    ack_keypad: bool,
}

fn behavior(partition_mask: u8, zone_names: Vec<&'static str>) -> PanelBehavior {
    PanelBehavior { partition_mask, zone_names, ack_keypad: true }
}

struct ScriptedPanel {
    behavior: PanelBehavior,
    received: Arc<Mutex<Vec<Frame>>>,
    inject_rx: mpsc::Receiver<Inject>,
}

fn interface_config_body() -> Vec<u8> {
    let mut body = vec![b'0', b'1', b'7', b' '];
    body.extend_from_slice(&REQUIRED_TRANSITIONS.bits().to_le_bytes());
    let requests =
        REQUIRED_REQUESTS | RequestFlags::PRIMARY_KEYPAD_PIN | RequestFlags::PRIMARY_KEYPAD_NO_PIN;
    body.extend_from_slice(&requests.bits().to_le_bytes());
    body
}

impl ScriptedPanel {
    async fn run(mut self, stream: DuplexStream) {
        let mut link =
            PanelLink::with_timeouts(stream, Duration::from_millis(200), Duration::from_millis(10));
        loop {
            match link.read_frame(false).await {
                Ok(frame) => {
                    self.received.lock().unwrap().push(frame.clone());
                    self.respond(&mut link, &frame).await;
                }
                Err(FrameError::Timeout) => {}
                Err(e) if e.is_fatal() => return,
                Err(_) => {}
            }
            while let Ok(inject) = self.inject_rx.try_recv() {
                match inject {
                    Inject::Frame(msg_type, body, ack) => {
                        link.write_frame(msg_type, &body, ack).await.unwrap();
                    }
                    Inject::Raw(bytes) => {
                        link.get_mut().write_all(&bytes).await.unwrap();
                    }
                }
            }
        }
    }

    async fn respond(&self, link: &mut PanelLink<DuplexStream>, frame: &Frame) {
        match frame.msg_type {
            MessageType::InterfaceConfigReq => {
                link.write_frame(MessageType::InterfaceConfigRsp, &interface_config_body(), false)
                    .await
                    .unwrap();
            }
            MessageType::SystemStatusReq => {
                let mut body = vec![0u8; 11];
                body[0] = 0x01;
                body[9] = self.behavior.partition_mask;
                link.write_frame(MessageType::SystemStatusRsp, &body, false).await.unwrap();
            }
            MessageType::PartitionStatusReq => {
                let body = vec![frame.body[0], 0, 0, 0, 0, 0, 0, 0];
                link.write_frame(MessageType::PartitionStatusRsp, &body, false).await.unwrap();
            }
            MessageType::ZoneNameReq => {
                let name =
                    self.behavior.zone_names.get(frame.body[0] as usize).copied().unwrap_or("");
                let mut body = vec![frame.body[0]];
                let mut bytes = name.as_bytes().to_vec();
                bytes.resize(16, 0x00);
                body.extend_from_slice(&bytes);
                link.write_frame(MessageType::ZoneNameRsp, &body, false).await.unwrap();
            }
            MessageType::ZoneStatusReq => {
                // Type flags 0x000001, no conditions, partition 1.
                let body = vec![frame.body[0], 0x01, 0x01, 0x00, 0x00, 0x00, 0x00];
                link.write_frame(MessageType::ZoneStatusRsp, &body, false).await.unwrap();
            }
            MessageType::SetClockCalendar => {
                link.write_frame(MessageType::Ack, &[], false).await.unwrap();
            }
            MessageType::PrimaryKeypadFuncPin | MessageType::PrimaryKeypadFuncNoPin => {
                if self.behavior.ack_keypad {
                    link.write_frame(MessageType::Ack, &[], false).await.unwrap();
                }
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    records: Arc<Mutex<Vec<Publication>>>,
    received: Arc<Mutex<Vec<Frame>>>,
    inject_tx: mpsc::Sender<Inject>,
    request_tx: mpsc::Sender<BridgeRequest>,
    shutdown_tx: watch::Sender<bool>,
    controller_task: tokio::task::JoinHandle<caddx2mqtt::Result<()>>,
    panel_task: tokio::task::JoinHandle<()>,
}

fn test_options() -> ControllerOptions {
    let mut opts = ControllerOptions::new(ArmAuth::Pin("1234".into()));
    opts.max_zones = 1;
    opts.response_timeout = Duration::from_millis(500);
    opts.retry_backoff = Duration::from_millis(20);
    opts.ack_delay = Duration::ZERO;
    opts.republish_interval = Duration::from_secs(600);
    opts.discovery_spacing = Duration::ZERO;
    opts
}

async fn start(behavior: PanelBehavior, opts: ControllerOptions) -> Harness {
    let (bridge_end, panel_end) = tokio::io::duplex(4096);
    let records = Arc::new(Mutex::new(Vec::new()));
    let received = Arc::new(Mutex::new(Vec::new()));
    let (inject_tx, inject_rx) = mpsc::channel(16);
    let (request_tx, request_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let panel = ScriptedPanel { behavior, received: received.clone(), inject_rx };
    let panel_task = tokio::spawn(panel.run(panel_end));

    let publisher = RecordingPublisher { records: records.clone() };
    let bridge = HassBridge::new(
        publisher,
        Topics::new("homeassistant", "test_panel"),
        "Test Alarm Panel",
    );
    let link = PanelLink::with_timeouts(
        bridge_end,
        Duration::from_millis(300),
        Duration::from_millis(10),
    );
    let mut controller = Controller::new(
        link,
        PanelModel::new("test_panel"),
        bridge,
        request_rx,
        opts,
        shutdown_rx,
    );
    let controller_task = tokio::spawn(async move { controller.run().await });

    Harness {
        records,
        received,
        inject_tx,
        request_tx,
        shutdown_tx,
        controller_task,
        panel_task,
    }
}

impl Harness {
    fn publications(&self) -> Vec<Publication> {
        self.records.lock().unwrap().clone()
    }

    fn panel_frames(&self) -> Vec<Frame> {
        self.received.lock().unwrap().clone()
    }

    async fn wait_until(&self, what: &str, pred: impl Fn(&Harness) -> bool) {
        let waited = timeout(Duration::from_secs(10), async {
            while !pred(self) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    /// Wait until the initial publish burst after sync has finished (the
    /// zone trouble state is the last thing published for zone `index`).
    async fn wait_for_initial_publish(&self, index: u8) {
        let topic =
            format!("homeassistant/binary_sensor/test_panel/test_panel_zone_{index}_trouble/state");
        self.wait_until("initial publish burst", |h| {
            h.publications().iter().any(|p| p.topic == topic)
        })
        .await;
    }

    fn last_payload(&self, topic: &str) -> Option<String> {
        self.publications()
            .iter()
            .rev()
            .find(|p| p.topic == topic)
            .map(|p| p.payload.clone())
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let joined = timeout(Duration::from_secs(5), self.controller_task).await;
        assert!(joined.is_ok(), "controller did not stop");
        self.panel_task.abort();
    }
}

fn raw_frame(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut message = vec![body.len() as u8 + 1, msg_type];
    message.extend_from_slice(body);
    let checksum = fletcher16(&message);
    message.extend_from_slice(&checksum);
    let mut wire = vec![0x7E];
    wire.extend(stuff(&message));
    wire
}

const PARTITION_1_STATE: &str =
    "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/state";
const PARTITION_1_CONFIG: &str =
    "homeassistant/alarm_control_panel/test_panel/test_panel_partition_1/config";

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sync_from_single_partition_panel() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;

    let pubs = h.publications();
    let configs: Vec<&Publication> =
        pubs.iter().filter(|p| p.topic.ends_with("/config")).collect();
    assert_eq!(configs.len(), 4, "one partition + three zone sensors: {configs:#?}");
    assert!(pubs.iter().all(|p| p.retain), "all publishes are retained");

    assert_eq!(h.last_payload(PARTITION_1_STATE).as_deref(), Some("disarmed"));
    for kind in ["faulted", "bypassed", "trouble"] {
        let topic =
            format!("homeassistant/binary_sensor/test_panel/test_panel_zone_1_{kind}/state");
        assert_eq!(h.last_payload(&topic).as_deref(), Some("OFF"), "{kind} should be OFF");
    }
    assert_eq!(
        h.last_payload("homeassistant/alarm_control_panel/test_panel/availability").as_deref(),
        Some("online")
    );

    // Discovery always precedes the first state publish.
    let config_at = pubs.iter().position(|p| p.topic == PARTITION_1_CONFIG).unwrap();
    let state_at = pubs.iter().position(|p| p.topic == PARTITION_1_STATE).unwrap();
    assert!(config_at < state_at);

    h.stop().await;
}

#[tokio::test]
async fn entry_delay_transition_publishes_pending() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;

    // Armed with the entry delay running.
    h.inject_tx
        .send(Inject::Frame(
            MessageType::PartitionStatusRsp,
            vec![0x00, 0x40, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00],
            false,
        ))
        .await
        .unwrap();

    h.wait_until("pending state", |h| {
        h.last_payload(PARTITION_1_STATE).as_deref() == Some("pending")
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn arm_away_command_emits_keypad_frame() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;

    h.request_tx
        .send(BridgeRequest::Arm { partition: 1, mode: ArmMode::Away })
        .await
        .unwrap();

    h.wait_until("keypad frame", |h| {
        h.panel_frames().iter().any(|f| f.msg_type == MessageType::PrimaryKeypadFuncPin)
    })
    .await;

    let frames = h.panel_frames();
    let keypad = frames
        .iter()
        .find(|f| f.msg_type == MessageType::PrimaryKeypadFuncPin)
        .unwrap();
    // PIN 1234, partition mask 0x01, arm-away function code.
    assert_eq!(keypad.body, vec![0x21, 0x43, 0x00, 0x01, 0x02]);
    assert!(!keypad.ack_requested);

    h.stop().await;
}

#[tokio::test]
async fn unanswered_arm_command_is_dropped_after_retries() {
    let mut behavior = behavior(0x01, vec!["Front Door"]);
    behavior.ack_keypad = false;
    let mut opts = test_options();
    opts.response_timeout = Duration::from_millis(100);
    let h = start(behavior, opts).await;
    h.wait_for_initial_publish(1).await;
    let states_before = h
        .publications()
        .iter()
        .filter(|p| p.topic == PARTITION_1_STATE)
        .count();

    h.request_tx
        .send(BridgeRequest::Arm { partition: 1, mode: ArmMode::Away })
        .await
        .unwrap();

    h.wait_until("three transmissions", |h| {
        h.panel_frames()
            .iter()
            .filter(|f| f.msg_type == MessageType::PrimaryKeypadFuncPin)
            .count()
            == 3
    })
    .await;
    sleep(Duration::from_millis(300)).await;

    // The command is dropped after the final attempt: no further
    // retransmissions and no state publish for the failed arm.
    let keypad_frames = h
        .panel_frames()
        .iter()
        .filter(|f| f.msg_type == MessageType::PrimaryKeypadFuncPin)
        .count();
    assert_eq!(keypad_frames, 3);
    let states_after = h
        .publications()
        .iter()
        .filter(|p| p.topic == PARTITION_1_STATE)
        .count();
    assert_eq!(states_after, states_before);
    assert_eq!(h.last_payload(PARTITION_1_STATE).as_deref(), Some("disarmed"));

    // The main loop keeps running: a later transition still publishes.
    h.inject_tx
        .send(Inject::Frame(
            MessageType::PartitionStatusRsp,
            vec![0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            false,
        ))
        .await
        .unwrap();
    h.wait_until("armed state after dropped command", |h| {
        h.last_payload(PARTITION_1_STATE).as_deref() == Some("armed_away")
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn disarm_command_uses_user_number_auth() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let mut opts = test_options();
    opts.auth = ArmAuth::User(5);
    let h = start(behavior, opts).await;
    h.wait_for_initial_publish(1).await;

    // Arm first so the disarm sanity check passes.
    h.inject_tx
        .send(Inject::Frame(
            MessageType::PartitionStatusRsp,
            vec![0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            false,
        ))
        .await
        .unwrap();
    h.wait_until("armed state", |h| {
        h.last_payload(PARTITION_1_STATE).as_deref() == Some("armed_away")
    })
    .await;

    h.request_tx.send(BridgeRequest::Disarm { partition: 1 }).await.unwrap();
    h.wait_until("keypad frame", |h| {
        h.panel_frames().iter().any(|f| f.msg_type == MessageType::PrimaryKeypadFuncNoPin)
    })
    .await;

    let frames = h.panel_frames();
    let keypad = frames
        .iter()
        .find(|f| f.msg_type == MessageType::PrimaryKeypadFuncNoPin)
        .unwrap();
    // User 5, partition mask 0x01, disarm function code.
    assert_eq!(keypad.body, vec![0x05, 0x01, 0x00]);

    h.stop().await;
}

#[tokio::test]
async fn corrupted_frame_is_rejected_without_state_change() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;
    let states_before = h
        .publications()
        .iter()
        .filter(|p| p.topic == PARTITION_1_STATE)
        .count();

    // Valid armed-away status with one body bit flipped after checksumming.
    let mut wire = raw_frame(0x06, &[0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    wire[3] ^= 0x01;
    h.inject_tx.send(Inject::Raw(wire)).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let states_after = h
        .publications()
        .iter()
        .filter(|p| p.topic == PARTITION_1_STATE)
        .count();
    assert_eq!(states_before, states_after, "corrupt frame must not publish state");
    assert_eq!(h.last_payload(PARTITION_1_STATE).as_deref(), Some("disarmed"));

    // The link recovers: a well-formed transition still comes through.
    h.inject_tx
        .send(Inject::Frame(
            MessageType::PartitionStatusRsp,
            vec![0x00, 0x40, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            false,
        ))
        .await
        .unwrap();
    h.wait_until("armed state after recovery", |h| {
        h.last_payload(PARTITION_1_STATE).as_deref() == Some("armed_away")
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn ha_restart_republishes_without_panel_traffic() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;

    let configs_before = h
        .publications()
        .iter()
        .filter(|p| p.topic.ends_with("/config"))
        .count();
    let frames_before = h.panel_frames().len();

    // What the MQTT task sends when homeassistant/status reports online.
    h.request_tx.send(BridgeRequest::RepublishAll).await.unwrap();

    h.wait_until("republished configs", |h| {
        h.publications().iter().filter(|p| p.topic.ends_with("/config")).count()
            == configs_before * 2
    })
    .await;

    let pubs = h.publications();
    assert!(
        pubs.iter().filter(|p| p.topic == PARTITION_1_STATE).count() >= 2,
        "states republished"
    );
    assert_eq!(h.panel_frames().len(), frames_before, "no new panel commands issued");

    h.stop().await;
}

#[tokio::test]
async fn ignored_zones_are_never_requested_or_registered() {
    let behavior =
        behavior(0x01, vec!["Front Door", "Back Door", "Basement", "Window", "Attic"]);
    let mut opts = test_options();
    opts.max_zones = 5;
    opts.ignored_zones = [3u8, 5].into();
    let h = start(behavior, opts).await;
    h.wait_for_initial_publish(4).await;

    for frame in h.panel_frames() {
        if matches!(frame.msg_type, MessageType::ZoneNameReq | MessageType::ZoneStatusReq) {
            let index = frame.body[0] + 1;
            assert!(index != 3 && index != 5, "zone {index} should not be requested");
        }
    }

    let pubs = h.publications();
    assert!(!pubs.iter().any(|p| p.topic.contains("zone_3") || p.topic.contains("zone_5")));
    // 1 partition config + 3 configs for each of zones 1, 2 and 4.
    let configs = pubs.iter().filter(|p| p.topic.ends_with("/config")).count();
    assert_eq!(configs, 1 + 3 * 3);

    h.stop().await;
}

#[tokio::test]
async fn unnamed_zone_is_left_inactive() {
    let behavior =
        behavior(0x01, vec!["Front Door", ""]);
    let mut opts = test_options();
    opts.max_zones = 2;
    let h = start(behavior, opts).await;
    h.wait_for_initial_publish(1).await;

    let pubs = h.publications();
    assert!(!pubs.iter().any(|p| p.topic.contains("zone_2")));
    assert_eq!(pubs.iter().filter(|p| p.topic.ends_with("/config")).count(), 4);

    h.stop().await;
}

#[tokio::test]
async fn late_unknown_zone_status_is_dropped() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;
    let pubs_before = h.publications().len();

    // Status for zone 2, which was never registered.
    h.inject_tx
        .send(Inject::Frame(
            MessageType::ZoneStatusRsp,
            vec![0x01, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00],
            false,
        ))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let pubs = h.publications();
    assert_eq!(pubs.len(), pubs_before, "unknown zone must not publish anything");
    assert!(!pubs.iter().any(|p| p.topic.contains("zone_2")));

    h.stop().await;
}

#[tokio::test]
async fn zone_fault_transition_publishes_on() {
    let behavior = behavior(0x01, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;

    // Zone 1 faulted.
    h.inject_tx
        .send(Inject::Frame(
            MessageType::ZoneStatusRsp,
            vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00],
            false,
        ))
        .await
        .unwrap();

    let faulted_topic =
        "homeassistant/binary_sensor/test_panel/test_panel_zone_1_faulted/state";
    h.wait_until("faulted ON", |h| h.last_payload(faulted_topic).as_deref() == Some("ON")).await;

    let bypassed_topic =
        "homeassistant/binary_sensor/test_panel/test_panel_zone_1_bypassed/state";
    assert_eq!(h.last_payload(bypassed_topic).as_deref(), Some("OFF"));

    h.stop().await;
}

#[tokio::test]
async fn misconfigured_panel_fails_startup() {
    let (bridge_end, panel_end) = tokio::io::duplex(4096);

    // A panel with only the Interface Config transition enabled.
    let panel_task = tokio::spawn(async move {
        let mut link = PanelLink::with_timeouts(
            panel_end,
            Duration::from_millis(200),
            Duration::from_millis(10),
        );
        loop {
            match link.read_frame(true).await {
                Ok(frame) if frame.msg_type == MessageType::InterfaceConfigReq => {
                    let mut body = vec![b'0', b'1', b'7', b' '];
                    body.extend_from_slice(
                        &TransitionFlags::INTERFACE_CONFIG.bits().to_le_bytes(),
                    );
                    body.extend_from_slice(&REQUIRED_REQUESTS.bits().to_le_bytes());
                    link.write_frame(MessageType::InterfaceConfigRsp, &body, false)
                        .await
                        .unwrap();
                }
                Ok(_) => {}
                Err(FrameError::Timeout) => {}
                Err(_) => return,
            }
        }
    });

    let (_request_tx, request_rx) = mpsc::channel(16);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let bridge = HassBridge::new(
        RecordingPublisher::default(),
        Topics::new("homeassistant", "test_panel"),
        "Test Alarm Panel",
    );
    let link = PanelLink::with_timeouts(
        bridge_end,
        Duration::from_millis(300),
        Duration::from_millis(10),
    );
    let mut controller = Controller::new(
        link,
        PanelModel::new("test_panel"),
        bridge,
        request_rx,
        test_options(),
        shutdown_rx,
    );

    let result = timeout(Duration::from_secs(10), controller.run()).await.unwrap();
    assert!(matches!(result, Err(BridgeError::PanelMisconfigured)));
    panel_task.abort();
}

#[tokio::test]
async fn multi_partition_panel_discovers_all_partitions() {
    let behavior = behavior(0b1000_0001, vec!["Front Door"]);
    let h = start(behavior, test_options()).await;
    h.wait_for_initial_publish(1).await;

    let pubs = h.publications();
    for index in [1u8, 8] {
        let config = format!(
            "homeassistant/alarm_control_panel/test_panel/test_panel_partition_{index}/config"
        );
        assert!(pubs.iter().any(|p| p.topic == config), "partition {index} discovered");
    }
    assert!(!pubs.iter().any(|p| p.topic.contains("partition_2")));

    h.stop().await;
}
