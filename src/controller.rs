// MIT License - Copyright (c) 2026 Peter Wright

//! The panel controller: serial I/O loop, sequential command queue with
//! retries, transition dispatch, and startup synchronization.
//!
//! One controller task owns the serial link, the command queue, and the
//! panel model exclusively. MQTT callbacks never call in here; they push
//! [`BridgeRequest`] values onto an inbox that the main loop drains, so
//! all state mutation is ordered by this loop.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use chrono::{Datelike, Local, Timelike};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use crate::config::{ArmAuth, Config};
use crate::error::{BridgeError, Result};
use crate::frame::{Frame, FrameError, PanelLink};
use crate::mqtt::{ArmMode, BridgeRequest, HassBridge, Publisher};
use crate::panel::PanelModel;
use crate::protocol::{
    Handler, InterfaceCapabilities, KeypadFunction, MessageSpec, MessageType, model_index,
    pack_pin, wire_index,
};

/// Tuning knobs for the controller. The defaults match a live panel;
/// tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub auth: ArmAuth,
    pub max_zones: u8,
    pub ignored_zones: BTreeSet<u8>,
    /// Attempts per queued command, including the first transmission.
    pub max_attempts: u32,
    /// Window for the panel to answer one transmission.
    pub response_timeout: Duration,
    /// Pause before retransmitting after a timeout or NACK.
    pub retry_backoff: Duration,
    /// Settle delay before acknowledging a transition broadcast.
    pub ack_delay: Duration,
    /// How often all states are republished for broker-restart resilience.
    pub republish_interval: Duration,
    /// Spacing between per-zone discovery publishes.
    pub discovery_spacing: Duration,
}

impl ControllerOptions {
    pub fn new(auth: ArmAuth) -> Self {
        Self {
            auth,
            max_zones: 8,
            ignored_zones: BTreeSet::new(),
            max_attempts: 3,
            response_timeout: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(250),
            ack_delay: Duration::from_millis(250),
            republish_interval: Duration::from_secs(60 * 60),
            discovery_spacing: Duration::from_secs(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut options = Self::new(config.arm_auth()?);
        options.max_zones = config.max_zones;
        options.ignored_zones = config.ignored_zone_set()?;
        options.discovery_spacing = Duration::from_millis(config.discovery_spacing_ms);
        Ok(options)
    }
}

/// One pending outbound request.
///
/// The completion sink, when present, receives the response body or the
/// failure once the command leaves the queue.
struct QueuedCommand {
    msg_type: MessageType,
    body: Vec<u8>,
    request_ack: bool,
    expect: Option<MessageType>,
    done: Option<oneshot::Sender<Result<Vec<u8>>>>,
}

impl QueuedCommand {
    fn request(msg_type: MessageType, body: Vec<u8>, expect: Option<MessageType>) -> Self {
        Self { msg_type, body, request_ack: false, expect, done: None }
    }
}

/// What happened to one transmission of a queued command.
enum AwaitOutcome {
    Completed(Vec<u8>),
    Rejected(MessageType),
    Retry,
}

pub struct Controller<T, P> {
    link: PanelLink<T>,
    model: PanelModel,
    bridge: HassBridge<P>,
    inbox: mpsc::Receiver<BridgeRequest>,
    queue: VecDeque<QueuedCommand>,
    opts: ControllerOptions,
    shutdown: watch::Receiver<bool>,
}

impl<T, P> Controller<T, P>
where
    T: AsyncRead + AsyncWrite + Unpin,
    P: Publisher,
{
    pub fn new(
        link: PanelLink<T>,
        model: PanelModel,
        bridge: HassBridge<P>,
        inbox: mpsc::Receiver<BridgeRequest>,
        opts: ControllerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { link, model, bridge, inbox, queue: VecDeque::new(), opts, shutdown }
    }

    pub fn model(&self) -> &PanelModel {
        &self.model
    }

    pub async fn publish_offline(&self) {
        self.bridge.publish_offline().await;
    }

    /// Synchronize with the panel, announce entities, then run the main
    /// loop until shutdown is signalled or a fatal error occurs.
    pub async fn run(&mut self) -> Result<()> {
        self.purge_stale_messages().await?;

        info!("Starting panel synchronization");
        self.sync().await?;
        info!("Synchronization complete, setting panel clock and announcing entities");

        self.enqueue_set_clock();
        self.process_queue().await?;

        self.bridge.publish_all_configs(&self.model, self.opts.discovery_spacing).await;
        self.bridge.publish_online().await;
        self.bridge.publish_all_states(&self.model).await;

        let mut next_republish = Instant::now() + self.opts.republish_interval;
        loop {
            if *self.shutdown.borrow() {
                info!("Shutdown requested, leaving control loop");
                break;
            }

            self.process_queue().await?;

            match self.link.read_frame(false).await {
                Ok(frame) => self.dispatch_transition(frame).await?,
                Err(FrameError::Timeout) => {}
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Discarding malformed frame: {e}"),
            }

            while let Ok(request) = self.inbox.try_recv() {
                self.handle_request(request).await?;
            }

            if Instant::now() >= next_republish {
                next_republish = Instant::now() + self.opts.republish_interval;
                debug!("Periodic state republish");
                self.bridge.publish_all_states(&self.model).await;
            }
        }
        Ok(())
    }

    /// Discard transition messages queued up from before startup so they
    /// cannot interleave with synchronization responses.
    async fn purge_stale_messages(&mut self) -> Result<()> {
        self.link.flush_input().await;
        self.send_ack().await?;
        loop {
            match self.link.read_frame(true).await {
                Ok(frame) => {
                    debug!(
                        "Discarding stale message 0x{:02x} from before startup",
                        frame.msg_type.code()
                    );
                    if frame.ack_requested {
                        self.send_ack().await?;
                    }
                }
                Err(FrameError::Timeout) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => warn!("Discarding undecodable stale data: {e}"),
            }
        }
    }

    /// The startup synchronization sequence: interface configuration
    /// check, system status and per-partition status, then a name and
    /// status request per non-ignored zone.
    async fn sync(&mut self) -> Result<()> {
        self.queue.push_back(QueuedCommand::request(
            MessageType::InterfaceConfigReq,
            Vec::new(),
            Some(MessageType::InterfaceConfigRsp),
        ));
        self.queue.push_back(QueuedCommand::request(
            MessageType::SystemStatusReq,
            Vec::new(),
            Some(MessageType::SystemStatusRsp),
        ));
        // The System Status handler appends one Partition Status request
        // per active partition; drain those before moving on to zones.
        self.process_queue().await?;

        for zone in 1..=self.opts.max_zones {
            if self.opts.ignored_zones.contains(&zone) {
                debug!("Not requesting zone {zone}, ignored");
                continue;
            }
            self.queue.push_back(QueuedCommand::request(
                MessageType::ZoneNameReq,
                vec![wire_index(zone)],
                Some(MessageType::ZoneNameRsp),
            ));
            self.queue.push_back(QueuedCommand::request(
                MessageType::ZoneStatusReq,
                vec![wire_index(zone)],
                Some(MessageType::ZoneStatusRsp),
            ));
        }

        self.process_queue().await?;
        self.model.mark_synced();
        Ok(())
    }

    /// Drain the command queue, strictly one outstanding request at a
    /// time.
    async fn process_queue(&mut self) -> Result<()> {
        while let Some(command) = self.queue.pop_front() {
            self.execute(command).await?;
        }
        Ok(())
    }

    async fn execute(&mut self, mut command: QueuedCommand) -> Result<()> {
        // Fire-and-forget: nothing to wait for.
        if !command.request_ack && command.expect.is_none() {
            self.link.write_frame(command.msg_type, &command.body, false).await?;
            if let Some(done) = command.done.take() {
                let _ = done.send(Ok(Vec::new()));
            }
            return Ok(());
        }

        for attempt in 1..=self.opts.max_attempts {
            if attempt > 1 {
                warn!(
                    "Retrying {:?} (attempt {attempt}/{})",
                    command.msg_type, self.opts.max_attempts
                );
                sleep(self.opts.retry_backoff).await;
            }
            self.link.write_frame(command.msg_type, &command.body, command.request_ack).await?;

            match self.await_response(&command).await? {
                AwaitOutcome::Completed(body) => {
                    debug!("Command {:?} completed", command.msg_type);
                    if let Some(done) = command.done.take() {
                        let _ = done.send(Ok(body));
                    }
                    return Ok(());
                }
                AwaitOutcome::Rejected(response) => {
                    error!("Command {:?} rejected by panel with {:?}", command.msg_type, response);
                    if let Some(done) = command.done.take() {
                        let _ = done.send(Err(BridgeError::CommandFailed {
                            msg_type: command.msg_type,
                            attempts: attempt,
                        }));
                    }
                    return Ok(());
                }
                AwaitOutcome::Retry => {}
            }
        }

        error!(
            "Command {:?} failed after {} attempts, dropping",
            command.msg_type, self.opts.max_attempts
        );
        if let Some(done) = command.done.take() {
            let _ = done.send(Err(BridgeError::CommandFailed {
                msg_type: command.msg_type,
                attempts: self.opts.max_attempts,
            }));
        }
        Ok(())
    }

    /// Wait out one response window for a transmitted command.
    ///
    /// Transition broadcasts arriving in the window are dispatched
    /// normally but do not satisfy the wait; a non-broadcast response of
    /// the wrong type fails the command.
    async fn await_response(&mut self, command: &QueuedCommand) -> Result<AwaitOutcome> {
        let mut awaiting_ack = command.request_ack;
        let deadline = Instant::now() + self.opts.response_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Timeout waiting for response to {:?}", command.msg_type);
                return Ok(AwaitOutcome::Retry);
            }

            let frame = match self.link.read_frame_within(remaining).await {
                Ok(frame) => frame,
                Err(FrameError::Timeout) => {
                    warn!("Timeout waiting for response to {:?}", command.msg_type);
                    return Ok(AwaitOutcome::Retry);
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!("Discarding malformed frame while awaiting {:?}: {e}", command.msg_type);
                    continue;
                }
            };

            match frame.msg_type {
                MessageType::Ack => {
                    if awaiting_ack {
                        awaiting_ack = false;
                        if command.expect.is_none() {
                            return Ok(AwaitOutcome::Completed(frame.body));
                        }
                    } else if command.expect == Some(MessageType::Ack) {
                        return Ok(AwaitOutcome::Completed(frame.body));
                    } else {
                        debug!("Unexpected ACK while awaiting {:?}", command.msg_type);
                    }
                }
                MessageType::Nack => {
                    warn!("Panel NACKed {:?}", command.msg_type);
                    return Ok(AwaitOutcome::Retry);
                }
                MessageType::Rejected | MessageType::Failed => {
                    return Ok(AwaitOutcome::Rejected(frame.msg_type));
                }
                msg_type if Some(msg_type) == command.expect && !frame.ack_requested => {
                    self.apply_message(&frame).await?;
                    return Ok(AwaitOutcome::Completed(frame.body));
                }
                msg_type if MessageSpec::of(msg_type).is_broadcast() => {
                    debug!(
                        "Transition {:?} while awaiting response to {:?}",
                        msg_type, command.msg_type
                    );
                    self.dispatch_transition(frame).await?;
                }
                msg_type => {
                    error!("Unexpected {:?} in response to {:?}", msg_type, command.msg_type);
                    return Ok(AwaitOutcome::Rejected(msg_type));
                }
            }
        }
    }

    /// Handle an unsolicited broadcast. State changes are applied and
    /// published only after synchronization; an ACK is owed either way if
    /// the panel asked for one.
    async fn dispatch_transition(&mut self, frame: Frame) -> Result<()> {
        if self.model.synced() {
            self.apply_message(&frame).await?;
        } else {
            debug!("Not processing transition message during synchronization");
        }
        if frame.ack_requested {
            self.send_ack().await?;
        }
        Ok(())
    }

    async fn apply_message(&mut self, frame: &Frame) -> Result<()> {
        match MessageSpec::of(frame.msg_type).handler {
            Handler::InterfaceConfig => self.on_interface_config(&frame.body),
            Handler::ZoneName => self.on_zone_name(&frame.body),
            Handler::ZoneStatus => self.on_zone_status(&frame.body).await,
            Handler::ZoneSnapshot => self.on_zone_snapshot(&frame.body),
            Handler::PartitionStatus => self.on_partition_status(&frame.body).await,
            Handler::SystemStatus => self.on_system_status(&frame.body),
            Handler::Ack | Handler::Nack | Handler::Rejection | Handler::None => Ok(()),
        }
    }

    fn on_interface_config(&mut self, body: &[u8]) -> Result<()> {
        let caps = InterfaceCapabilities::parse(body);
        debug!(
            "Panel firmware '{}', transitions {:?}, requests {:?}",
            caps.firmware, caps.transitions, caps.requests
        );

        let missing = caps.missing_required();
        if missing.is_empty() {
            info!("Panel with firmware '{}' meets interface requirements", caps.firmware);
        } else {
            for name in &missing {
                error!("Required panel capability is not enabled: {name}");
            }
            if !self.model.synced() {
                error!("Enable the required messages in the panel configuration and restart");
                return Err(BridgeError::PanelMisconfigured);
            }
        }
        self.model.set_firmware(caps.firmware);
        Ok(())
    }

    fn on_system_status(&mut self, body: &[u8]) -> Result<()> {
        let panel_id = body[0];
        let mask = body[9];

        if self.model.panel_id().is_none() {
            debug!("Panel id {panel_id}");
            self.model.set_panel_id(panel_id);
        }

        match self.model.partition_mask() {
            None => {
                self.model.set_partition_mask(mask);
                if !self.model.synced() {
                    for bit in 0..8u8 {
                        if mask & (1 << bit) == 0 {
                            continue;
                        }
                        let index = bit + 1;
                        info!("Partition {index} active, queueing status request");
                        self.model.register_partition(index);
                        self.queue.push_back(QueuedCommand::request(
                            MessageType::PartitionStatusReq,
                            vec![wire_index(index)],
                            Some(MessageType::PartitionStatusRsp),
                        ));
                    }
                }
            }
            Some(previous) if previous != mask => {
                error!(
                    "Active partition mask changed since synchronization \
                     (was {previous:#04x}, now {mask:#04x}); restart to resynchronize"
                );
            }
            Some(_) => {}
        }
        Ok(())
    }

    async fn on_partition_status(&mut self, body: &[u8]) -> Result<()> {
        let index = model_index(body[0]);
        // Six condition bytes surround the last-user byte.
        let condition = [body[1], body[2], body[3], body[4], body[6], body[7]];

        let synced = self.model.synced();
        match self.model.partition_mut(index) {
            Some(partition) => {
                partition.set_condition(condition);
                debug!("Partition {index} state is {}", partition.state().as_str());
            }
            None => {
                if synced {
                    error!("Partition status for unknown partition {index}, dropping");
                } else {
                    debug!("Partition {index} is not registered, ignoring status");
                }
                return Ok(());
            }
        }

        if synced && let Some(partition) = self.model.partition(index) {
            self.bridge.publish_partition_state(partition).await;
        }
        Ok(())
    }

    fn on_zone_name(&mut self, body: &[u8]) -> Result<()> {
        let index = model_index(body[0]);
        if index > self.opts.max_zones || self.opts.ignored_zones.contains(&index) {
            debug!("Zone {index} is out of range or ignored, dropping name response");
            return Ok(());
        }

        let raw = String::from_utf8_lossy(&body[1..]);
        let name = raw.trim_end_matches(|c: char| c == '\0' || c.is_whitespace());

        if self.model.zone(index).is_some() {
            if let Some(zone) = self.model.zone_mut(index)
                && zone.name != name
            {
                info!("Zone {index} renamed from '{}' to '{name}'", zone.name);
                zone.rename(name);
            }
        } else if self.model.synced() {
            error!("Zone name for unknown zone {index} after synchronization, dropping");
        } else if name.is_empty() {
            debug!("Zone {index} has an empty name, treating as inactive");
        } else {
            debug!("Registering zone {index} '{name}'");
            self.model.register_zone(index, name);
        }
        Ok(())
    }

    async fn on_zone_status(&mut self, body: &[u8]) -> Result<()> {
        let index = model_index(body[0]);
        let synced = self.model.synced();

        match self.model.zone_mut(index) {
            Some(zone) => {
                zone.set_masks(body[1], [body[2], body[3], body[4]], [body[5], body[6]]);
                debug!(
                    "Zone {index} faulted={} bypassed={} trouble={}",
                    zone.faulted(),
                    zone.bypassed(),
                    zone.trouble()
                );
            }
            None => {
                if synced {
                    error!("Zone status for unknown zone {index}, dropping");
                } else {
                    debug!("Zone {index} is not registered, ignoring status");
                }
                return Ok(());
            }
        }

        if synced && let Some(zone) = self.model.zone(index) {
            self.bridge.publish_zone_states(zone).await;
        }
        Ok(())
    }

    /// Zone snapshots cover a block of 16 zones, two per data byte. The
    /// flag layout is unconfirmed, so zones are only marked as recently
    /// updated; individual Zone Status messages carry the real state.
    fn on_zone_snapshot(&mut self, body: &[u8]) -> Result<()> {
        let base = u16::from(body[0]) * 16;
        for offset in 0..16u16 {
            let index = base + offset + 1;
            if let Ok(index) = u8::try_from(index)
                && let Some(zone) = self.model.zone_mut(index)
            {
                zone.touch();
            }
        }
        debug!("Zone snapshot noted for zones {}..={} (flag bits not decoded)", base + 1, base + 16);
        Ok(())
    }

    async fn handle_request(&mut self, request: BridgeRequest) -> Result<()> {
        match request {
            BridgeRequest::RepublishAll => {
                info!("Republishing discovery configs and states");
                self.bridge.republish_all(&self.model, self.opts.discovery_spacing).await;
            }
            BridgeRequest::Arm { partition, mode } => {
                let Some(entity) = self.model.partition(partition) else {
                    error!("Arm request for unknown partition {partition}");
                    return Ok(());
                };
                use crate::devices::partition::PartitionState as S;
                if matches!(entity.state(), S::ArmedHome | S::ArmedAway | S::Arming) {
                    error!(
                        "Partition {partition} is already armed or arming, ignoring {mode:?} request"
                    );
                    return Ok(());
                }
                let function = match mode {
                    ArmMode::Home => KeypadFunction::ArmStay,
                    ArmMode::Away => KeypadFunction::ArmAway,
                };
                let done = self.enqueue_keypad_function(partition, function)?;
                spawn_command_reporter(done, partition, function);
            }
            BridgeRequest::Disarm { partition } => {
                let Some(entity) = self.model.partition(partition) else {
                    error!("Disarm request for unknown partition {partition}");
                    return Ok(());
                };
                if entity.state() == crate::devices::partition::PartitionState::Disarmed {
                    error!("Partition {partition} is already disarmed, ignoring disarm request");
                    return Ok(());
                }
                let done = self.enqueue_keypad_function(partition, KeypadFunction::Disarm)?;
                spawn_command_reporter(done, partition, KeypadFunction::Disarm);
            }
        }
        Ok(())
    }

    /// Queue a keypad function and hand back the receiver its completion
    /// will be delivered on.
    fn enqueue_keypad_function(
        &mut self,
        partition: u8,
        function: KeypadFunction,
    ) -> Result<oneshot::Receiver<Result<Vec<u8>>>> {
        let partition_mask = 1u8 << (partition - 1);
        let (msg_type, body) = match &self.opts.auth {
            ArmAuth::Pin(pin) => {
                let pin = pack_pin(pin)?;
                (
                    MessageType::PrimaryKeypadFuncPin,
                    vec![pin[0], pin[1], pin[2], partition_mask, function as u8],
                )
            }
            ArmAuth::User(user) => {
                (MessageType::PrimaryKeypadFuncNoPin, vec![*user, partition_mask, function as u8])
            }
        };
        debug!("Queueing keypad function {function:?} for partition {partition}");
        let expect = MessageSpec::of(msg_type).expects_ack.then_some(MessageType::Ack);
        let (done_tx, done_rx) = oneshot::channel();
        self.queue.push_back(QueuedCommand {
            msg_type,
            body,
            request_ack: false,
            expect,
            done: Some(done_tx),
        });
        Ok(done_rx)
    }

    fn enqueue_set_clock(&mut self) {
        let now = Local::now();
        let body = vec![
            (now.year() - 2000).clamp(0, 99) as u8,
            now.month() as u8,
            now.day() as u8,
            now.hour() as u8,
            now.minute() as u8,
            // The panel counts weekdays from Sunday = 1.
            now.weekday().num_days_from_sunday() as u8 + 1,
        ];
        debug!("Queueing set clock/calendar request");
        let expect = MessageSpec::of(MessageType::SetClockCalendar)
            .expects_ack
            .then_some(MessageType::Ack);
        self.queue.push_back(QueuedCommand::request(MessageType::SetClockCalendar, body, expect));
    }

    async fn send_ack(&mut self) -> Result<()> {
        if !self.opts.ack_delay.is_zero() {
            sleep(self.opts.ack_delay).await;
        }
        self.link.write_frame(MessageType::Ack, &[], false).await?;
        Ok(())
    }
}

/// Watch a queued keypad command for its outcome and log the result.
/// Runs detached so command intake never waits on the panel round trip;
/// a failed command publishes no state and Home Assistant keeps showing
/// the retained prior state.
fn spawn_command_reporter(
    done: oneshot::Receiver<Result<Vec<u8>>>,
    partition: u8,
    function: KeypadFunction,
) {
    tokio::spawn(async move {
        match done.await {
            Ok(Ok(_)) => {
                info!("Keypad function {function:?} for partition {partition} acknowledged");
            }
            Ok(Err(e)) => {
                error!("Keypad function {function:?} for partition {partition} failed: {e}");
            }
            Err(_) => {
                debug!(
                    "Keypad function {function:?} for partition {partition} \
                     dropped before completion"
                );
            }
        }
    });
}
