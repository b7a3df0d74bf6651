use crate::broker::{self, BrokerLink};
use crate::buffer::StoreForwardBuffer;
use crate::config::GatewayConfig;
use crate::console::{CommandTable, ConsoleChannels};
use crate::error::Result;
use crate::ping::{PingEngine, PingOrigin, PingOutcome, PingReport};
use crate::protocol::{self, ControlMessage, Inbound};
use crate::registry::NodeRegistry;
use crate::transport::{MeshEvent, MeshTransport};
use bytes::Bytes;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const GATEWAY_NODE_TYPE: &str = "Gateway";
const GATEWAY_SENSORS: &str = "None";
const SERVICE_TICK_MS: u64 = 100;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Why the gateway loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Restart requested from the console.
    Reboot,
    /// The mesh event stream closed; nothing left to serve.
    Quit,
}

/// Gateway state and the rules that mutate it.
///
/// Everything observable happens here: mesh traffic classification, sensor
/// forwarding and buffering, ping correlation, node bookkeeping and broker
/// recovery. The surrounding [`Gateway`] only decides when these run, which
/// keeps every rule testable without timers or sockets.
pub struct GatewayCore<T: MeshTransport, B: BrokerLink> {
    config: GatewayConfig,
    transport: T,
    broker: B,
    registry: NodeRegistry,
    engine: PingEngine,
    buffer: StoreForwardBuffer,
    shutdown: Option<Shutdown>,
}

impl<T: MeshTransport, B: BrokerLink> GatewayCore<T, B> {
    pub fn new(config: GatewayConfig, transport: T, broker: B) -> Self {
        let engine =
            PingEngine::new(transport.node_id(), Duration::from_millis(config.ping_timeout_ms));
        let registry = NodeRegistry::new(config.registry_capacity);
        let buffer = StoreForwardBuffer::new(config.buffer_capacity);
        Self { config, transport, broker, registry, engine, buffer, shutdown: None }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn own_id(&self) -> u32 {
        self.transport.node_id()
    }

    pub fn station_addr(&self) -> Option<IpAddr> {
        self.transport.station_addr()
    }

    /// Uplink address as printable text, `none` before the station comes up.
    pub fn station_display(&self) -> String {
        match self.transport.station_addr() {
            Some(ip) => ip.to_string(),
            None => "none".to_string(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peer_count()
    }

    pub fn broker_connected(&self) -> bool {
        self.broker.connected()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn buffer(&self) -> &StoreForwardBuffer {
        &self.buffer
    }

    pub fn ping_idle(&self) -> bool {
        self.engine.is_idle()
    }

    pub fn request_reboot(&mut self) {
        self.shutdown = Some(Shutdown::Reboot);
    }

    pub fn take_shutdown(&mut self) -> Option<Shutdown> {
        self.shutdown.take()
    }

    /// Starts a direct ping. Returns the sequence number, or None while an
    /// earlier request is still outstanding.
    pub fn start_ping(&mut self, target: u32) -> Result<Option<u32>> {
        match self.engine.start(target, Instant::now()) {
            Some((seq, ping)) => {
                self.broadcast(&ping)?;
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }

    /// Commands `source` to ping `target` and report the result back here.
    pub fn start_delegated_ping(&mut self, source: u32, target: u32) -> Result<Option<u32>> {
        match self.engine.delegate(source, target, Instant::now()) {
            Some((seq, cmd)) => {
                self.broadcast(&cmd)?;
                Ok(Some(seq))
            }
            None => Ok(None),
        }
    }

    /// Asks every node to re-announce itself.
    pub fn refresh_nodes(&mut self) -> Result<()> {
        self.broadcast(&ControlMessage::InfoReq)
    }

    /// Classifies and applies one mesh event. A returned string is a notice
    /// for the operator console.
    pub async fn handle_mesh_event(&mut self, event: MeshEvent) -> Result<Option<String>> {
        match event {
            MeshEvent::Message { from, payload } => match protocol::classify(&payload) {
                Inbound::Control(msg) => self.handle_control(from, msg),
                Inbound::Sensor => {
                    self.forward_sensor(from, &payload).await;
                    Ok(None)
                }
            },
            MeshEvent::PeerJoined { node_id } => {
                info!(node_id, "node joined the mesh");
                Ok(None)
            }
            MeshEvent::TopologyChanged { node_count } => {
                debug!(node_count, "mesh topology changed");
                Ok(None)
            }
        }
    }

    fn handle_control(&mut self, sender: u32, msg: ControlMessage) -> Result<Option<String>> {
        let own = self.own_id();
        match msg {
            ControlMessage::Ping { from, to, seq } if to == own => {
                self.broadcast(&ControlMessage::Pong { from: own, to: from, seq, rtt: None })?;
                Ok(None)
            }
            ControlMessage::PingCmd { from, to, seq } if from == own => {
                match self.engine.adopt(to, seq, Instant::now()) {
                    Some(ping) => self.broadcast(&ping)?,
                    None => info!(to, seq, "ping already in flight, ignoring delegation"),
                }
                Ok(None)
            }
            ControlMessage::Pong { from, to, seq, rtt } => {
                let Some(report) = self.engine.handle_pong(from, to, seq, rtt, Instant::now())
                else {
                    return Ok(None);
                };
                if let (PingOrigin::Commanded, PingOutcome::Reply { responder, rtt_ms }) =
                    (report.origin, report.outcome)
                {
                    // We executed this ping for someone else; relay instead
                    // of reporting locally.
                    self.broadcast(&ControlMessage::Pong {
                        from: own,
                        to: responder,
                        seq: report.seq,
                        rtt: Some(rtt_ms),
                    })?;
                    return Ok(None);
                }
                Ok(Some(self.format_report(report)))
            }
            ControlMessage::InfoReq => {
                self.broadcast(&ControlMessage::Info {
                    node_type: GATEWAY_NODE_TYPE.to_string(),
                    sensors: GATEWAY_SENSORS.to_string(),
                })?;
                Ok(None)
            }
            ControlMessage::Info { node_type, sensors } => {
                if self.registry.upsert(sender, &node_type, &sensors) {
                    info!(node = sender, %node_type, %sensors, "node identified");
                }
                Ok(None)
            }
            // PING and PING_CMD between other nodes pass through untouched.
            _ => Ok(None),
        }
    }

    fn format_report(&self, report: PingReport) -> String {
        match report.outcome {
            PingOutcome::Reply { responder, rtt_ms } => {
                let info =
                    self.registry.lookup(responder).unwrap_or_else(|| "unknown".to_string());
                format!(
                    "PING reply from {} [{}]: seq={} time={}ms",
                    responder, info, report.seq, rtt_ms
                )
            }
            PingOutcome::Relayed { source, target, rtt_ms } => {
                format!("PING result: {} -> {} seq={} time={}ms", source, target, report.seq, rtt_ms)
            }
        }
    }

    /// Publishes a sensor reading under `<base_topic>/<node id>`, or parks it
    /// in the buffer while the broker is away.
    async fn forward_sensor(&mut self, from: u32, payload: &str) {
        if self.broker.connected() {
            let topic = format!("{}/{}", self.config.base_topic, from);
            let body = Bytes::copy_from_slice(payload.as_bytes());
            if let Err(e) = self.broker.publish(&topic, body).await {
                warn!(node = from, error = %e, "sensor publish failed");
            }
        } else if self.buffer.try_enqueue(from, Bytes::copy_from_slice(payload.as_bytes())) {
            debug!(node = from, buffered = self.buffer.len(), "broker down, reading buffered");
        } else {
            warn!(node = from, "buffer full, dropping reading");
        }
    }

    /// Reconnects the broker when it is down and the uplink exists. Makes a
    /// bounded number of attempts, then leaves retry to the next check.
    pub async fn check_broker(&mut self) {
        if self.transport.station_addr().is_none() {
            debug!("no station uplink yet, skipping broker check");
            return;
        }
        if self.broker.connected() {
            return;
        }
        for attempt in 1..=self.config.reconnect_attempts {
            let client_id = broker::client_id(&self.config.client_id_prefix);
            info!(attempt, client_id = %client_id, "connecting to broker");
            match self.broker.connect(&client_id).await {
                Ok(()) => {
                    info!("broker connected");
                    self.replay_buffer().await;
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "broker connect failed"),
            }
            if attempt < self.config.reconnect_attempts {
                time::sleep(Duration::from_secs(self.config.reconnect_delay_secs)).await;
            }
        }
        warn!(
            attempts = self.config.reconnect_attempts,
            "broker unreachable, will retry next check"
        );
    }

    /// Drains the store-and-forward buffer into the broker, oldest first.
    /// The buffer empties regardless; failed publishes are counted and lost.
    async fn replay_buffer(&mut self) {
        let queued = self.buffer.take_all();
        if queued.is_empty() {
            return;
        }
        let total = queued.len();
        let mut failed = 0usize;
        for msg in queued {
            let topic = format!("{}/{}", self.config.base_topic, msg.node_id);
            if self.broker.publish(&topic, msg.payload).await.is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(total, failed, "replayed buffered readings with losses");
        } else {
            info!(total, "replayed buffered readings");
        }
    }

    /// Keeps the broker session alive between publishes.
    pub async fn service_broker(&mut self) -> Result<()> {
        if !self.broker.connected() {
            return Ok(());
        }
        self.broker.service().await
    }

    /// Publishes the gateway's own presence under `<base_topic>/gateway`.
    pub async fn announce(&mut self) {
        if !self.broker.connected() {
            return;
        }
        let Some(ip) = self.transport.station_addr() else {
            return;
        };
        let topic = format!("{}/gateway", self.config.base_topic);
        let body = serde_json::json!({
            "nodeId": "gateway",
            "ip": ip.to_string(),
            "nodes": self.peer_count(),
        })
        .to_string();
        if let Err(e) = self.broker.publish(&topic, Bytes::from(body)).await {
            warn!(error = %e, "gateway announce failed");
        }
    }

    /// Expires the outstanding ping once its deadline passes, at most once.
    pub fn poll_ping_timeout(&mut self, now: Instant) -> Option<String> {
        let expired = self.engine.poll_timeout(now)?;
        warn!(node = expired.target, seq = expired.seq, "ping timed out");
        Some(format!("PING timeout: no reply from {} (seq={})", expired.target, expired.seq))
    }

    pub fn log_status(&self) {
        info!(
            ip = %self.station_display(),
            nodes = self.peer_count(),
            broker = self.broker_connected(),
            buffered = self.buffer.len(),
            "gateway status"
        );
    }

    fn broadcast(&self, msg: &ControlMessage) -> Result<()> {
        self.transport.broadcast(&protocol::encode(msg)?)
    }
}

/// The gateway event loop: one task owning all state, fed by the mesh event
/// stream, the operator console and a handful of timers.
///
/// Returns the shutdown reason so the embedder can decide between restarting
/// and exiting.
pub struct Gateway<T: MeshTransport, B: BrokerLink> {
    core: GatewayCore<T, B>,
    commands: CommandTable<T, B>,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    console: ConsoleChannels,
}

impl<T: MeshTransport, B: BrokerLink> Gateway<T, B> {
    pub fn new(
        config: GatewayConfig,
        transport: T,
        broker: B,
        events: mpsc::UnboundedReceiver<MeshEvent>,
        console: ConsoleChannels,
    ) -> Self {
        Self {
            core: GatewayCore::new(config, transport, broker),
            commands: CommandTable::new(),
            events,
            console,
        }
    }

    pub fn core(&self) -> &GatewayCore<T, B> {
        &self.core
    }

    /// For registering custom console commands before [`run`](Self::run).
    pub fn commands_mut(&mut self) -> &mut CommandTable<T, B> {
        &mut self.commands
    }

    pub async fn run(mut self) -> Result<Shutdown> {
        info!(id = self.core.own_id(), "gateway starting");
        self.core.check_broker().await;

        let mut service_tick = time::interval(Duration::from_millis(SERVICE_TICK_MS));
        service_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut broker_tick = delayed_interval(self.core.config().broker_check_secs);
        let mut status_tick = delayed_interval(self.core.config().status_interval_secs);
        let mut announce_tick = delayed_interval(self.core.config().announce_interval_secs);

        let mut console_open = true;
        loop {
            tokio::select! {
                biased;
                maybe_event = self.events.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if let Some(notice) = self.core.handle_mesh_event(event).await? {
                                self.notify(&notice);
                            }
                        }
                        None => {
                            info!("mesh event stream closed, shutting down");
                            return Ok(Shutdown::Quit);
                        }
                    }
                }
                maybe_line = self.console.lines.recv(), if console_open => {
                    match maybe_line {
                        Some(line) => self.handle_console_line(&line),
                        None => {
                            debug!("console channel closed");
                            console_open = false;
                        }
                    }
                }
                _ = broker_tick.tick() => {
                    self.core.check_broker().await;
                }
                _ = service_tick.tick() => {
                    if let Some(notice) = self.core.poll_ping_timeout(Instant::now()) {
                        self.notify(&notice);
                    }
                    if let Err(e) = self.core.service_broker().await {
                        warn!(error = %e, "broker connection lost");
                    }
                }
                _ = status_tick.tick() => {
                    self.core.log_status();
                }
                _ = announce_tick.tick() => {
                    self.core.announce().await;
                }
            }
            if let Some(reason) = self.core.take_shutdown() {
                info!(?reason, "shutdown requested");
                time::sleep(SHUTDOWN_GRACE).await;
                return Ok(reason);
            }
        }
    }

    fn handle_console_line(&mut self, line: &str) {
        match self.commands.dispatch(&mut self.core, line) {
            Ok(Some(reply)) => self.notify(&reply),
            Ok(None) => self.notify(""),
            Err(e) => {
                warn!(error = %e, line, "console command failed");
                self.notify(&format!("error: {}", e));
            }
        }
    }

    /// Best effort: a missing or slow console client never stalls the loop.
    fn notify(&self, text: &str) {
        let _ = self.console.replies.try_send(text.to_string());
    }
}

/// Interval whose first tick fires one full period from now.
fn delayed_interval(period_secs: u64) -> time::Interval {
    let period = Duration::from_secs(period_secs);
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{gateway_core, BrokerState, RecordingBroker};
    use crate::transport::{InProcessMesh, MeshHandle};
    use std::sync::{Arc, Mutex};

    fn setup() -> (
        GatewayCore<MeshHandle, RecordingBroker>,
        mpsc::UnboundedReceiver<MeshEvent>,
        Arc<Mutex<BrokerState>>,
    ) {
        let mesh = InProcessMesh::new();
        let (core, state) = gateway_core(&mesh, 99);
        let (_, observer) = mesh.join(7777);
        (core, observer, state)
    }

    fn message(from: u32, msg: &ControlMessage) -> MeshEvent {
        MeshEvent::Message { from, payload: protocol::encode(msg).unwrap() }
    }

    fn sensor(from: u32, payload: &str) -> MeshEvent {
        MeshEvent::Message { from, payload: payload.to_string() }
    }

    fn recv_control(observer: &mut mpsc::UnboundedReceiver<MeshEvent>) -> ControlMessage {
        match observer.try_recv().unwrap() {
            MeshEvent::Message { payload, .. } => match protocol::classify(&payload) {
                Inbound::Control(msg) => msg,
                Inbound::Sensor => panic!("expected control, got sensor: {payload}"),
            },
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn info_message_registers_the_node() {
        let (mut core, _observer, _state) = setup();
        let notice = core
            .handle_mesh_event(message(
                1001,
                &ControlMessage::Info {
                    node_type: "Repeater".to_string(),
                    sensors: "None".to_string(),
                },
            ))
            .await
            .unwrap();
        assert!(notice.is_none());
        assert_eq!(core.registry().lookup(1001).as_deref(), Some("Repeater (None)"));
    }

    #[tokio::test]
    async fn answers_ping_addressed_to_the_gateway() {
        let (mut core, mut observer, _state) = setup();
        core.handle_mesh_event(message(1001, &ControlMessage::Ping { from: 1001, to: 99, seq: 9 }))
            .await
            .unwrap();
        assert_eq!(
            recv_control(&mut observer),
            ControlMessage::Pong { from: 99, to: 1001, seq: 9, rtt: None }
        );
    }

    #[tokio::test]
    async fn ping_reply_notice_names_known_nodes() {
        let (mut core, mut observer, _state) = setup();
        core.handle_mesh_event(message(
            1001,
            &ControlMessage::Info { node_type: "Repeater".to_string(), sensors: "None".to_string() },
        ))
        .await
        .unwrap();

        assert_eq!(core.start_ping(1001).unwrap(), Some(1));
        assert_eq!(recv_control(&mut observer), ControlMessage::Ping { from: 99, to: 1001, seq: 1 });

        let notice = core
            .handle_mesh_event(message(
                1001,
                &ControlMessage::Pong { from: 1001, to: 99, seq: 1, rtt: None },
            ))
            .await
            .unwrap()
            .expect("reply should produce a notice");
        assert!(notice.contains("PING reply from 1001 [Repeater (None)]"), "got {notice}");
        assert!(notice.contains("seq=1"));
        assert!(core.ping_idle());
    }

    #[tokio::test]
    async fn ping_reply_from_unlisted_node_reads_unknown() {
        let (mut core, _observer, _state) = setup();
        core.start_ping(4004).unwrap();
        let notice = core
            .handle_mesh_event(message(
                4004,
                &ControlMessage::Pong { from: 4004, to: 99, seq: 1, rtt: None },
            ))
            .await
            .unwrap()
            .expect("reply should produce a notice");
        assert!(notice.contains("PING reply from 4004 [unknown]"), "got {notice}");
    }

    #[tokio::test]
    async fn delegated_ping_waits_for_the_relayed_result() {
        let (mut core, mut observer, _state) = setup();
        assert_eq!(core.start_delegated_ping(1001, 2002).unwrap(), Some(1));
        assert_eq!(
            recv_control(&mut observer),
            ControlMessage::PingCmd { from: 1001, to: 2002, seq: 1 }
        );

        // 2002's answer to 1001 crosses the gateway first; not ours to take.
        let early = core
            .handle_mesh_event(message(
                2002,
                &ControlMessage::Pong { from: 2002, to: 1001, seq: 1, rtt: None },
            ))
            .await
            .unwrap();
        assert!(early.is_none());
        assert!(!core.ping_idle());

        let notice = core
            .handle_mesh_event(message(
                1001,
                &ControlMessage::Pong { from: 1001, to: 2002, seq: 1, rtt: Some(38) },
            ))
            .await
            .unwrap()
            .expect("relayed result should produce a notice");
        assert!(notice.contains("1001 -> 2002"), "got {notice}");
        assert!(notice.contains("time=38ms"));
        assert!(core.ping_idle());
    }

    #[tokio::test]
    async fn adopts_delegation_addressed_to_the_gateway() {
        let (mut core, mut observer, _state) = setup();
        core.handle_mesh_event(message(5005, &ControlMessage::PingCmd { from: 99, to: 1001, seq: 4 }))
            .await
            .unwrap();
        assert_eq!(recv_control(&mut observer), ControlMessage::Ping { from: 99, to: 1001, seq: 4 });

        let notice = core
            .handle_mesh_event(message(
                1001,
                &ControlMessage::Pong { from: 1001, to: 99, seq: 4, rtt: None },
            ))
            .await
            .unwrap();
        assert!(notice.is_none());
        match recv_control(&mut observer) {
            ControlMessage::Pong { from: 99, to: 1001, seq: 4, rtt: Some(_) } => {}
            other => panic!("expected relayed PONG, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sensor_readings_buffer_while_broker_is_down() {
        let (mut core, _observer, state) = setup();
        core.handle_mesh_event(sensor(1001, r#"{"temperature":21.5}"#)).await.unwrap();
        core.handle_mesh_event(sensor(2002, r#"{"humidity":40}"#)).await.unwrap();
        assert!(state.lock().unwrap().published.is_empty());
        assert_eq!(core.buffer().len(), 2);

        core.check_broker().await;
        assert!(core.broker_connected());
        assert!(core.buffer().is_empty());
        {
            let state = state.lock().unwrap();
            assert_eq!(state.published.len(), 2);
            assert_eq!(state.published[0].0, "sensors/1001");
            assert_eq!(state.published[0].1.as_ref(), br#"{"temperature":21.5}"#);
            assert_eq!(state.published[1].0, "sensors/2002");
        }

        // Direct forwarding once the broker is back.
        core.handle_mesh_event(sensor(3003, r#"{"temperature":19.0}"#)).await.unwrap();
        let state = state.lock().unwrap();
        assert_eq!(state.published.len(), 3);
        assert_eq!(state.published[2].0, "sensors/3003");
    }

    #[tokio::test]
    async fn full_buffer_drops_the_newest_reading() {
        let (mut core, _observer, state) = setup();
        for i in 0..12u32 {
            core.handle_mesh_event(sensor(1001, &format!(r#"{{"reading":{}}}"#, i))).await.unwrap();
        }
        assert_eq!(core.buffer().len(), 10);

        core.check_broker().await;
        let state = state.lock().unwrap();
        assert_eq!(state.published.len(), 10);
        assert_eq!(state.published[0].1.as_ref(), br#"{"reading":0}"#);
        assert_eq!(state.published[9].1.as_ref(), br#"{"reading":9}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_checks_make_a_bounded_number_of_attempts() {
        let (mut core, _observer, state) = setup();
        state.lock().unwrap().reachable = false;
        core.check_broker().await;
        assert_eq!(state.lock().unwrap().connect_attempts, 3);
        assert!(!core.broker_connected());
    }

    #[tokio::test]
    async fn broker_check_waits_for_the_station_uplink() {
        let mesh = InProcessMesh::new();
        let (transport, _events) = mesh.join(98);
        let (broker, state) = RecordingBroker::new();
        let mut core = GatewayCore::new(GatewayConfig::default(), transport, broker);

        core.check_broker().await;
        assert_eq!(state.lock().unwrap().connect_attempts, 0);
    }

    #[tokio::test]
    async fn announce_reports_presence_and_node_count() {
        let (mut core, _observer, state) = setup();
        core.check_broker().await;
        core.announce().await;

        let state = state.lock().unwrap();
        let (topic, body) = state.published.last().expect("announce should publish");
        assert_eq!(topic, "sensors/gateway");
        let body: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(body["nodeId"], "gateway");
        assert_eq!(body["ip"], "192.168.1.77");
        assert_eq!(body["nodes"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_timeout_fires_exactly_once() {
        let (mut core, _observer, _state) = setup();
        core.start_ping(1001).unwrap();
        assert!(core.poll_ping_timeout(Instant::now()).is_none());

        time::advance(Duration::from_millis(5001)).await;
        let notice = core.poll_ping_timeout(Instant::now()).expect("timeout notice");
        assert!(notice.contains("no reply from 1001"), "got {notice}");
        assert!(core.ping_idle());
        assert!(core.poll_ping_timeout(Instant::now()).is_none());

        // A PONG arriving after expiry has nothing to complete.
        let stale = core
            .handle_mesh_event(message(
                1001,
                &ControlMessage::Pong { from: 1001, to: 99, seq: 1, rtt: None },
            ))
            .await
            .unwrap();
        assert!(stale.is_none());
    }
}
