use crate::error::Result;
use crate::ping::{PingEngine, PingOrigin, PingOutcome};
use crate::protocol::{self, ControlMessage, Inbound};
use crate::transport::{MeshEvent, MeshTransport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const PING_TIMEOUT_MS: u64 = 5_000;
const TIMEOUT_POLL_MS: u64 = 100;

/// A plain mesh member: answers pings addressed to it, executes delegated
/// pings on behalf of the operator, and reports its identity on request.
///
/// Sensor firmware embeds one of these and broadcasts its readings
/// separately; the agent leaves non-control payloads alone.
pub struct NodeAgent<T: MeshTransport> {
    transport: T,
    node_type: String,
    sensors: String,
    engine: PingEngine,
}

impl<T: MeshTransport> NodeAgent<T> {
    pub fn new(transport: T, node_type: &str, sensors: &str) -> Self {
        let engine = PingEngine::new(transport.node_id(), Duration::from_millis(PING_TIMEOUT_MS));
        Self {
            transport,
            node_type: node_type.to_string(),
            sensors: sensors.to_string(),
            engine,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.engine.own_id()
    }

    pub fn handle_event(&mut self, event: MeshEvent) -> Result<()> {
        match event {
            MeshEvent::Message { from, payload } => match protocol::classify(&payload) {
                Inbound::Control(msg) => self.handle_control(msg)?,
                Inbound::Sensor => debug!(from, "ignoring sensor payload"),
            },
            MeshEvent::PeerJoined { node_id } => debug!(node_id, "peer joined"),
            MeshEvent::TopologyChanged { node_count } => debug!(node_count, "topology changed"),
        }
        Ok(())
    }

    fn handle_control(&mut self, msg: ControlMessage) -> Result<()> {
        let own = self.engine.own_id();
        match msg {
            ControlMessage::Ping { from, to, seq } if to == own => {
                self.broadcast(&ControlMessage::Pong { from: own, to: from, seq, rtt: None })
            }
            ControlMessage::PingCmd { from, to, seq } if from == own => {
                match self.engine.adopt(to, seq, Instant::now()) {
                    Some(ping) => self.broadcast(&ping),
                    None => {
                        info!(to, seq, "ping already in flight, ignoring delegation");
                        Ok(())
                    }
                }
            }
            ControlMessage::Pong { from, to, seq, rtt } => {
                let Some(report) = self.engine.handle_pong(from, to, seq, rtt, Instant::now())
                else {
                    return Ok(());
                };
                match (report.origin, report.outcome) {
                    (PingOrigin::Commanded, PingOutcome::Reply { responder, rtt_ms }) => {
                        // Hand the measurement back to whoever delegated the ping.
                        self.broadcast(&ControlMessage::Pong {
                            from: own,
                            to: responder,
                            seq: report.seq,
                            rtt: Some(rtt_ms),
                        })
                    }
                    (_, PingOutcome::Reply { responder, rtt_ms }) => {
                        info!(responder, seq = report.seq, rtt_ms, "ping reply");
                        Ok(())
                    }
                    (_, PingOutcome::Relayed { source, target, rtt_ms }) => {
                        info!(source, target, seq = report.seq, rtt_ms, "relayed ping result");
                        Ok(())
                    }
                }
            }
            ControlMessage::InfoReq => self.broadcast(&ControlMessage::Info {
                node_type: self.node_type.clone(),
                sensors: self.sensors.clone(),
            }),
            // PING and PING_CMD addressed to other nodes, and INFO replies,
            // are other traffic on the shared medium.
            _ => Ok(()),
        }
    }

    /// Expires the outstanding ping once its timeout passes.
    pub fn poll_timeout(&mut self, now: Instant) {
        if let Some(expired) = self.engine.poll_timeout(now) {
            warn!(node = expired.target, seq = expired.seq, "ping timed out");
        }
    }

    /// Drives the agent until the mesh event stream closes.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<MeshEvent>) -> Result<()> {
        let mut tick = time::interval(Duration::from_millis(TIMEOUT_POLL_MS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event)?,
                        None => return Ok(()),
                    }
                }
                _ = tick.tick() => {
                    self.poll_timeout(Instant::now());
                }
            }
        }
    }

    fn broadcast(&self, msg: &ControlMessage) -> Result<()> {
        self.transport.broadcast(&protocol::encode(msg)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InProcessMesh, MeshHandle};

    fn agent_with_observer(
    ) -> (NodeAgent<MeshHandle>, mpsc::UnboundedReceiver<MeshEvent>) {
        let mesh = InProcessMesh::new();
        let (transport, _events) = mesh.join(1001);
        let agent = NodeAgent::new(transport, "Repeater", "None");
        let (_, observer) = mesh.join(9999);
        (agent, observer)
    }

    fn control(from: u32, msg: &ControlMessage) -> MeshEvent {
        MeshEvent::Message { from, payload: protocol::encode(msg).unwrap() }
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

    #[test]
    fn answers_ping_addressed_to_itself() {
        let (mut agent, mut observer) = agent_with_observer();
        agent
            .handle_event(control(99, &ControlMessage::Ping { from: 99, to: 1001, seq: 7 }))
            .unwrap();
        assert_eq!(
            recv_control(&mut observer),
            ControlMessage::Pong { from: 1001, to: 99, seq: 7, rtt: None }
        );
    }

    #[test]
    fn ignores_ping_for_another_node() {
        let (mut agent, mut observer) = agent_with_observer();
        agent
            .handle_event(control(99, &ControlMessage::Ping { from: 99, to: 2002, seq: 7 }))
            .unwrap();
        assert!(observer.try_recv().is_err());
    }

    #[test]
    fn executes_delegated_ping_and_relays_the_result() {
        let (mut agent, mut observer) = agent_with_observer();
        agent
            .handle_event(control(99, &ControlMessage::PingCmd { from: 1001, to: 2002, seq: 5 }))
            .unwrap();
        assert_eq!(
            recv_control(&mut observer),
            ControlMessage::Ping { from: 1001, to: 2002, seq: 5 }
        );

        agent
            .handle_event(control(
                2002,
                &ControlMessage::Pong { from: 2002, to: 1001, seq: 5, rtt: None },
            ))
            .unwrap();
        match recv_control(&mut observer) {
            ControlMessage::Pong { from: 1001, to: 2002, seq: 5, rtt: Some(_) } => {}
            other => panic!("expected relayed PONG, got {other:?}"),
        }
    }

    #[test]
    fn delegation_while_busy_is_dropped() {
        let (mut agent, mut observer) = agent_with_observer();
        agent
            .handle_event(control(99, &ControlMessage::PingCmd { from: 1001, to: 2002, seq: 5 }))
            .unwrap();
        assert!(observer.try_recv().is_ok());

        agent
            .handle_event(control(99, &ControlMessage::PingCmd { from: 1001, to: 3003, seq: 6 }))
            .unwrap();
        assert!(observer.try_recv().is_err());
    }

    #[test]
    fn reports_identity_on_info_request() {
        let (mut agent, mut observer) = agent_with_observer();
        agent.handle_event(control(99, &ControlMessage::InfoReq)).unwrap();
        assert_eq!(
            recv_control(&mut observer),
            ControlMessage::Info {
                node_type: "Repeater".to_string(),
                sensors: "None".to_string()
            }
        );
    }

    #[test]
    fn leaves_sensor_payloads_alone() {
        let (mut agent, mut observer) = agent_with_observer();
        agent
            .handle_event(MeshEvent::Message {
                from: 3003,
                payload: r#"{"temperature":21.5}"#.to_string(),
            })
            .unwrap();
        assert!(observer.try_recv().is_err());
    }
}
