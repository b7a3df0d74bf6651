//! Shared doubles for unit tests.

use crate::broker::BrokerLink;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::gateway::GatewayCore;
use crate::transport::{InProcessMesh, MeshHandle};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    pub connected: bool,
    pub reachable: bool,
    pub connect_attempts: usize,
    pub published: Vec<(String, Bytes)>,
}

/// Broker double that records publishes and can be made unreachable.
#[derive(Debug, Clone)]
pub(crate) struct RecordingBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl RecordingBroker {
    pub fn new() -> (Self, Arc<Mutex<BrokerState>>) {
        let state = Arc::new(Mutex::new(BrokerState { reachable: true, ..Default::default() }));
        (Self { state: Arc::clone(&state) }, state)
    }
}

#[async_trait]
impl BrokerLink for RecordingBroker {
    async fn connect(&mut self, _client_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connect_attempts += 1;
        if state.reachable {
            state.connected = true;
            Ok(())
        } else {
            Err(GatewayError::Broker("unreachable".to_string()))
        }
    }

    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(GatewayError::Broker("not connected".to_string()));
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    fn connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    async fn service(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Joins `mesh` as `node_id` and wraps the handle in a gateway core backed by
/// a recording broker. The handle gets a station uplink so broker checks are
/// not skipped. The core's own mesh event stream is discarded; tests drive
/// `handle_mesh_event` directly.
pub(crate) fn gateway_core(
    mesh: &InProcessMesh,
    node_id: u32,
) -> (GatewayCore<MeshHandle, RecordingBroker>, Arc<Mutex<BrokerState>>) {
    let (transport, _events) = mesh.join(node_id);
    transport.set_station_addr(Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 77))));
    let (broker, state) = RecordingBroker::new();
    let core = GatewayCore::new(GatewayConfig::default(), transport, broker);
    (core, state)
}
