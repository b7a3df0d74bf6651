use crate::error::Result;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Inbound notifications from the mesh layer.
///
/// Delivered over a channel and consumed one at a time by the owning loop,
/// preserving arrival order without callback plumbing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A broadcast payload, with the mesh-level sender id
    Message { from: u32, payload: String },
    /// A node connected somewhere in the mesh
    PeerJoined { node_id: u32 },
    /// The set of reachable nodes changed
    TopologyChanged { node_count: usize },
}

/// Outbound side of the mesh layer.
///
/// Everything is broadcast; addressing happens inside payloads. The station
/// address is the uplink to the outside network, present only on a node
/// bridging out of the mesh.
pub trait MeshTransport: Send + 'static {
    fn broadcast(&self, payload: &str) -> Result<()>;
    fn node_id(&self) -> u32;
    fn station_addr(&self) -> Option<IpAddr>;
    /// Number of other nodes currently reachable.
    fn peer_count(&self) -> usize;
}

/// An in-process mesh connecting members over channels.
///
/// Broadcasts fan out to every member except the sender, mirroring radio
/// semantics (no self-delivery, no ordering across senders). Members whose
/// receiver is gone are pruned on the next broadcast.
#[derive(Debug, Clone, Default)]
pub struct InProcessMesh {
    inner: Arc<Mutex<HubInner>>,
}

#[derive(Debug, Default)]
struct HubInner {
    members: HashMap<u32, mpsc::UnboundedSender<MeshEvent>>,
}

impl InProcessMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member and returns its transport handle plus event stream.
    /// Existing members are told about the arrival.
    pub fn join(&self, node_id: u32) -> (MeshHandle, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        for sender in inner.members.values() {
            let _ = sender.send(MeshEvent::PeerJoined { node_id });
        }
        inner.members.insert(node_id, tx);
        let node_count = inner.members.len();
        for (id, sender) in inner.members.iter() {
            if *id == node_id {
                continue;
            }
            let _ = sender.send(MeshEvent::TopologyChanged { node_count });
        }
        let handle = MeshHandle {
            node_id,
            hub: Arc::clone(&self.inner),
            station: Arc::new(Mutex::new(None)),
        };
        (handle, rx)
    }
}

/// A member's view of an [`InProcessMesh`].
#[derive(Debug, Clone)]
pub struct MeshHandle {
    node_id: u32,
    hub: Arc<Mutex<HubInner>>,
    station: Arc<Mutex<Option<IpAddr>>>,
}

impl MeshHandle {
    /// Sets the simulated uplink address reported by `station_addr`.
    pub fn set_station_addr(&self, addr: Option<IpAddr>) {
        *self.station.lock().unwrap() = addr;
    }
}

impl MeshTransport for MeshHandle {
    fn broadcast(&self, payload: &str) -> Result<()> {
        let mut inner = self.hub.lock().unwrap();
        let mut departed: Vec<u32> = Vec::new();
        for (id, sender) in inner.members.iter() {
            if *id == self.node_id {
                continue;
            }
            let event = MeshEvent::Message { from: self.node_id, payload: payload.to_string() };
            if sender.send(event).is_err() {
                departed.push(*id);
            }
        }
        if !departed.is_empty() {
            for id in &departed {
                inner.members.remove(id);
            }
            debug!(?departed, "mesh members departed");
            let node_count = inner.members.len();
            for sender in inner.members.values() {
                let _ = sender.send(MeshEvent::TopologyChanged { node_count });
            }
        }
        Ok(())
    }

    fn node_id(&self) -> u32 {
        self.node_id
    }

    fn station_addr(&self) -> Option<IpAddr> {
        *self.station.lock().unwrap()
    }

    fn peer_count(&self) -> usize {
        let inner = self.hub.lock().unwrap();
        let own = usize::from(inner.members.contains_key(&self.node_id));
        inner.members.len() - own
    }
}
