use tokio::time::Instant;
use tracing::debug;

/// Last-known metadata for a discovered mesh node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: u32,
    pub node_type: String,
    pub sensors: String,
    pub last_seen: Instant,
}

/// Registry of nodes discovered through INFO messages.
///
/// One record per node id; re-announcements overwrite the existing record in
/// place. Capacity-bounded: once full, unknown nodes are dropped rather than
/// evicting known ones. Records are never removed; staleness shows only in
/// `last_seen`.
#[derive(Debug)]
pub struct NodeRegistry {
    records: Vec<NodeRecord>,
    capacity: usize,
}

impl NodeRegistry {
    pub fn new(capacity: usize) -> Self {
        Self { records: Vec::with_capacity(capacity), capacity }
    }

    /// Records or refreshes a node. Returns false when a new node was
    /// dropped because the registry is full; updates always succeed.
    pub fn upsert(&mut self, node_id: u32, node_type: &str, sensors: &str) -> bool {
        let now = Instant::now();
        if let Some(record) = self.records.iter_mut().find(|r| r.node_id == node_id) {
            record.node_type = node_type.to_string();
            record.sensors = sensors.to_string();
            record.last_seen = now;
            return true;
        }
        if self.records.len() >= self.capacity {
            debug!(node_id, capacity = self.capacity, "registry full, dropping node info");
            return false;
        }
        self.records.push(NodeRecord {
            node_id,
            node_type: node_type.to_string(),
            sensors: sensors.to_string(),
            last_seen: now,
        });
        true
    }

    /// Human-readable description of a node, `"type (sensors)"`.
    pub fn lookup(&self, node_id: u32) -> Option<String> {
        self.records
            .iter()
            .find(|r| r.node_id == node_id)
            .map(|r| format!("{} ({})", r.node_type, r.sensors))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
