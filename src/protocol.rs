use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};

/// Control messages exchanged over the mesh.
///
/// Every control message is a flat JSON object carrying a `type`
/// discriminator. Anything that does not parse as one of these shapes is
/// treated as an opaque sensor payload and forwarded toward the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Latency probe addressed to `to`; answered by a PONG with the same seq
    #[serde(rename = "PING")]
    Ping { from: u32, to: u32, seq: u32 },
    /// Probe reply; `rtt` is present only on relayed reports of a delegated ping
    #[serde(rename = "PONG")]
    Pong {
        from: u32,
        to: u32,
        seq: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rtt: Option<u64>,
    },
    /// Order for node `from` to ping node `to` on the sender's behalf
    #[serde(rename = "PING_CMD")]
    PingCmd { from: u32, to: u32, seq: u32 },
    /// Broadcast request for every node to describe itself
    #[serde(rename = "INFO_REQ")]
    InfoReq,
    /// Node self-description; the mesh sender id identifies the node
    #[serde(rename = "INFO")]
    Info { node_type: String, sensors: String },
}

/// Classification of an inbound mesh payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMessage),
    Sensor,
}

/// Classifies a raw mesh payload.
///
/// Parse failures and payloads without a recognized `type` field are
/// deliberately routed to the sensor path rather than rejected: the mesh
/// carries arbitrary sensor JSON and the broker is the place to sort it out.
pub fn classify(payload: &str) -> Inbound {
    match serde_json::from_str::<ControlMessage>(payload) {
        Ok(msg) => Inbound::Control(msg),
        Err(_) => Inbound::Sensor,
    }
}

pub fn encode(msg: &ControlMessage) -> Result<String> {
    serde_json::to_string(msg).map_err(|e| GatewayError::Protocol(e.to_string()))
}
