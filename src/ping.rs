use crate::protocol::ControlMessage;
use tokio::time::{Duration, Instant};

/// How the outstanding ping was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOrigin {
    /// Requested locally (operator command or delegation issued by us)
    Local,
    /// Adopted from a PING_CMD naming this node as the requester
    Commanded,
}

/// The single outstanding ping request.
///
/// At most one exists per engine. `seq` is drawn from a counter that only
/// moves forward, so a PONG matching an abandoned request can never be
/// confused with the current one.
#[derive(Debug, Clone, Copy)]
pub struct PendingPing {
    pub target: u32,
    pub seq: u32,
    pub issued_at: Instant,
    pub origin: PingOrigin,
}

/// Outcome of a completed ping, delivered exactly once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReport {
    pub seq: u32,
    pub origin: PingOrigin,
    pub outcome: PingOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// The responder's PONG came straight back; RTT measured locally.
    Reply { responder: u32, rtt_ms: u64 },
    /// A delegated ping completed; RTT between `source` and `target` as
    /// measured and relayed by `source`.
    Relayed { source: u32, target: u32, rtt_ms: u64 },
}

/// Correlates ping requests with their replies.
///
/// Two states: idle, or awaiting a PONG for exactly one request. A reply
/// completes the request only when both its sequence number and its sender
/// match; everything else is duplication or noise from older exchanges and
/// leaves the state untouched. Expiry is polled, not scheduled.
#[derive(Debug)]
pub struct PingEngine {
    own_id: u32,
    seq: u32,
    timeout: Duration,
    pending: Option<PendingPing>,
}

impl PingEngine {
    pub fn new(own_id: u32, timeout: Duration) -> Self {
        Self { own_id, seq: 0, timeout, pending: None }
    }

    pub fn own_id(&self) -> u32 {
        self.own_id
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    pub fn pending(&self) -> Option<&PendingPing> {
        self.pending.as_ref()
    }

    /// Starts a direct ping to `target`. Returns the assigned sequence
    /// number and the PING frame to broadcast, or None while busy.
    pub fn start(&mut self, target: u32, now: Instant) -> Option<(u32, ControlMessage)> {
        if self.pending.is_some() {
            return None;
        }
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        self.pending =
            Some(PendingPing { target, seq, issued_at: now, origin: PingOrigin::Local });
        Some((seq, ControlMessage::Ping { from: self.own_id, to: target, seq }))
    }

    /// Orders `source` to ping `target` on our behalf. The pending target is
    /// `source`: that is the node whose relayed PONG completes the request.
    pub fn delegate(
        &mut self,
        source: u32,
        target: u32,
        now: Instant,
    ) -> Option<(u32, ControlMessage)> {
        if self.pending.is_some() {
            return None;
        }
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        self.pending =
            Some(PendingPing { target: source, seq, issued_at: now, origin: PingOrigin::Local });
        Some((seq, ControlMessage::PingCmd { from: source, to: target, seq }))
    }

    /// Takes on a ping ordered by someone else, keeping the sequence number
    /// carried by the PING_CMD so the requester can match the relayed reply.
    /// The local counter is not consumed. Returns None while busy.
    pub fn adopt(&mut self, target: u32, seq: u32, now: Instant) -> Option<ControlMessage> {
        if self.pending.is_some() {
            return None;
        }
        self.pending =
            Some(PendingPing { target, seq, issued_at: now, origin: PingOrigin::Commanded });
        Some(ControlMessage::Ping { from: self.own_id, to: target, seq })
    }

    /// Feeds a received PONG to the engine. Completes the outstanding
    /// request when `seq` and the sender match the pending entry.
    pub fn handle_pong(
        &mut self,
        from: u32,
        to: u32,
        seq: u32,
        rtt: Option<u64>,
        now: Instant,
    ) -> Option<PingReport> {
        let pending = self.pending?;
        if pending.seq != seq || pending.target != from {
            return None;
        }
        self.pending = None;
        let outcome = match rtt {
            Some(rtt_ms) => PingOutcome::Relayed { source: from, target: to, rtt_ms },
            None => PingOutcome::Reply {
                responder: from,
                rtt_ms: now.duration_since(pending.issued_at).as_millis() as u64,
            },
        };
        Some(PingReport { seq, origin: pending.origin, outcome })
    }

    /// Expires the outstanding request once its deadline has passed.
    /// Called once per scheduler tick; fires at most once per request.
    pub fn poll_timeout(&mut self, now: Instant) -> Option<PendingPing> {
        let pending = self.pending.as_ref()?;
        if now.duration_since(pending.issued_at) > self.timeout {
            return self.pending.take();
        }
        None
    }
}
