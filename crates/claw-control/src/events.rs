//! Connection-level notifications and the handler seam.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::protocol::EventFrame;

/// One or more events were missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// Sequence number that should have arrived next.
    pub expected: u64,
    /// Sequence number that actually arrived.
    pub received: u64,
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code (1006 when the transport failed without one).
    pub code: u16,
    /// Close reason.
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Closed without a close frame.
    pub const ABNORMAL: u16 = 1006;

    /// Build a close record.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Transport failure without a close frame.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(Self::ABNORMAL, reason)
    }
}

/// Tracks event sequence numbers for one connection.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    last: Option<u64>,
}

impl SequenceTracker {
    /// Highest sequence number seen.
    #[must_use]
    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Record `seq`, reporting a forward gap. The high-water mark only
    /// moves forward, so a hole is reported once.
    pub fn observe(&mut self, seq: u64) -> Option<SequenceGap> {
        let gap = match self.last {
            Some(last) if seq > last.saturating_add(1) => Some(SequenceGap {
                expected: last + 1,
                received: seq,
            }),
            _ => None,
        };
        self.last = Some(self.last.map_or(seq, |last| last.max(seq)));
        gap
    }

    /// Forget the high-water mark.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Receives connection-level notifications from the client's driver.
///
/// Methods run synchronously on the driver task and should return quickly.
/// A panic in any callback is caught and logged.
pub trait GatewayHandler: Send + Sync + 'static {
    /// Handshake completed; `hello` is the server payload, untouched.
    fn on_hello(&self, _hello: &Value) {}

    /// A server event other than the handshake challenge.
    fn on_event(&self, _event: &EventFrame) {}

    /// Events were skipped.
    fn on_gap(&self, _gap: SequenceGap) {}

    /// The transport closed.
    fn on_close(&self, _close: &CloseInfo) {}
}

impl GatewayHandler for () {}

/// A notification forwarded by [`ChannelHandler`].
#[derive(Debug, Clone)]
pub enum GatewayNotification {
    /// Handshake completed.
    Hello(Value),
    /// Server event.
    Event(EventFrame),
    /// Missed events.
    Gap(SequenceGap),
    /// Transport closed.
    Closed(CloseInfo),
}

/// Handler that forwards notifications into a bounded channel, for callers
/// that consume them from their own task.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::Sender<GatewayNotification>,
}

impl ChannelHandler {
    /// Create a handler and the receiving end of its channel.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<GatewayNotification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn forward(&self, notification: GatewayNotification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(?dropped, "notification channel full, dropping");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("notification receiver gone");
            }
        }
    }
}

impl GatewayHandler for ChannelHandler {
    fn on_hello(&self, hello: &Value) {
        self.forward(GatewayNotification::Hello(hello.clone()));
    }

    fn on_event(&self, event: &EventFrame) {
        self.forward(GatewayNotification::Event(event.clone()));
    }

    fn on_gap(&self, gap: SequenceGap) {
        self.forward(GatewayNotification::Gap(gap));
    }

    fn on_close(&self, close: &CloseInfo) {
        self.forward(GatewayNotification::Closed(close.clone()));
    }
}
