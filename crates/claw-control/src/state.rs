//! Connection state types.

use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle of a client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never started.
    Idle,
    /// Opening a transport.
    Connecting,
    /// Transport open, waiting for a challenge or the handshake debounce.
    AwaitingChallenge,
    /// `connect` sent, waiting for the hello.
    Authenticating,
    /// Handshake complete.
    Open,
    /// Transport closed.
    Closed,
    /// Waiting out the backoff before the next attempt.
    Reconnecting,
    /// Stopped by the caller; no further attempts until restarted.
    Stopped,
}

/// Atomic wrapper for connection state.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU32);

impl AtomicConnectionState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ConnectionState) -> Self {
        Self(AtomicU32::new(state as u32))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::AwaitingChallenge,
            3 => ConnectionState::Authenticating,
            4 => ConnectionState::Open,
            5 => ConnectionState::Closed,
            6 => ConnectionState::Reconnecting,
            _ => ConnectionState::Stopped,
        }
    }

    /// Store a new state.
    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u32, Ordering::SeqCst);
    }
}
