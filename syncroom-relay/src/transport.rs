//! Transport boundary between the relay and a live bidirectional channel.
//!
//! The relay only needs three things from a connection: its ready state,
//! a fire-and-forget byte send, and close. `ChannelTransport` implements
//! these over an unbounded mpsc channel whose receiving end is drained by
//! whatever owns the real socket (the WebSocket writer task in `server`,
//! or a test).

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame carried no status code.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Opaque handle naming one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Transport ready state, checked before every send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }
}

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport is not open ({0:?})")]
    NotOpen(ReadyState),
    #[error("Transport receiver dropped")]
    Closed,
}

/// A bidirectional connection as seen from the relay.
pub trait Transport: Send + Sync {
    fn ready_state(&self) -> ReadyState;

    /// Queue `bytes` for delivery. Never waits on the remote side.
    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close with a status code and reason. Closing twice is a no-op.
    fn close(&self, code: u16, reason: &str);
}

/// Work item for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// mpsc-backed transport.
pub struct ChannelTransport {
    state: AtomicU8,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    /// Create an open transport and the receiver its writer drains.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_state(ReadyState::Open)
    }

    /// Create a transport that refuses sends until `mark_open`.
    pub fn connecting() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        Self::with_state(ReadyState::Connecting)
    }

    fn with_state(state: ReadyState) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: AtomicU8::new(state as u8),
            tx,
        };
        (transport, rx)
    }

    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ReadyState::Connecting as u8,
            ReadyState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Flag the transport closed without queueing a close frame
    /// (the remote side already went away).
    pub fn mark_closed(&self) {
        self.state.store(ReadyState::Closed as u8, Ordering::Release);
    }
}

impl Transport for ChannelTransport {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        match self.ready_state() {
            ReadyState::Open => {}
            other => return Err(TransportError::NotOpen(other)),
        }
        self.tx.send(Outbound::Binary(bytes)).map_err(|_| {
            self.mark_closed();
            TransportError::Closed
        })
    }

    fn close(&self, code: u16, reason: &str) {
        let previous = self.state.swap(ReadyState::Closed as u8, Ordering::AcqRel);
        if previous == ReadyState::Closed as u8 {
            return;
        }
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}
