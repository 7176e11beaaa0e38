//! Duplex transport seam between the session and the remote endpoint.
//!
//! A transport carries small text control messages out and encoded audio
//! packets in, and reports its link state through a watch channel.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,

    #[error("transport closed")]
    Closed,

    #[error("send failed: {0}")]
    Send(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the receive side should stop reading.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Resolve once the link reaches `target`. Returns `false` if the state
/// sender went away first.
pub async fn wait_for_state(state: &mut watch::Receiver<LinkState>, target: LinkState) -> bool {
    loop {
        if *state.borrow_and_update() == target {
            return true;
        }
        if state.changed().await.is_err() {
            return false;
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> watch::Receiver<LinkState>;

    fn is_open(&self) -> bool {
        *self.state().borrow() == LinkState::Open
    }

    /// Send one control message.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Next inbound audio packet. `Err(Closed)` once the link is gone.
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Close the link. Repeated calls are no-ops.
    async fn close(&self);
}

/// In-process transport backed by channels.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<Result<Bytes, TransportError>>>,
    state_tx: watch::Sender<LinkState>,
}

/// The far side of a [`ChannelTransport`]: plays the remote endpoint.
pub struct RemoteEnd {
    pub sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    state_tx: watch::Sender<LinkState>,
}

pub fn channel_transport() -> (ChannelTransport, RemoteEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (state_tx, _) = watch::channel(LinkState::Connecting);

    (
        ChannelTransport {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
            state_tx: state_tx.clone(),
        },
        RemoteEnd {
            sent: out_rx,
            inbound: in_tx,
            state_tx,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    fn state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        let state = *self.state_tx.borrow();
        match state {
            LinkState::Open => {}
            LinkState::Connecting => return Err(TransportError::NotOpen),
            LinkState::Closed => return Err(TransportError::Closed),
        }
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Send("remote end dropped".into()))
    }

    async fn recv(&self) -> Result<Bytes, TransportError> {
        let mut state = self.state_tx.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            packet = inbound.recv() => packet.unwrap_or(Err(TransportError::Closed)),
            _ = wait_for_state(&mut state, LinkState::Closed) => Err(TransportError::Closed),
        }
    }

    async fn close(&self) {
        self.state_tx.send_replace(LinkState::Closed);
    }
}

impl RemoteEnd {
    pub fn open(&self) {
        self.state_tx.send_replace(LinkState::Open);
    }

    pub fn close(&self) {
        self.state_tx.send_replace(LinkState::Closed);
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Deliver an audio packet to the local side.
    pub fn push_packet(&self, packet: impl Into<Bytes>) -> bool {
        self.inbound.send(Ok(packet.into())).is_ok()
    }

    /// Deliver a non-terminal error to the local side.
    pub fn push_error(&self, error: TransportError) -> bool {
        self.inbound.send(Err(error)).is_ok()
    }
}
