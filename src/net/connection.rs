use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use crate::net::transport::{Frame, WriteBudget};
use crate::EntityId;

/// Handshake progress of one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Pending,
    Ready { session_id: String },
    Failed(String),
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("handshake failed: {0}")]
pub struct HandshakeError(pub String);

/// Completion of a connect attempt, resolved once the handshake succeeds or fails
#[derive(Debug, Clone)]
pub struct Handshake {
    state: watch::Receiver<HandshakeState>,
}

impl Handshake {
    /// Current state without waiting
    pub fn state(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    /// Wait for the outcome, returning the session id
    pub async fn wait(mut self) -> Result<String, HandshakeError> {
        let state = self
            .state
            .wait_for(|state| !matches!(state, HandshakeState::Pending))
            .await
            .map_err(|_| HandshakeError("connection dropped".to_string()))?;
        match &*state {
            HandshakeState::Ready { session_id } => Ok(session_id.clone()),
            HandshakeState::Failed(reason) => Err(HandshakeError(reason.clone())),
            HandshakeState::Pending => Err(HandshakeError("connection dropped".to_string())),
        }
    }
}

/// Player announced by the remote service
#[derive(Debug)]
pub struct TrackedPlayer {
    pub id: EntityId,
    pub announced_at: Instant,
    /// Whether the player is currently on this server
    online: AtomicBool,
}

impl TrackedPlayer {
    fn new(id: EntityId) -> Self {
        Self {
            id,
            announced_at: Instant::now(),
            online: AtomicBool::new(false),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Returns the previous value
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::AcqRel)
    }
}

/// Work queued for the session task
#[derive(Debug)]
pub(crate) enum Outbound {
    /// A frame and the number of budget bytes to release once written
    Frame { frame: Frame, accounted: usize },
    Close { code: u16, reason: String },
}

/// One connect attempt and the session that follows it
///
/// Never reused: every attempt builds a new connection.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    handshake: watch::Sender<HandshakeState>,
    players: RwLock<HashMap<EntityId, Arc<TrackedPlayer>>>,
    budget: WriteBudget,
    outbound: mpsc::UnboundedSender<Outbound>,
    close_requested: watch::Sender<bool>,
    closed: watch::Sender<bool>,
    refused: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: u64) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id,
            handshake: watch::channel(HandshakeState::Pending).0,
            players: RwLock::new(HashMap::new()),
            budget: WriteBudget::default(),
            outbound,
            close_requested: watch::channel(false).0,
            closed: watch::channel(false).0,
            refused: AtomicBool::new(false),
        });
        (connection, outbound_rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handshake(&self) -> Handshake {
        Handshake {
            state: self.handshake.subscribe(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.handshake.borrow(), HandshakeState::Ready { .. }) && !self.is_closed()
    }

    pub fn session_id(&self) -> Option<String> {
        match &*self.handshake.borrow() {
            HandshakeState::Ready { session_id } => Some(session_id.clone()),
            _ => None,
        }
    }

    pub(crate) fn complete_handshake(&self, session_id: String) {
        self.handshake.send_replace(HandshakeState::Ready { session_id });
    }

    pub(crate) fn fail_handshake(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.handshake.send_if_modified(|state| {
            if matches!(state, HandshakeState::Pending) {
                *state = HandshakeState::Failed(reason);
                true
            } else {
                false
            }
        });
    }

    pub fn budget(&self) -> &WriteBudget {
        &self.budget
    }

    /// Queue a text frame, accounted against the write budget
    pub(crate) fn send_text(&self, text: String) -> bool {
        let accounted = text.len();
        self.budget.reserve(accounted);
        let queued = self
            .outbound
            .send(Outbound::Frame {
                frame: Frame::Text(text),
                accounted,
            })
            .is_ok();
        if !queued {
            self.budget.release(accounted);
        }
        queued
    }

    /// Queue a control frame outside the write budget
    pub(crate) fn send_control(&self, frame: Frame) -> bool {
        self.outbound
            .send(Outbound::Frame { frame, accounted: 0 })
            .is_ok()
    }

    /// Ask the session task to send a close frame and stop
    pub(crate) fn request_close(&self, code: u16, reason: &str) {
        self.close_requested.send_replace(true);
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub(crate) fn close_requested(&self) -> watch::Receiver<bool> {
        self.close_requested.subscribe()
    }

    pub(crate) fn mark_closed(&self) {
        self.fail_handshake("connection closed");
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session task has finished
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub(crate) fn mark_refused(&self) {
        self.refused.store(true, Ordering::Release);
    }

    pub fn is_refused(&self) -> bool {
        self.refused.load(Ordering::Acquire)
    }

    /// Track a player announced by the remote service, returns it and whether it is new
    pub(crate) fn track(&self, id: EntityId) -> (Arc<TrackedPlayer>, bool) {
        let mut players = self.players.write();
        if let Some(player) = players.get(&id) {
            return (Arc::clone(player), false);
        }
        let player = Arc::new(TrackedPlayer::new(id));
        players.insert(id, Arc::clone(&player));
        (player, true)
    }

    pub(crate) fn untrack(&self, id: EntityId) -> Option<Arc<TrackedPlayer>> {
        self.players.write().remove(&id)
    }

    pub fn player(&self, id: EntityId) -> Option<Arc<TrackedPlayer>> {
        self.players.read().get(&id).cloned()
    }

    pub fn player_ids(&self) -> Vec<EntityId> {
        self.players.read().keys().copied().collect()
    }

    pub fn player_count(&self) -> usize {
        self.players.read().len()
    }

    pub(crate) fn clear_players(&self) -> Vec<Arc<TrackedPlayer>> {
        self.players.write().drain().map(|(_, player)| player).collect()
    }
}
