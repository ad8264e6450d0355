//! Connection engine
//!
//! [`AudioClient`] keeps at most one [`Connection`] to the remote audio service. Every
//! close of the active connection schedules a reconnect with exponential backoff on the
//! runtime, unless the handshake was refused, the attempts are used up or the close was
//! requested locally.
//!
//! Work touching the scheduler or the world is posted to the host tick loop; the
//! session task itself only decodes frames and queues outbound ones.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::list::AudioList;
use crate::audio::tracker::AudioTracker;
use crate::config::{ClientConfig, ConfigError};
use crate::host::{PlayerState, TickHost, World};
use crate::metrics::Metrics;
use crate::net::backoff::ReconnectPolicy;
use crate::net::connection::{Connection, Handshake, Outbound};
use crate::net::handler::{self, Flow};
use crate::net::protocol::{self, EncodeError, Message, PlayerStatus};
use crate::net::transport::{Connector, Established, Frame, HandshakeRequest, CLOSE_GOING_AWAY};
use crate::regions::RegionService;
use crate::scheduler::{PlayerDataWriter, PlayerScheduler, SchedulerError};
use crate::EntityId;

/// How long `disconnect` waits for the transport to close
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reason sent with the close frame on a voluntary disconnect
pub const GOING_OFFLINE: &str = "Going offline";

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected to the audio service")]
    NotConnected,
    #[error("client has been shut down")]
    Terminated,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Result of a write that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Sent,
    /// The connection was not writable; the next cycle sends fresh state
    Dropped,
}

/// Raised whenever a tracked player goes online or offline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStatusEvent {
    pub player: EntityId,
    pub status: PlayerStatus,
}

#[derive(Default)]
struct ClientState {
    connection: Option<Arc<Connection>>,
    reconnect_task: Option<JoinHandle<()>>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    policy: ReconnectPolicy,
    connector: Arc<dyn Connector>,
    pub(crate) host: Arc<dyn TickHost>,
    pub(crate) world: Arc<dyn World>,
    pub(crate) tracker: Arc<AudioTracker>,
    pub(crate) scheduler: Arc<PlayerScheduler>,
    pub(crate) audio_list: Arc<AudioList>,
    pub(crate) metrics: Arc<Metrics>,
    state: Mutex<ClientState>,
    reconnect_attempts: AtomicU32,
    next_connection_id: AtomicU64,
    terminated: AtomicBool,
    events: broadcast::Sender<AudioStatusEvent>,
    runtime: Handle,
}

/// Scheduler writer feeding the tracker and flushing its buffer through the client
struct ClientWriter {
    tracker: Arc<AudioTracker>,
    client: OnceLock<Weak<ClientInner>>,
}

impl PlayerDataWriter for ClientWriter {
    fn write_data(&self, player: &PlayerState) {
        self.tracker.write_data(player);
    }

    fn flush_data(&self) {
        let messages = self.tracker.drain_buffer();
        if messages.is_empty() {
            return;
        }
        if let Some(client) = self.client.get().and_then(Weak::upgrade) {
            if let Err(e) = client.write_and_flush(&messages) {
                debug!("Dropped {} audio messages: {}", messages.len(), e);
            }
        }
    }

    fn player_gone(&self, id: EntityId) {
        match self.client.get().and_then(Weak::upgrade) {
            Some(client) => client.player_departed(id),
            None => {
                self.tracker.forget(id);
            }
        }
    }
}

/// Client of the remote audio service
#[derive(Clone)]
pub struct AudioClient {
    inner: Arc<ClientInner>,
}

impl AudioClient {
    /// Build a client; must be called within a tokio runtime
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        host: Arc<dyn TickHost>,
        world: Arc<dyn World>,
        regions: Arc<dyn RegionService>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ClientError::NoRuntime)?;
        let audio_list = Arc::new(AudioList::new());
        let tracker = Arc::new(AudioTracker::new(
            &config,
            regions,
            Arc::clone(&audio_list),
            Arc::clone(&metrics),
        )?);

        let writer = Arc::new(ClientWriter {
            tracker: Arc::clone(&tracker),
            client: OnceLock::new(),
        });
        let scheduler = PlayerScheduler::new(
            Arc::clone(&host),
            Arc::clone(&world),
            writer.clone(),
            config.tracking.tick_frequency,
            config.tracking.max_buckets,
        )?;

        let inner = Arc::new(ClientInner {
            policy: ReconnectPolicy::from_config(&config.reconnect),
            config,
            connector,
            host,
            world,
            tracker,
            scheduler,
            audio_list,
            metrics,
            state: Mutex::new(ClientState::default()),
            reconnect_attempts: AtomicU32::new(0),
            next_connection_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
            events: broadcast::channel(EVENT_CAPACITY).0,
            runtime,
        });
        let _ = writer.client.set(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Connect to the remote service
    ///
    /// Returns the handshake of the existing connection when already connected or
    /// connecting, without starting another attempt.
    pub fn connect(&self) -> Result<Handshake, ClientError> {
        self.inner.connect(false)
    }

    /// Encode `messages` into one frame and queue it
    ///
    /// Fails with [`ClientError::NotConnected`] when no session is ready. When the
    /// connection is not writable the frame is dropped and [`WriteOutcome::Dropped`]
    /// returned.
    pub fn write_and_flush(&self, messages: &[Message]) -> Result<WriteOutcome, ClientError> {
        self.inner.write_and_flush(messages)
    }

    /// Close the connection gracefully and wait for the transport to finish
    ///
    /// Returns false if there was no connection.
    pub async fn disconnect(&self) -> bool {
        self.inner.disconnect().await
    }

    /// Disconnect and refuse any further connect
    pub async fn shutdown(&self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.disconnect().await;
        info!("Audio client shut down");
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    /// Local player joined the server
    pub fn notify_player_join(&self, id: EntityId) -> bool {
        self.inner.player_joined(id)
    }

    /// Local player left the server
    pub fn notify_player_quit(&self, id: EntityId) -> bool {
        self.inner.player_quit(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioStatusEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.ready_connection().is_some()
    }

    /// Whether the remote service announced the player and it is online here
    pub fn is_player_connected(&self, id: EntityId) -> bool {
        self.inner
            .ready_connection()
            .and_then(|conn| conn.player(id))
            .is_some_and(|player| player.is_online())
    }

    pub fn tracked_players(&self) -> Vec<EntityId> {
        self.inner
            .current_connection()
            .map(|conn| conn.player_ids())
            .unwrap_or_default()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn audio_list(&self) -> &Arc<AudioList> {
        &self.inner.audio_list
    }

    pub fn tracker(&self) -> &Arc<AudioTracker> {
        &self.inner.tracker
    }

    pub fn scheduler(&self) -> &Arc<PlayerScheduler> {
        &self.inner.scheduler
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.current_connection()
    }
}

impl ClientInner {
    fn handshake_request(&self) -> Result<HandshakeRequest, ClientError> {
        let connection = &self.config.connection;
        let missing = |field: &str| ClientError::Config(ConfigError::Invalid(format!("{field} is required")));
        Ok(HandshakeRequest {
            uri: self.config.websocket_uri(),
            user_id: connection.user_id.ok_or_else(|| missing("connection.user-id"))?,
            user_password: connection
                .user_password
                .clone()
                .ok_or_else(|| missing("connection.user-password"))?,
            supplier_id: connection.server_id.ok_or_else(|| missing("connection.server-id"))?,
        })
    }

    fn connect(self: &Arc<Self>, retry: bool) -> Result<Handshake, ClientError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(ClientError::Terminated);
        }
        let request = self.handshake_request()?;

        let (conn, outbound) = {
            let mut state = self.state.lock();
            if let Some(conn) = &state.connection {
                return Ok(conn.handshake());
            }
            if let Some(task) = state.reconnect_task.take() {
                if !retry {
                    task.abort();
                }
            }
            if !retry {
                self.reconnect_attempts.store(0, Ordering::Release);
            }
            let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let (conn, outbound) = Connection::new(id);
            state.connection = Some(Arc::clone(&conn));
            (conn, outbound)
        };

        self.metrics.connection_attempts.fetch_add(1, Ordering::Relaxed);
        info!("Connecting to audio service at {}", request.uri);
        let handshake = conn.handshake();
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.run_session(conn, outbound, request).await;
        });
        Ok(handshake)
    }

    async fn run_session(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        request: HandshakeRequest,
    ) {
        let mut close_requested = conn.close_requested();
        let attempt = tokio::select! {
            result = self.connector.connect(request) => Some(result),
            _ = async { let _ = close_requested.wait_for(|requested| *requested).await; } => None,
        };

        let established = match attempt {
            None => {
                debug!("Connect attempt {} abandoned", conn.id());
                self.on_closed(&conn);
                return;
            }
            Some(Err(e)) => {
                if e.transport_reached() {
                    self.reconnect_attempts.store(0, Ordering::Release);
                }
                if e.is_refusal() {
                    error!("Audio service refused the connection: {}", e);
                    self.metrics.handshakes_refused.fetch_add(1, Ordering::Relaxed);
                    conn.mark_refused();
                } else {
                    warn!("Failed to connect to the audio service: {}", e);
                }
                conn.fail_handshake(e.to_string());
                self.on_closed(&conn);
                return;
            }
            Some(Ok(established)) => established,
        };

        let Established {
            session_id,
            mut sink,
            mut stream,
        } = established;
        self.reconnect_attempts.store(0, Ordering::Release);
        conn.complete_handshake(session_id.clone());
        self.metrics.handshakes_completed.fetch_add(1, Ordering::Relaxed);
        self.metrics.connected.store(1, Ordering::Relaxed);
        info!("Connected to audio service, session {}", session_id);

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(frame)) => {
                        if handler::handle_frame(&self, &conn, frame) == Flow::Close {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Audio service connection error: {}", e);
                        break;
                    }
                    None => {
                        debug!("Audio service stream ended");
                        break;
                    }
                },
                item = outbound.recv() => match item {
                    Some(Outbound::Frame { frame, accounted }) => {
                        let result = sink.send(frame).await;
                        conn.budget().release(accounted);
                        if let Err(e) = result {
                            warn!("Failed to write to the audio service: {}", e);
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        if let Err(e) = sink.send(Frame::Close(Some((code, reason)))).await {
                            debug!("Failed to send close frame: {}", e);
                        }
                        let _ = sink.close().await;
                        break;
                    }
                    None => break,
                },
            }
        }

        self.on_closed(&conn);
    }

    /// Called exactly once per connection when its session task ends
    fn on_closed(self: &Arc<Self>, conn: &Arc<Connection>) {
        conn.mark_closed();
        self.metrics.connected.store(0, Ordering::Relaxed);

        let mut state = self.state.lock();
        let current = state
            .connection
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, conn));
        if !current {
            // Disconnected on purpose
            return;
        }
        state.connection = None;
        self.release_players(conn);

        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        if conn.is_refused() {
            error!("Not reconnecting to the audio service after a refused handshake");
            return;
        }
        let attempts = self.reconnect_attempts.load(Ordering::Acquire);
        if self.policy.exhausted(attempts) {
            error!(
                "Giving up on the audio service after {} reconnect attempts",
                attempts
            );
            return;
        }

        let delay = self.policy.delay_for(attempts);
        self.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
        self.metrics.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Disconnected from the audio service, reconnecting in {:.1} seconds",
            delay.as_secs_f64()
        );

        let inner = Arc::clone(self);
        state.reconnect_task = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = inner.connect(true) {
                debug!("Reconnect skipped: {}", e);
            }
        }));
    }

    /// Forget everything tied to a connection that went away
    fn release_players(self: &Arc<Self>, conn: &Arc<Connection>) {
        let players = conn.clear_players();
        self.metrics.tracked_players.store(0, Ordering::Relaxed);
        let inner = Arc::clone(self);
        self.host.run_once(
            0,
            Box::new(move || {
                inner.scheduler.clear();
                inner.tracker.clear();
                inner.metrics.scheduled_players.store(0, Ordering::Relaxed);
                for player in players {
                    if player.set_online(false) {
                        inner.publish(player.id, PlayerStatus::Offline);
                    }
                }
            }),
        );
    }

    pub(crate) fn current_connection(&self) -> Option<Arc<Connection>> {
        self.state.lock().connection.clone()
    }

    pub(crate) fn ready_connection(&self) -> Option<Arc<Connection>> {
        self.current_connection().filter(|conn| conn.is_ready())
    }

    /// Whether `conn` is still the active connection
    pub(crate) fn is_current(&self, conn: &Arc<Connection>) -> bool {
        self.state
            .lock()
            .connection
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, conn))
    }

    pub(crate) fn write_and_flush(&self, messages: &[Message]) -> Result<WriteOutcome, ClientError> {
        let conn = self.ready_connection().ok_or(ClientError::NotConnected)?;
        if messages.is_empty() {
            return Ok(WriteOutcome::Sent);
        }
        if !conn.budget().is_writable() {
            warn!(
                "Audio service connection is not writable, dropping {} messages",
                messages.len()
            );
            self.metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(WriteOutcome::Dropped);
        }

        let text = protocol::encode(messages)?;
        let bytes = text.len();
        if !conn.send_text(text) {
            return Err(ClientError::NotConnected);
        }
        self.metrics.record_frame_sent(messages.len(), bytes);
        Ok(WriteOutcome::Sent)
    }

    async fn disconnect(&self) -> bool {
        let conn = {
            let mut state = self.state.lock();
            if let Some(task) = state.reconnect_task.take() {
                task.abort();
            }
            state.connection.take()
        };
        self.scheduler.clear();
        self.tracker.clear();
        self.metrics.scheduled_players.store(0, Ordering::Relaxed);
        self.metrics.tracked_players.store(0, Ordering::Relaxed);

        let Some(conn) = conn else {
            return false;
        };
        info!("Disconnecting from the audio service");
        for player in conn.clear_players() {
            if player.set_online(false) {
                self.publish(player.id, PlayerStatus::Offline);
            }
        }
        conn.request_close(CLOSE_GOING_AWAY, GOING_OFFLINE);
        if tokio::time::timeout(CLOSE_TIMEOUT, conn.wait_closed()).await.is_err() {
            warn!("Timed out waiting for the audio service connection to close");
        }
        true
    }

    pub(crate) fn publish(&self, player: EntityId, status: PlayerStatus) {
        // No receivers is fine
        let _ = self.events.send(AudioStatusEvent { player, status });
    }

    /// Messages announcing a player together with every configured track
    pub(crate) fn status_payload(&self, id: EntityId, status: PlayerStatus) -> Vec<Message> {
        let mut messages = Vec::with_capacity(1 + self.config.audio_tracks.len());
        messages.push(Message::status(id, status));
        for (track, settings) in &self.config.audio_tracks {
            messages.push(Message::track_meta(id, track, settings));
        }
        messages
    }

    /// Enrol an online player and send its full state; runs on the tick thread
    pub(crate) fn activate_player(&self, state: &PlayerState, mut messages: Vec<Message>) {
        self.scheduler.add_player(state.id);
        self.metrics
            .scheduled_players
            .store(self.scheduler.len() as u64, Ordering::Relaxed);
        self.tracker.write_audio_messages(state, &mut messages);
        if let Err(e) = self.write_and_flush(&messages) {
            debug!("Initial payload for {} not sent: {}", state.id, e);
        }
        self.publish(state.id, PlayerStatus::Online);
    }

    /// Stop tracking a player locally; runs on the tick thread
    pub(crate) fn deactivate_player(&self, id: EntityId, was_online: bool) {
        self.scheduler.remove_player(id);
        self.tracker.forget(id);
        self.metrics
            .scheduled_players
            .store(self.scheduler.len() as u64, Ordering::Relaxed);
        if was_online {
            self.publish(id, PlayerStatus::Offline);
        }
    }

    fn player_joined(&self, id: EntityId) -> bool {
        let Some(conn) = self.ready_connection() else {
            return false;
        };
        let Some(player) = conn.player(id) else {
            return false;
        };
        let Some(state) = self.world.player(id) else {
            return false;
        };
        // Online but no longer scheduled means the player left without a quit
        if player.set_online(true) && self.scheduler.contains(id) {
            return false;
        }
        self.activate_player(&state, vec![Message::status(id, PlayerStatus::Online)]);
        true
    }

    /// Player left the world without a quit notification; runs on the tick thread
    fn player_departed(&self, id: EntityId) {
        self.tracker.forget(id);
        self.metrics
            .scheduled_players
            .store(self.scheduler.len() as u64, Ordering::Relaxed);
        let Some(player) = self.current_connection().and_then(|conn| conn.player(id)) else {
            return;
        };
        if !player.set_online(false) {
            return;
        }
        debug!("Player {} left the world, marking offline", id);
        if let Err(e) = self.write_and_flush(&[Message::status(id, PlayerStatus::Offline)]) {
            debug!("Offline status for {} not sent: {}", id, e);
        }
        self.publish(id, PlayerStatus::Offline);
    }

    fn player_quit(&self, id: EntityId) -> bool {
        let Some(conn) = self.ready_connection() else {
            return false;
        };
        let Some(player) = conn.player(id) else {
            return false;
        };
        if !player.set_online(false) {
            return false;
        }
        self.deactivate_player(id, true);
        if let Err(e) = self.write_and_flush(&[Message::status(id, PlayerStatus::Offline)]) {
            debug!("Offline status for {} not sent: {}", id, e);
        }
        true
    }
}
