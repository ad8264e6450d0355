//! Inbound frame dispatch
//!
//! Runs on the session task. Anything that touches the world or the scheduler is
//! posted to the host tick loop.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::net::client::ClientInner;
use crate::net::connection::Connection;
use crate::net::protocol::{self, CommandKind, ListAction, Message, PlayerStatus};
use crate::net::transport::Frame;
use crate::EntityId;

/// Whether the session keeps running after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close,
}

pub(crate) fn handle_frame(inner: &Arc<ClientInner>, conn: &Arc<Connection>, frame: Frame) -> Flow {
    match frame {
        Frame::Text(text) => {
            inner.metrics.record_frame_received(text.len());
            match protocol::decode(&text) {
                Ok(messages) => {
                    for message in messages {
                        handle_message(inner, conn, message);
                    }
                }
                Err(e) => {
                    warn!("Ignoring undecodable frame from audio service: {}", e);
                    inner.metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            Flow::Continue
        }
        Frame::Ping(data) => {
            conn.send_control(Frame::Pong(data));
            Flow::Continue
        }
        Frame::Pong(_) => {
            trace!("Pong from audio service");
            Flow::Continue
        }
        Frame::Binary(data) => {
            debug!("Ignoring {} byte binary frame", data.len());
            Flow::Continue
        }
        Frame::Close(reason) => {
            match reason {
                Some((code, reason)) => info!("Audio service closed the connection: {} {}", code, reason),
                None => info!("Audio service closed the connection"),
            }
            Flow::Close
        }
    }
}

fn handle_message(inner: &Arc<ClientInner>, conn: &Arc<Connection>, message: Message) {
    match message {
        Message::Heartbeat => {
            if !conn.budget().is_writable() {
                debug!("Skipping heartbeat reply, connection not writable");
                return;
            }
            match protocol::encode(&[Message::Heartbeat]) {
                Ok(text) => {
                    conn.send_text(text);
                }
                Err(e) => warn!("Failed to encode heartbeat: {}", e),
            }
        }
        Message::Status(status) => match status.status {
            PlayerStatus::Online => player_announced(inner, conn, status.id),
            PlayerStatus::Offline => player_withdrawn(inner, conn, status.id),
        },
        Message::Command(command) => match command.command {
            CommandKind::Add => player_announced(inner, conn, command.id),
            CommandKind::Remove => player_withdrawn(inner, conn, command.id),
        },
        Message::AudioList(list) => {
            let changed = match list.action {
                ListAction::Add => inner.audio_list.add_all(list.audio_ids.iter().cloned()),
                ListAction::Remove => inner.audio_list.remove_all(&list.audio_ids),
            };
            debug!(
                "Audio list {:?} of {} ids, changed: {}, now {}",
                list.action,
                list.audio_ids.len(),
                changed,
                inner.audio_list.len()
            );
        }
        other => warn!("Unexpected {} message from audio service", other.type_name()),
    }
}

/// The remote service wants audio for this player
fn player_announced(inner: &Arc<ClientInner>, conn: &Arc<Connection>, id: EntityId) {
    let (_, new) = conn.track(id);
    inner
        .metrics
        .tracked_players
        .store(conn.player_count() as u64, Ordering::Relaxed);
    if !new {
        debug!("Player {} already tracked", id);
        return;
    }

    let inner_ref = Arc::clone(inner);
    let conn_ref = Arc::clone(conn);
    inner.host.run_once(0, Box::new(move || announce(&inner_ref, &conn_ref, id)));
}

/// Send the initial state of a newly announced player; runs on the tick thread
fn announce(inner: &Arc<ClientInner>, conn: &Arc<Connection>, id: EntityId) {
    if !inner.is_current(conn) {
        return;
    }
    let Some(player) = conn.player(id) else {
        return;
    };

    match inner.world.player(id) {
        Some(state) => {
            if player.set_online(true) {
                return;
            }
            let messages = inner.status_payload(id, PlayerStatus::Online);
            inner.activate_player(&state, messages);
        }
        None => {
            let messages = inner.status_payload(id, PlayerStatus::Offline);
            if let Err(e) = inner.write_and_flush(&messages) {
                debug!("Offline status for {} not sent: {}", id, e);
            }
        }
    }
}

/// The remote service no longer wants audio for this player
fn player_withdrawn(inner: &Arc<ClientInner>, conn: &Arc<Connection>, id: EntityId) {
    let Some(player) = conn.untrack(id) else {
        return;
    };
    inner
        .metrics
        .tracked_players
        .store(conn.player_count() as u64, Ordering::Relaxed);
    let was_online = player.set_online(false);

    let inner_ref = Arc::clone(inner);
    inner
        .host
        .run_once(0, Box::new(move || inner_ref.deactivate_player(id, was_online)));
}
