//! In-memory connector used by the client tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::channel::mpsc as channel;
use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::net::protocol::{encode, Message};
use crate::net::transport::{ConnectError, Connector, Established, Frame, HandshakeRequest, TransportError};

/// Result of the next connect attempt
pub(crate) enum Outcome {
    Accept,
    /// Accept after a delay
    Delay(Duration),
    Fail(ConnectError),
}

/// Remote end of an accepted connection
pub(crate) struct Remote {
    pub session_id: String,
    pub request: HandshakeRequest,
    outgoing: channel::UnboundedReceiver<Frame>,
    incoming: channel::UnboundedSender<Result<Frame, TransportError>>,
}

impl Remote {
    pub fn send(&self, frame: Frame) {
        let _ = self.incoming.unbounded_send(Ok(frame));
    }

    pub fn send_messages(&self, messages: &[Message]) {
        self.send(Frame::Text(encode(messages).unwrap()));
    }

    pub fn send_error(&self) {
        let _ = self
            .incoming
            .unbounded_send(Err(TransportError::Io("connection reset".to_string())));
    }

    /// Close from the remote side
    pub fn close(&self) {
        self.send(Frame::Close(Some((1000, "bye".to_string()))));
    }

    /// Next frame written by the client, `None` once the client closed its side
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.outgoing.next().await
    }

    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.outgoing.try_next().ok().flatten()
    }
}

pub(crate) struct MemoryConnector {
    outcomes: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    next_session: AtomicU64,
    remotes_tx: mpsc::UnboundedSender<Remote>,
    remotes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Remote>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
            remotes_tx,
            remotes_rx: tokio::sync::Mutex::new(remotes_rx),
        }
    }

    /// Queue the outcome of a future attempt; attempts accept once the queue is empty
    pub fn push(&self, outcome: Outcome) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait for the next accepted connection
    pub async fn next_remote(&self) -> Remote {
        self.remotes_rx
            .lock()
            .await
            .recv()
            .await
            .expect("connector dropped")
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, request: HandshakeRequest) -> BoxFuture<'static, Result<Established, ConnectError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.outcomes.lock().pop_front().unwrap_or(Outcome::Accept);
        let session_id = format!("session-{}", self.next_session.fetch_add(1, Ordering::SeqCst));
        let remotes = self.remotes_tx.clone();

        async move {
            match outcome {
                Outcome::Accept => {}
                Outcome::Delay(delay) => tokio::time::sleep(delay).await,
                Outcome::Fail(e) => return Err(e),
            }
            let (outgoing_tx, outgoing) = channel::unbounded::<Frame>();
            let (incoming, incoming_rx) = channel::unbounded::<Result<Frame, TransportError>>();
            let _ = remotes.send(Remote {
                session_id: session_id.clone(),
                request,
                outgoing,
                incoming,
            });
            Ok(Established {
                session_id,
                sink: Box::pin(outgoing_tx.sink_map_err(|_| TransportError::Closed)),
                stream: incoming_rx.boxed(),
            })
        }
        .boxed()
    }
}
