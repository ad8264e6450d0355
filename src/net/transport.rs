//! Duplex transport to the remote audio service
//!
//! The client talks to a [`Connector`], which performs the transport connect and the
//! application handshake and hands back a frame sink and stream. [`WebSocketConnector`]
//! is the production implementation.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::{self, BoxFuture};
use futures::stream::BoxStream;
use futures::{FutureExt, Sink, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::debug;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "connect-user-id";
pub const USER_PASSWORD_HEADER: &str = "connect-user-password";
pub const SUPPLIER_ID_HEADER: &str = "connect-supplier-id";
/// Response header carrying the server-assigned session id
pub const SESSION_ID_HEADER: &str = "connect-session-id";

/// Pending outbound bytes above which the connection stops being writable
pub const WRITE_HIGH_WATER_MARK: usize = 32 * 1024;
/// Pending outbound bytes below which it becomes writable again
pub const WRITE_LOW_WATER_MARK: usize = 8 * 1024;

/// Close code sent on a voluntary disconnect
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<(u16, String)>),
}

impl Frame {
    /// Payload size used for write accounting
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close(reason) => reason.as_ref().map_or(0, |(_, r)| r.len() + 2),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_ws(self) -> WsMessage {
        match self {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
            Frame::Ping(data) => WsMessage::Ping(data),
            Frame::Pong(data) => WsMessage::Pong(data),
            Frame::Close(close) => WsMessage::Close(close.map(|(code, reason)| CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        }
    }

    fn from_ws(message: WsMessage) -> Option<Self> {
        match message {
            WsMessage::Text(text) => Some(Frame::Text(text)),
            WsMessage::Binary(data) => Some(Frame::Binary(data)),
            WsMessage::Ping(data) => Some(Frame::Ping(data)),
            WsMessage::Pong(data) => Some(Frame::Pong(data)),
            WsMessage::Close(close) => Some(Frame::Close(
                close.map(|frame| (u16::from(frame.code), frame.reason.into_owned())),
            )),
            WsMessage::Frame(_) => None,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => TransportError::Closed,
            other => TransportError::Io(other.to_string()),
        }
    }
}

/// Failure of a connect attempt
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// The endpoint could not be reached
    #[error("unable to reach {0}")]
    Unreachable(String),
    /// The endpoint answered with something other than a protocol upgrade
    #[error("handshake refused with status {status}: {body}")]
    Refused { status: u16, body: String },
    /// The upgrade succeeded but did not carry a session id
    #[error("handshake response is missing the session id")]
    MissingSessionId,
    /// The upgrade response did not follow the protocol
    #[error("malformed handshake response: {0}")]
    Malformed(String),
    /// The request could not be built from the configuration
    #[error("invalid handshake request: {0}")]
    InvalidRequest(String),
}

impl ConnectError {
    /// The remote side rejected the session; retrying would fail the same way
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            ConnectError::Refused { .. }
                | ConnectError::MissingSessionId
                | ConnectError::Malformed(_)
                | ConnectError::InvalidRequest(_)
        )
    }

    /// The transport connect itself succeeded
    pub fn transport_reached(&self) -> bool {
        matches!(
            self,
            ConnectError::Refused { .. } | ConnectError::MissingSessionId | ConnectError::Malformed(_)
        )
    }
}

impl From<tungstenite::Error> for ConnectError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::Http(response) => ConnectError::Refused {
                status: response.status().as_u16(),
                body: response
                    .body()
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body).into_owned())
                    .unwrap_or_default(),
            },
            tungstenite::Error::Protocol(e) => ConnectError::Malformed(e.to_string()),
            tungstenite::Error::Url(e) => ConnectError::InvalidRequest(e.to_string()),
            tungstenite::Error::HttpFormat(e) => ConnectError::InvalidRequest(e.to_string()),
            other => ConnectError::Unreachable(other.to_string()),
        }
    }
}

/// Identity presented during the handshake
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeRequest {
    pub uri: String,
    pub user_id: Uuid,
    pub user_password: String,
    pub supplier_id: Uuid,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<Frame, TransportError>>;

/// An open session after a successful handshake
pub struct Established {
    pub session_id: String,
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transport connections
pub trait Connector: Send + Sync {
    /// Connect and perform the handshake
    fn connect(&self, request: HandshakeRequest) -> BoxFuture<'static, Result<Established, ConnectError>>;
}

/// WebSocket connector
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(&self, request: HandshakeRequest) -> BoxFuture<'static, Result<Established, ConnectError>> {
        async move {
            let mut ws_request = request
                .uri
                .as_str()
                .into_client_request()
                .map_err(ConnectError::from)?;

            let headers = ws_request.headers_mut();
            for (name, value) in [
                (USER_ID_HEADER, request.user_id.to_string()),
                (USER_PASSWORD_HEADER, request.user_password.clone()),
                (SUPPLIER_ID_HEADER, request.supplier_id.to_string()),
            ] {
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| ConnectError::InvalidRequest(format!("{name}: {e}")))?;
                headers.insert(HeaderName::from_static(name), value);
            }

            let (ws_stream, response) = tokio_tungstenite::connect_async(ws_request)
                .await
                .map_err(ConnectError::from)?;

            let session_id = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .ok_or(ConnectError::MissingSessionId)?;
            debug!("Upgrade to {} complete", request.uri);

            let (sink, stream) = ws_stream.split();
            let sink = sink
                .sink_map_err(TransportError::from)
                .with(|frame: Frame| future::ready(Ok::<_, TransportError>(frame.into_ws())));
            let stream = stream.filter_map(|message| {
                future::ready(match message {
                    Ok(message) => Frame::from_ws(message).map(Ok),
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            });

            Ok(Established {
                session_id,
                sink: Box::pin(sink),
                stream: stream.boxed(),
            })
        }
        .boxed()
    }
}

/// Outbound byte budget with high/low water mark hysteresis
#[derive(Debug)]
pub struct WriteBudget {
    pending: AtomicUsize,
    writable: AtomicBool,
    high: usize,
    low: usize,
}

impl Default for WriteBudget {
    fn default() -> Self {
        Self::new(WRITE_HIGH_WATER_MARK, WRITE_LOW_WATER_MARK)
    }
}

impl WriteBudget {
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            writable: AtomicBool::new(true),
            high,
            low: low.min(high),
        }
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Account bytes queued for writing
    pub fn reserve(&self, bytes: usize) {
        let pending = self.pending.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if pending > self.high {
            self.writable.store(false, Ordering::Release);
        }
    }

    /// Account bytes handed to the transport
    pub fn release(&self, bytes: usize) {
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some(p.saturating_sub(bytes)))
            .unwrap_or(0);
        if previous.saturating_sub(bytes) < self.low {
            self.writable.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// How the test endpoint answers the upgrade
    #[derive(Clone, Copy)]
    enum Reply {
        Session(&'static str),
        NoSession,
        Reject(u16),
    }

    type SeenHeaders = Arc<Mutex<Vec<(String, String)>>>;

    /// Accept one upgrade, record the identity headers, greet with "hello" and
    /// return the first message the client sends
    async fn serve_once(reply: Reply) -> (String, SeenHeaders, JoinHandle<Option<WsMessage>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("ws://{}/supplier", listener.local_addr().unwrap());
        let seen: SeenHeaders = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&seen);

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.ok()?;
            let callback = move |request: &Request, mut response: Response| {
                assert_eq!(request.uri().path(), "/supplier");
                {
                    let mut headers = recorded.lock();
                    for name in [USER_ID_HEADER, USER_PASSWORD_HEADER, SUPPLIER_ID_HEADER] {
                        if let Some(value) = request.headers().get(name) {
                            headers.push((name.to_string(), value.to_str().unwrap().to_string()));
                        }
                    }
                }
                match reply {
                    Reply::Session(id) => {
                        response
                            .headers_mut()
                            .insert(SESSION_ID_HEADER, HeaderValue::from_static(id));
                        Ok(response)
                    }
                    Reply::NoSession => Ok(response),
                    Reply::Reject(status) => Err::<Response, ErrorResponse>(
                        tungstenite::http::Response::builder()
                            .status(status)
                            .body(Some("bad credentials".to_string()))
                            .unwrap(),
                    ),
                }
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await.ok()?;
            ws.send(WsMessage::Text("hello".into())).await.ok()?;
            ws.next().await?.ok()
        });
        (uri, seen, server)
    }

    fn request(uri: String) -> HandshakeRequest {
        HandshakeRequest {
            uri,
            user_id: Uuid::new_v4(),
            user_password: "secret".to_string(),
            supplier_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn test_websocket_handshake() {
        let (uri, seen, server) = serve_once(Reply::Session("session-42")).await;
        let request = request(uri);

        let mut established = WebSocketConnector.connect(request.clone()).await.unwrap();
        assert_eq!(established.session_id, "session-42");
        assert_eq!(
            seen.lock().clone(),
            vec![
                (USER_ID_HEADER.to_string(), request.user_id.to_string()),
                (USER_PASSWORD_HEADER.to_string(), "secret".to_string()),
                (SUPPLIER_ID_HEADER.to_string(), request.supplier_id.to_string()),
            ]
        );

        let greeting = established.stream.next().await.unwrap().unwrap();
        assert_eq!(greeting, Frame::Text("hello".to_string()));
        established.sink.send(Frame::Text("hi".to_string())).await.unwrap();
        assert_eq!(server.await.unwrap(), Some(WsMessage::Text("hi".into())));
    }

    #[tokio::test]
    async fn test_websocket_missing_session_id() {
        let (uri, seen, server) = serve_once(Reply::NoSession).await;
        match WebSocketConnector.connect(request(uri)).await {
            Err(e) => {
                assert!(matches!(e, ConnectError::MissingSessionId));
                assert!(e.is_refusal());
                assert!(e.transport_reached());
            }
            Ok(_) => panic!("Accepted a handshake without session id"),
        }
        assert_eq!(seen.lock().len(), 3);
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_websocket_rejected_upgrade() {
        let (uri, _seen, server) = serve_once(Reply::Reject(401)).await;
        match WebSocketConnector.connect(request(uri)).await {
            Err(ConnectError::Refused { status, .. }) => assert_eq!(status, 401),
            Err(e) => panic!("Wrong error: {e}"),
            Ok(_) => panic!("Accepted a rejected handshake"),
        }
        assert_eq!(server.await.unwrap(), None);
    }

    #[test]
    fn test_write_budget_hysteresis() {
        let budget = WriteBudget::new(100, 20);
        assert!(budget.is_writable());
        budget.reserve(60);
        budget.reserve(50);
        assert!(!budget.is_writable());
        budget.release(60);
        // Still above the low mark
        assert!(!budget.is_writable());
        budget.release(40);
        assert!(budget.is_writable());
        assert_eq!(budget.pending(), 10);
    }

    #[test]
    fn test_release_saturates() {
        let budget = WriteBudget::default();
        budget.release(10);
        assert_eq!(budget.pending(), 0);
        assert!(budget.is_writable());
    }

    #[test]
    fn test_connect_error_classes() {
        let refused = ConnectError::Refused {
            status: 401,
            body: "bad credentials".to_string(),
        };
        assert!(refused.is_refusal());
        assert!(refused.transport_reached());
        assert!(ConnectError::MissingSessionId.is_refusal());

        let unreachable = ConnectError::Unreachable("connection refused".to_string());
        assert!(!unreachable.is_refusal());
        assert!(!unreachable.transport_reached());
    }

    #[test]
    fn test_frame_ws_conversion() {
        let close = Frame::Close(Some((CLOSE_GOING_AWAY, "Going offline".to_string())));
        match close.clone().into_ws() {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1001);
                assert_eq!(frame.reason, "Going offline");
            }
            other => panic!("Wrong message: {other:?}"),
        }
        assert_eq!(Frame::from_ws(close.into_ws()), Some(Frame::Close(Some((1001, "Going offline".to_string())))));
        assert_eq!(Frame::Text("abc".to_string()).len(), 3);
    }

    #[tokio::test]
    async fn test_websocket_unreachable() {
        let request = HandshakeRequest {
            uri: "ws://127.0.0.1:1/supplier".to_string(),
            user_id: Uuid::new_v4(),
            user_password: "secret".to_string(),
            supplier_id: Uuid::new_v4(),
        };
        match WebSocketConnector.connect(request).await {
            Err(e) => assert!(!e.transport_reached()),
            Ok(_) => panic!("Connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn test_websocket_invalid_uri() {
        let request = HandshakeRequest {
            uri: "not a uri".to_string(),
            user_id: Uuid::new_v4(),
            user_password: "secret".to_string(),
            supplier_id: Uuid::new_v4(),
        };
        assert!(matches!(
            WebSocketConnector.connect(request).await,
            Err(ConnectError::InvalidRequest(_))
        ));
    }
}
