//! Prometheus-compatible metrics endpoint
//!
//! Exposes audio client metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Number of resolution pass samples kept for percentiles
const PASS_HISTORY_LEN: usize = 1000;

/// Percentiles over the rolling pass history, zero until 10 samples exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassTimeStats {
    pub p95_us: u64,
    pub max_us: u64,
}

/// Metrics registry for the audio client
#[derive(Debug)]
pub struct Metrics {
    // Connection
    pub connection_attempts: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub handshakes_refused: AtomicU64,
    pub reconnects_scheduled: AtomicU64,
    pub connected: AtomicU64,

    // Frames
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub frames_received: AtomicU64,
    pub decode_failures: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,

    // Players
    pub tracked_players: AtomicU64,
    pub scheduled_players: AtomicU64,

    // Resolution
    pub resolution_passes: AtomicU64,
    pub audio_messages: AtomicU64,
    pub pass_time_us: AtomicU64,

    start_time: Instant,

    // Rolling pass times for percentile calculation
    pass_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connection_attempts: AtomicU64::new(0),
            handshakes_completed: AtomicU64::new(0),
            handshakes_refused: AtomicU64::new(0),
            reconnects_scheduled: AtomicU64::new(0),
            connected: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            tracked_players: AtomicU64::new(0),
            scheduled_players: AtomicU64::new(0),
            resolution_passes: AtomicU64::new(0),
            audio_messages: AtomicU64::new(0),
            pass_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
            pass_history: RwLock::new(VecDeque::with_capacity(PASS_HISTORY_LEN)),
        }
    }

    /// Record one resolution pass and the number of audio messages it produced
    pub fn record_pass(&self, duration: Duration, messages: usize) {
        let us = duration.as_micros() as u64;
        self.pass_time_us.store(us, Ordering::Relaxed);
        self.resolution_passes.fetch_add(1, Ordering::Relaxed);
        self.audio_messages.fetch_add(messages as u64, Ordering::Relaxed);

        let mut history = self.pass_history.write();
        if history.len() == PASS_HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(us);
    }

    /// p95 and max of the recent pass times, computed on demand
    pub fn pass_time_stats(&self) -> PassTimeStats {
        let mut sorted: Vec<u64> = self.pass_history.read().iter().copied().collect();
        if sorted.len() < 10 {
            return PassTimeStats::default();
        }
        sorted.sort_unstable();
        let p95_idx = (sorted.len() as f32 * 0.95) as usize;
        PassTimeStats {
            p95_us: sorted[p95_idx.min(sorted.len() - 1)],
            max_us: sorted.last().copied().unwrap_or(0),
        }
    }

    /// Record a text frame handed to the transport
    pub fn record_frame_sent(&self, messages: usize, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.messages_sent.fetch_add(messages as u64, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let stats = self.pass_time_stats();
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        // Connection metrics
        metric!("zone_audio_connected", "Whether a session is established (0/1)", "gauge",
            self.connected.load(Ordering::Relaxed));
        metric!("zone_audio_connection_attempts_total", "Transport connection attempts", "counter",
            self.connection_attempts.load(Ordering::Relaxed));
        metric!("zone_audio_handshakes_total", "Completed handshakes", "counter",
            self.handshakes_completed.load(Ordering::Relaxed));
        metric!("zone_audio_handshakes_refused_total", "Refused handshakes", "counter",
            self.handshakes_refused.load(Ordering::Relaxed));
        metric!("zone_audio_reconnects_scheduled_total", "Scheduled reconnect attempts", "counter",
            self.reconnects_scheduled.load(Ordering::Relaxed));

        // Frame metrics
        metric!("zone_audio_frames_sent_total", "Text frames sent", "counter",
            self.frames_sent.load(Ordering::Relaxed));
        metric!("zone_audio_frames_dropped_total", "Frames dropped because the transport was not writable", "counter",
            self.frames_dropped.load(Ordering::Relaxed));
        metric!("zone_audio_frames_received_total", "Text frames received", "counter",
            self.frames_received.load(Ordering::Relaxed));
        metric!("zone_audio_decode_failures_total", "Frames that failed to decode", "counter",
            self.decode_failures.load(Ordering::Relaxed));
        metric!("zone_audio_messages_sent_total", "Messages sent", "counter",
            self.messages_sent.load(Ordering::Relaxed));
        metric!("zone_audio_bytes_sent_total", "Total bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("zone_audio_bytes_received_total", "Total bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));

        // Player metrics
        metric!("zone_audio_tracked_players", "Players announced by the remote service", "gauge",
            self.tracked_players.load(Ordering::Relaxed));
        metric!("zone_audio_scheduled_players", "Players enrolled in the scheduler", "gauge",
            self.scheduled_players.load(Ordering::Relaxed));

        // Resolution metrics
        metric!("zone_audio_resolution_passes_total", "Audio resolution passes", "counter",
            self.resolution_passes.load(Ordering::Relaxed));
        metric!("zone_audio_audio_messages_total", "Audio messages produced", "counter",
            self.audio_messages.load(Ordering::Relaxed));
        metric!("zone_audio_pass_time_microseconds", "Last resolution pass time", "gauge",
            self.pass_time_us.load(Ordering::Relaxed));
        metric!("zone_audio_pass_time_p95_microseconds", "95th percentile resolution pass time", "gauge",
            stats.p95_us);
        metric!("zone_audio_pass_time_max_microseconds", "Maximum resolution pass time", "gauge",
            stats.max_us);
        metric!("zone_audio_uptime_seconds", "Client uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics
    pub fn to_json(&self) -> String {
        let stats = self.pass_time_stats();
        format!(r#"{{
  "connection": {{
    "connected": {},
    "attempts": {},
    "handshakes": {},
    "refused": {},
    "reconnects_scheduled": {}
  }},
  "frames": {{
    "sent": {},
    "dropped": {},
    "received": {},
    "decode_failures": {},
    "messages_sent": {},
    "bytes_sent": {},
    "bytes_received": {}
  }},
  "players": {{
    "tracked": {},
    "scheduled": {}
  }},
  "resolution": {{
    "passes": {},
    "audio_messages": {},
    "pass_time_us": {},
    "pass_time_p95_us": {},
    "pass_time_max_us": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.connected.load(Ordering::Relaxed),
            self.connection_attempts.load(Ordering::Relaxed),
            self.handshakes_completed.load(Ordering::Relaxed),
            self.handshakes_refused.load(Ordering::Relaxed),
            self.reconnects_scheduled.load(Ordering::Relaxed),
            self.frames_sent.load(Ordering::Relaxed),
            self.frames_dropped.load(Ordering::Relaxed),
            self.frames_received.load(Ordering::Relaxed),
            self.decode_failures.load(Ordering::Relaxed),
            self.messages_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.tracked_players.load(Ordering::Relaxed),
            self.scheduled_players.load(Ordering::Relaxed),
            self.resolution_passes.load(Ordering::Relaxed),
            self.audio_messages.load(Ordering::Relaxed),
            self.pass_time_us.load(Ordering::Relaxed),
            stats.p95_us,
            stats.max_us,
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = render_response(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

fn render_response(metrics: &Metrics, request: &str) -> String {
    let (content_type, body) = if request.starts_with("GET /metrics/json") || request.starts_with("GET /json") {
        ("application/json", metrics.to_json())
    } else if request.starts_with("GET /metrics") {
        ("text/plain; version=0.0.4", metrics.to_prometheus())
    } else if request.starts_with("GET /health") || request.starts_with("GET / ") {
        ("text/plain", "OK".to_string())
    } else {
        return "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string();
    };
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        content_type,
        body.len(),
        body
    )
}
