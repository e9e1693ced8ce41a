use shared::ClientRole;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub type ConnectionId = u32;

/// Outbound half of a connection. The writer task drains the receiving end
/// into the socket, so per-destination order is the order of enqueueing.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// Details captured when the transport is accepted
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub addr: SocketAddr,
}

/// Outcome of counting one inbound message against the rate window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStatus {
    Allowed,
    /// Over the window quota; the message is rejected
    Limited,
    /// Over twice the quota; the connection should be evicted
    Exceeded,
}

// Fixed-window message counter
#[derive(Debug)]
pub struct RateWindow {
    started: Instant,
    count: u32,
}

impl RateWindow {
    pub fn new() -> Self {
        RateWindow {
            started: Instant::now(),
            count: 0,
        }
    }

    pub fn hit(&mut self, window: Duration, max_messages: u32) -> RateLimitStatus {
        let now = Instant::now();
        if now.duration_since(self.started) >= window {
            self.started = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);

        if self.count > max_messages.saturating_mul(2) {
            RateLimitStatus::Exceeded
        } else if self.count > max_messages {
            RateLimitStatus::Limited
        } else {
            RateLimitStatus::Allowed
        }
    }
}

impl Default for RateWindow {
    fn default() -> Self {
        Self::new()
    }
}

// One live transport endpoint
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub role: ClientRole,
    pub user_agent: Option<String>,
    pub client_version: Option<String>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub last_ping_sent: Option<Instant>,
    pub last_pong_received: Instant,
    pub latency_ms: Option<u64>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_count: u64,
    pub session_id: Option<String>,
    pub room_id: Option<String>,
    pub rate_window: RateWindow,
    sender: OutboundSender,
}

impl Connection {
    pub fn new(id: ConnectionId, metadata: ConnectionMetadata, sender: OutboundSender) -> Self {
        let now = Instant::now();
        Connection {
            id,
            addr: metadata.addr,
            role: ClientRole::Unknown,
            user_agent: None,
            client_version: None,
            connected_at: now,
            last_activity: now,
            last_ping_sent: None,
            last_pong_received: now,
            latency_ms: None,
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            error_count: 0,
            session_id: None,
            room_id: None,
            rate_window: RateWindow::new(),
            sender,
        }
    }

    pub fn is_identified(&self) -> bool {
        self.role != ClientRole::Unknown
    }

    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    // Update the last activity time
    pub fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    // Record a pong and derive round-trip latency from the last ping
    pub fn touch_pong(&mut self) {
        let now = Instant::now();
        self.last_pong_received = now;
        self.last_activity = now;
        if let Some(sent) = self.last_ping_sent {
            self.latency_ms = Some(now.saturating_duration_since(sent).as_millis() as u64);
        }
    }

    // Check whether the peer missed its pong deadline
    pub fn is_unresponsive(&self, timeout: Duration) -> bool {
        Instant::now().duration_since(self.last_pong_received) > timeout
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.messages_received += 1;
        self.bytes_received += bytes as u64;
        self.touch_activity();
    }

    // Queue a frame for the writer task
    pub fn send_raw(&mut self, message: Message) -> bool {
        let len = message.len() as u64;
        if self.sender.send(message).is_err() {
            return false;
        }
        self.messages_sent += 1;
        self.bytes_sent += len;
        true
    }

    // Ask the writer task to close the socket
    pub fn close(&self) {
        let _ = self.sender.send(Message::Close(None));
    }
}
