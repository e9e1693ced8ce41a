use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use shared::{get_timestamp, ClientMessage, ClientRole, ServerMessage};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed server message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Connection closed by server")]
    Closed,

    #[error("Expected {expected}, got {actual}")]
    Unexpected {
        expected: &'static str,
        actual: &'static str,
    },
}

/// Headless hub client speaking the JSON protocol over one WebSocket
pub struct HubClient {
    sink: SplitSink<Socket, Message>,
    stream: SplitStream<Socket>,
    connection_id: u32,
    auto_pong: bool,
}

impl HubClient {
    /// Connects and waits for the `connection:established` greeting
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (socket, _) = connect_async(url).await?;
        let (sink, stream) = socket.split();

        let mut client = HubClient {
            sink,
            stream,
            connection_id: 0,
            auto_pong: true,
        };

        match client.recv(Duration::from_secs(5)).await? {
            ServerMessage::ConnectionEstablished { connection_id, .. } => {
                info!("Connected to {} as connection {}", url, connection_id);
                client.connection_id = connection_id;
                Ok(client)
            }
            other => Err(ClientError::Unexpected {
                expected: "connection:established",
                actual: other.message_type(),
            }),
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Controls whether server pings are answered inside `recv`
    pub fn set_auto_pong(&mut self, enabled: bool) {
        self.auto_pong = enabled;
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let text = message.to_json()?;
        self.send_raw(text).await
    }

    /// Sends an arbitrary text frame, valid JSON or not
    pub async fn send_raw(&mut self, text: impl Into<String>) -> Result<(), ClientError> {
        self.sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Returns the next server message, answering pings along the way
    pub async fn recv(&mut self, wait: Duration) -> Result<ServerMessage, ClientError> {
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = timeout(remaining, self.stream.next())
                .await
                .map_err(|_| ClientError::Timeout("a server message".to_string()))?;

            match frame {
                Some(Ok(Message::Text(text))) => {
                    let message = ServerMessage::from_json(&text)?;
                    if let ServerMessage::Ping { timestamp } = &message {
                        if self.auto_pong {
                            self.send(&ClientMessage::Pong {
                                timestamp: *timestamp,
                            })
                            .await?;
                        }
                    }
                    return Ok(message);
                }
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Skips messages until one of `message_type` arrives
    pub async fn recv_until(
        &mut self,
        message_type: &str,
        wait: Duration,
    ) -> Result<ServerMessage, ClientError> {
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let message = match self.recv(remaining).await {
                Err(ClientError::Timeout(_)) => {
                    return Err(ClientError::Timeout(message_type.to_string()))
                }
                other => other?,
            };
            if message.message_type() == message_type {
                return Ok(message);
            }
            debug!(
                "Skipping {} while waiting for {}",
                message.message_type(),
                message_type
            );
        }
    }

    /// Sends `client:identify` and waits for the acknowledgement
    pub async fn identify(&mut self, role: ClientRole) -> Result<(), ClientError> {
        self.identify_with_token(role, None).await
    }

    pub async fn identify_with_token(
        &mut self,
        role: ClientRole,
        admin_token: Option<String>,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::Identify {
            client_type: role,
            user_agent: Some(format!("hub-client/{}", env!("CARGO_PKG_VERSION"))),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            admin_token,
        })
        .await?;

        match self.recv(Duration::from_secs(5)).await? {
            ServerMessage::Identified { .. } => Ok(()),
            other => Err(ClientError::Unexpected {
                expected: "client:identified",
                actual: other.message_type(),
            }),
        }
    }

    /// Application-level ping; returns the measured round trip
    pub async fn ping(&mut self, wait: Duration) -> Result<Duration, ClientError> {
        let started = Instant::now();
        self.send(&ClientMessage::Ping {
            timestamp: get_timestamp(),
        })
        .await?;
        self.recv_until("pong", wait).await?;
        Ok(started.elapsed())
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.sink.send(Message::Close(None)).await?;
        Ok(())
    }
}
