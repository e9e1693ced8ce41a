//! WebSocket listener, per-connection tasks and background timers

use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionMetadata};
use crate::error::BrokerError;
use crate::hooks::Hooks;
use crate::metrics::BrokerMetrics;
use crate::router::{DisconnectReason, MessageRouter};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// How long a finished reader waits for its writer to flush
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stops a running [`Server`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        // No receiver means the server already stopped
        let _ = self.tx.send(());
    }
}

/// Accepts WebSocket clients and feeds their frames to the router
pub struct Server {
    listener: TcpListener,
    router: MessageRouter,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        Self::bind_with_hooks(config, Hooks::new()).await
    }

    /// Binds the listener and composes the router with extra hooks
    pub async fn bind_with_hooks(config: ServerConfig, hooks: Hooks) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr.clone(),
                source,
            })?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        Ok(Server {
            listener,
            router: MessageRouter::new(config, hooks),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn router(&self) -> MessageRouter {
        self.router.clone()
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.router.metrics()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serves until the shutdown handle fires
    pub async fn run(self) -> Result<(), ServerError> {
        let Server {
            listener,
            router,
            shutdown_tx: _shutdown_tx,
            mut shutdown_rx,
        } = self;

        let config = router.config().clone();
        let background = vec![
            spawn_periodic(config.ping_interval, {
                let router = router.clone();
                move || {
                    let router = router.clone();
                    async move {
                        router.heartbeat().await;
                    }
                }
            }),
            spawn_periodic(config.cleanup_interval, {
                let router = router.clone();
                move || {
                    let router = router.clone();
                    async move {
                        router.cleanup().await;
                    }
                }
            }),
            spawn_periodic(config.stats_interval, {
                let router = router.clone();
                move || {
                    let router = router.clone();
                    async move {
                        log_stats(&router).await;
                    }
                }
            }),
        ];

        info!("Hub listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted TCP connection from {}", addr);
                            tokio::spawn(handle_connection(router.clone(), stream, addr));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        for task in background {
            task.abort();
        }
        router.shutdown("Server shutting down").await;
        info!("Hub stopped");
        Ok(())
    }
}

/// Runs `tick` every `period`, skipping the immediate first tick
fn spawn_periodic<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer.tick().await;

        loop {
            timer.tick().await;
            tick().await;
        }
    })
}

async fn log_stats(router: &MessageRouter) {
    let metrics = router.metrics_snapshot().await;
    info!(
        "{} connections ({} displays, {} sensors), {} sessions ({} playing), {} rooms, {:.1}ms avg latency",
        metrics.connections,
        metrics.displays,
        metrics.sensors,
        metrics.active_sessions,
        metrics.playing_sessions,
        metrics.active_rooms,
        metrics.average_latency_ms
    );
}

async fn handle_connection(router: MessageRouter, stream: TcpStream, addr: SocketAddr) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (sink, reader) = ws_stream.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(sink, rx));

    let id = match router
        .register(tx.clone(), ConnectionMetadata { addr })
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Rejecting {}: {}", addr, e);
            if let Ok(text) = e.to_message().to_json() {
                let _ = tx.send(Message::Text(text));
            }
            let _ = tx.send(Message::Close(None));
            drop(tx);
            let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
            return;
        }
    };
    // The connection table now owns the only sender
    drop(tx);

    let writer_finished = read_loop(&router, id, reader, &mut writer).await;
    router
        .handle_disconnect(id, DisconnectReason::ClientClosed)
        .await;

    if !writer_finished {
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
    }
}

/// Processes frames in order until the peer goes away.
/// Returns true when the loop ended because the writer finished.
async fn read_loop(
    router: &MessageRouter,
    id: ConnectionId,
    mut reader: WsStream,
    writer: &mut JoinHandle<()>,
) -> bool {
    loop {
        tokio::select! {
            frame = reader.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        router.handle_message(id, &text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        router
                            .send_error(
                                id,
                                &BrokerError::InvalidMessage("Binary frames are not supported".into()),
                            )
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Connection {} closed by peer", id);
                        return false;
                    }
                    // Transport-level ping/pong is answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Connection {} read error: {}", id, e);
                        return false;
                    }
                }
            }
            _ = &mut *writer => {
                debug!("Connection {} writer finished", id);
                return true;
            }
        }
    }
}

/// Drains the outbound queue into the socket, stopping after a Close frame
async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("Socket write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
