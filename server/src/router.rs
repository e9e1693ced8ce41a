//! Inbound message pipeline and outbound fan-out.
//!
//! Every text frame goes through the same steps:
//! 1. rate window accounting (quota overrun evicts the connection)
//! 2. envelope checks: size, JSON object, `type` string
//! 3. dispatch-table lookup and role authorization
//! 4. typed parse into [`ClientMessage`]
//! 5. the handler, which mutates the managers and returns [`Outbound`] items
//!
//! Outbound items are delivered only after the session and room locks have
//! been released. Errors go back to the originating connection only.
//!
//! Lock order is always sessions → rooms → connections.

use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionMetadata, OutboundSender, RateLimitStatus};
use crate::connection_manager::ConnectionManager;
use crate::error::BrokerError;
use crate::game_state::{GameStateManager, PlayerDeparture, RoomOptions};
use crate::hooks::Hooks;
use crate::metrics::{BrokerMetrics, TableCounts};
use crate::session_manager::{
    ClosedSession, DisconnectOutcome, GameSession, SensorDeparture, SessionManager,
};
use log::{debug, info, warn};
use serde_json::Value;
use shared::{
    get_timestamp, ClientMessage, ClientRole, GameMode, MetricsSnapshot, ServerMessage,
    SessionState, MAX_TYPE_LENGTH, PROTOCOL_VERSION,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

/// A message waiting for delivery
#[derive(Debug, Clone)]
pub enum Outbound {
    To(ConnectionId, ServerMessage),
    Many(Vec<ConnectionId>, ServerMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    Timeout,
    QuotaExceeded,
    AdminKick,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client closed",
            DisconnectReason::Timeout => "liveness timeout",
            DisconnectReason::QuotaExceeded => "quota exceeded",
            DisconnectReason::AdminKick => "admin disconnect",
            DisconnectReason::ServerShutdown => "server shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who may send a message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Allowed before identification
    Open,
    Role(ClientRole),
}

/// Static dispatch table. None means the type is unknown.
pub fn required_access(message_type: &str) -> Option<Access> {
    let access = match message_type {
        "client:identify" | "session:validate" | "session:sync" | "room:list" | "ping"
        | "pong" => Access::Open,
        "session:create" | "session:start" | "session:pause" | "session:resume"
        | "session:end" | "session:close" | "room:create" | "room:join" | "room:leave"
        | "room:ready" | "room:start" | "room:pause" | "room:resume" | "room:end"
        | "game:update" => Access::Role(ClientRole::Display),
        "session:join" | "session:leave" | "sensor:data" => Access::Role(ClientRole::Sensor),
        "admin:stats" | "admin:disconnect" => Access::Role(ClientRole::Admin),
        _ => return None,
    };
    Some(access)
}

pub fn authorize(role: ClientRole, access: Access, message_type: &str) -> Result<(), BrokerError> {
    match access {
        Access::Open => Ok(()),
        Access::Role(_) if role == ClientRole::Unknown => {
            Err(BrokerError::NotIdentified(message_type.to_string()))
        }
        Access::Role(required) if required == role => Ok(()),
        Access::Role(_) => Err(BrokerError::Unauthorized {
            role,
            message_type: message_type.to_string(),
        }),
    }
}

/// A frame that passed the structural checks
#[derive(Debug, Clone)]
pub struct Envelope {
    pub message_type: String,
    pub value: Value,
}

/// Structural checks run before any typed parsing
pub fn validate_envelope(text: &str, max_size: usize) -> Result<Envelope, BrokerError> {
    if text.len() > max_size {
        return Err(BrokerError::MessageTooLarge {
            size: text.len(),
            limit: max_size,
        });
    }

    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| BrokerError::InvalidMessage("Message must be a JSON object".into()))?;

    let message_type = match object.get("type").and_then(Value::as_str) {
        Some(t) if !t.is_empty() && t.len() <= MAX_TYPE_LENGTH => t.to_string(),
        Some(_) => {
            return Err(BrokerError::InvalidMessage(format!(
                "type must be 1 to {} characters",
                MAX_TYPE_LENGTH
            )))
        }
        None => {
            return Err(BrokerError::InvalidMessage(
                "Missing string field: type".into(),
            ))
        }
    };
    Ok(Envelope { message_type, value })
}

fn session_of(sessions: &SessionManager, id: ConnectionId) -> Result<&GameSession, BrokerError> {
    sessions
        .hosted_session(id)
        .ok_or_else(|| BrokerError::InvalidState("Display has no session".into()))
}

fn multiplayer_session_of(
    sessions: &SessionManager,
    id: ConnectionId,
) -> Result<&GameSession, BrokerError> {
    let session = session_of(sessions, id)?;
    if session.mode != GameMode::Multiplayer {
        return Err(BrokerError::InvalidState(
            "Rooms require a multiplayer session".into(),
        ));
    }
    Ok(session)
}

/// Room fan-out after a player left
fn departure_outbound(departure: PlayerDeparture) -> Vec<Outbound> {
    let mut outbound = Vec::new();
    if let Some(room) = departure.room {
        if departure.game_ended {
            outbound.push(Outbound::Many(
                departure.members.clone(),
                ServerMessage::RoomEnded { room: room.clone() },
            ));
        }
        outbound.push(Outbound::Many(
            departure.members,
            ServerMessage::RoomUpdated { room },
        ));
    }
    outbound
}

#[derive(Clone)]
pub struct MessageRouter {
    connections: Arc<RwLock<ConnectionManager>>,
    sessions: Arc<Mutex<SessionManager>>,
    rooms: Arc<Mutex<GameStateManager>>,
    hooks: Hooks,
    metrics: Arc<BrokerMetrics>,
    config: Arc<ServerConfig>,
}

impl MessageRouter {
    /// Builds the managers from `config`. The built-in metrics are registered
    /// ahead of the supplied hooks.
    pub fn new(config: ServerConfig, hooks: Hooks) -> Self {
        let metrics = Arc::new(BrokerMetrics::new());
        let hooks = Hooks::new()
            .with_sensor_data_handler(metrics.clone())
            .with_lifecycle_handler(metrics.clone())
            .merge(hooks);

        Self {
            connections: Arc::new(RwLock::new(ConnectionManager::new(
                config.max_connections,
                config.rate_limit_window,
                config.rate_limit_max_messages,
            ))),
            sessions: Arc::new(Mutex::new(SessionManager::new(config.sessions.clone()))),
            rooms: Arc::new(Mutex::new(GameStateManager::new(config.rooms.clone()))),
            hooks,
            metrics,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Registers a transport and greets it with `connection:established`
    pub async fn register(
        &self,
        sender: OutboundSender,
        metadata: ConnectionMetadata,
    ) -> Result<ConnectionId, BrokerError> {
        let mut connections = self.connections.write().await;
        let id = connections.add(sender, metadata)?;
        connections.send(
            id,
            &ServerMessage::ConnectionEstablished {
                connection_id: id,
                protocol_version: PROTOCOL_VERSION.to_string(),
                server_time: get_timestamp(),
            },
        )?;
        Ok(id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Runs one inbound text frame through the pipeline
    pub async fn handle_message(&self, id: ConnectionId, text: &str) {
        let status = {
            let mut connections = self.connections.write().await;
            if connections.record_received(id, text.len()).is_err() {
                return;
            }
            connections.check_rate_limit(id)
        };

        match status {
            Ok(RateLimitStatus::Allowed) => {}
            Ok(RateLimitStatus::Limited) => {
                self.send_error(id, &BrokerError::RateLimited).await;
                return;
            }
            Ok(RateLimitStatus::Exceeded) => {
                warn!("Connection {} exceeded its message quota", id);
                self.handle_disconnect(id, DisconnectReason::QuotaExceeded)
                    .await;
                return;
            }
            Err(_) => return,
        }

        match self.dispatch(id, text).await {
            Ok(outbound) => self.deliver(outbound).await,
            Err(e) => {
                debug!("Connection {} message rejected: {}", id, e);
                self.send_error(id, &e).await;
            }
        }
    }

    /// Reports an error to one connection and counts it
    pub async fn send_error(&self, id: ConnectionId, error: &BrokerError) {
        let mut connections = self.connections.write().await;
        connections.record_error(id);
        if let Err(e) = connections.send(id, &error.to_message()) {
            debug!("Could not report error to connection {}: {}", id, e);
        }
    }

    async fn dispatch(&self, id: ConnectionId, text: &str) -> Result<Vec<Outbound>, BrokerError> {
        let envelope = validate_envelope(text, self.config.max_message_size)?;
        let access = required_access(&envelope.message_type)
            .ok_or_else(|| BrokerError::UnknownMessageType(envelope.message_type.clone()))?;
        let role = self.connections.read().await.role(id)?;
        authorize(role, access, &envelope.message_type)?;

        let message: ClientMessage = serde_json::from_value(envelope.value)?;
        self.handle(id, message).await
    }

    async fn handle(
        &self,
        id: ConnectionId,
        message: ClientMessage,
    ) -> Result<Vec<Outbound>, BrokerError> {
        match message {
            ClientMessage::Identify {
                client_type,
                user_agent,
                version,
                admin_token,
            } => {
                self.identify(id, client_type, user_agent, version, admin_token)
                    .await
            }
            ClientMessage::CreateSession { game_type } => self.create_session(id, game_type).await,
            ClientMessage::JoinSession {
                session_code,
                sensor_id,
            } => {
                self.join_session(id, &session_code, sensor_id.as_deref())
                    .await
            }
            ClientMessage::LeaveSession => self.leave_session(id).await,
            ClientMessage::SensorData { data } => self.sensor_data(id, data).await,
            ClientMessage::StartSession => self.start_session(id).await,
            ClientMessage::PauseSession => {
                let transition = self.sessions.lock().await.pause_game(id)?;
                Ok(vec![Outbound::Many(
                    transition.members,
                    ServerMessage::SessionPaused {
                        session_id: transition.session_id,
                    },
                )])
            }
            ClientMessage::ResumeSession => {
                let transition = self.sessions.lock().await.resume_game(id)?;
                Ok(vec![Outbound::Many(
                    transition.members,
                    ServerMessage::SessionResumed {
                        session_id: transition.session_id,
                    },
                )])
            }
            ClientMessage::EndSession { reason } => {
                let reason = reason.unwrap_or_else(|| "game_ended".to_string());
                let closed = self.sessions.lock().await.end_game(id, &reason)?;
                Ok(self.finish_closed_session(closed).await)
            }
            ClientMessage::CloseSession { reason } => {
                let reason = reason.unwrap_or_else(|| "closed_by_host".to_string());
                let closed = self.sessions.lock().await.close_session(id, &reason)?;
                Ok(self.finish_closed_session(closed).await)
            }
            ClientMessage::ValidateSession {
                session_code,
                session_id,
            } => {
                self.validate_session(id, session_code.as_deref(), session_id.as_deref())
                    .await
            }
            ClientMessage::SyncSession {
                session_id,
                client_state,
            } => self.sync_session(id, &session_id, client_state).await,
            ClientMessage::CreateRoom {
                game_id,
                max_players,
                is_private,
                nickname,
            } => {
                let options = RoomOptions {
                    game_id,
                    max_players,
                    is_private: is_private.unwrap_or(false),
                    nickname,
                };
                self.create_room(id, options).await
            }
            ClientMessage::JoinRoom { room_id, nickname } => {
                self.join_room(id, &room_id, nickname.as_deref()).await
            }
            ClientMessage::LeaveRoom => self.leave_room(id).await,
            ClientMessage::SetReady { ready } => {
                let sessions = self.sessions.lock().await;
                let session_id = session_of(&sessions, id)?.id.clone();
                let update = self
                    .rooms
                    .lock()
                    .await
                    .set_player_ready(&session_id, ready)?;
                Ok(vec![Outbound::Many(
                    update.members,
                    ServerMessage::RoomUpdated { room: update.room },
                )])
            }
            ClientMessage::StartRoom => self.start_room(id).await,
            ClientMessage::PauseRoom => {
                let sessions = self.sessions.lock().await;
                let session_id = session_of(&sessions, id)?.id.clone();
                let update = self.rooms.lock().await.pause_game(&session_id)?;
                Ok(vec![Outbound::Many(
                    update.members,
                    ServerMessage::RoomPaused {
                        room_id: update.room.room_id,
                    },
                )])
            }
            ClientMessage::ResumeRoom => {
                let sessions = self.sessions.lock().await;
                let session_id = session_of(&sessions, id)?.id.clone();
                let update = self.rooms.lock().await.resume_game(&session_id)?;
                Ok(vec![Outbound::Many(
                    update.members,
                    ServerMessage::RoomResumed {
                        room_id: update.room.room_id,
                    },
                )])
            }
            ClientMessage::EndRoom => {
                let sessions = self.sessions.lock().await;
                let session_id = session_of(&sessions, id)?.id.clone();
                let update = self.rooms.lock().await.end_game(&session_id)?;
                Ok(vec![Outbound::Many(
                    update.members,
                    ServerMessage::RoomEnded { room: update.room },
                )])
            }
            ClientMessage::ListRooms => {
                let rooms = self.rooms.lock().await.list_public_rooms();
                Ok(vec![Outbound::To(id, ServerMessage::RoomList { rooms })])
            }
            ClientMessage::GameUpdate {
                score,
                position,
                data,
            } => {
                let sessions = self.sessions.lock().await;
                let session_id = session_of(&sessions, id)?.id.clone();
                let update = self
                    .rooms
                    .lock()
                    .await
                    .update_player_state(&session_id, score, position, data)?;
                Ok(vec![Outbound::Many(
                    update.others,
                    ServerMessage::GameUpdate {
                        player_id: update.player_id,
                        score: update.score,
                        position: update.position,
                        data: update.data,
                    },
                )])
            }
            ClientMessage::Ping { timestamp } => Ok(vec![Outbound::To(
                id,
                ServerMessage::Pong {
                    timestamp,
                    server_time: get_timestamp(),
                },
            )]),
            ClientMessage::Pong { .. } => {
                self.connections.write().await.touch_pong(id)?;
                Ok(Vec::new())
            }
            ClientMessage::AdminStats => {
                let metrics = self.metrics_snapshot().await;
                Ok(vec![Outbound::To(id, ServerMessage::Stats { metrics })])
            }
            ClientMessage::AdminDisconnect {
                connection_id,
                reason,
            } => {
                if !self.connections.read().await.contains(connection_id) {
                    return Err(BrokerError::ConnectionNotFound(connection_id));
                }
                info!(
                    "Admin {} disconnecting connection {}: {}",
                    id,
                    connection_id,
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.handle_disconnect(connection_id, DisconnectReason::AdminKick)
                    .await;
                let metrics = self.metrics_snapshot().await;
                Ok(vec![Outbound::To(id, ServerMessage::Stats { metrics })])
            }
        }
    }

    /// Fails once `handle_disconnect` has removed the connection. Callers hold
    /// the session lock, which keeps the connection from being removed until
    /// their mutation is done.
    async fn ensure_connected(&self, id: ConnectionId) -> Result<(), BrokerError> {
        if self.connections.read().await.contains(id) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionNotFound(id))
        }
    }

    async fn identify(
        &self,
        id: ConnectionId,
        role: ClientRole,
        user_agent: Option<String>,
        version: Option<String>,
        admin_token: Option<String>,
    ) -> Result<Vec<Outbound>, BrokerError> {
        if role == ClientRole::Unknown {
            return Err(BrokerError::InvalidMessage(
                "clientType must be display, sensor or admin".into(),
            ));
        }
        if role == ClientRole::Admin {
            let granted = match (&self.config.admin_token, &admin_token) {
                (Some(expected), Some(given)) => expected == given,
                _ => false,
            };
            if !granted {
                warn!("Connection {} failed admin identification", id);
                return Err(BrokerError::Unauthorized {
                    role,
                    message_type: "client:identify".into(),
                });
            }
        }

        let changed = self
            .connections
            .write()
            .await
            .set_role(id, role, user_agent, version)?;
        if changed {
            info!("Connection {} identified as {}", id, role);
        }

        Ok(vec![Outbound::To(
            id,
            ServerMessage::Identified {
                connection_id: id,
                client_type: role,
                server_time: get_timestamp(),
            },
        )])
    }

    async fn create_session(
        &self,
        id: ConnectionId,
        mode: GameMode,
    ) -> Result<Vec<Outbound>, BrokerError> {
        let info = {
            let mut sessions = self.sessions.lock().await;
            self.ensure_connected(id).await?;
            let info = sessions.create_session(mode, id)?;
            self.connections
                .write()
                .await
                .set_session(id, Some(info.session_id.clone()));
            info
        };
        self.hooks.session_created(&info);

        Ok(vec![Outbound::To(
            id,
            ServerMessage::SessionCreated {
                session_code: info.session_code,
                session_id: info.session_id,
                game_type: info.game_type,
                max_sensors: info.max_sensors,
            },
        )])
    }

    async fn join_session(
        &self,
        id: ConnectionId,
        code: &str,
        requested_slot: Option<&str>,
    ) -> Result<Vec<Outbound>, BrokerError> {
        let (join, room_update) = {
            let mut sessions = self.sessions.lock().await;
            self.ensure_connected(id).await?;
            let join = sessions.connect_sensor(code, id, requested_slot)?;
            let room_update = match join.room_id {
                Some(_) => self
                    .rooms
                    .lock()
                    .await
                    .connect_player_sensor(&join.session_id),
                None => None,
            };
            self.connections
                .write()
                .await
                .set_session(id, Some(join.session_id.clone()));
            (join, room_update)
        };
        self.hooks.sensor_joined(&join.session_id, &join.slot);

        let mut outbound = vec![
            Outbound::To(
                id,
                ServerMessage::SessionJoined {
                    session_code: join.session_code,
                    session_id: join.session_id,
                    sensor_id: join.slot.clone(),
                    game_type: join.mode,
                    state: join.state,
                },
            ),
            Outbound::To(
                join.host,
                ServerMessage::SensorConnected {
                    sensor_id: join.slot,
                    sensor_count: join.sensor_count,
                    max_sensors: join.max_sensors,
                    is_ready: join.is_ready,
                    state: join.state,
                },
            ),
        ];
        if let Some(update) = room_update {
            outbound.push(Outbound::Many(
                update.members,
                ServerMessage::RoomUpdated { room: update.room },
            ));
        }
        Ok(outbound)
    }

    async fn leave_session(&self, id: ConnectionId) -> Result<Vec<Outbound>, BrokerError> {
        let departure = self.sessions.lock().await.disconnect_sensor(id)?;
        self.connections.write().await.set_session(id, None);

        let mut outbound = vec![Outbound::To(
            id,
            ServerMessage::SessionLeft {
                session_id: departure.session_id.clone(),
                sensor_id: departure.slot.clone(),
            },
        )];
        outbound.extend(self.sensor_departed(departure).await);
        Ok(outbound)
    }

    /// Host notification and room bookkeeping once a sensor slot is released
    async fn sensor_departed(&self, departure: SensorDeparture) -> Vec<Outbound> {
        self.hooks.sensor_left(&departure.session_id, &departure.slot);

        let room_update = match (&departure.room_id, departure.sensor_count) {
            (Some(_), 0) => self
                .rooms
                .lock()
                .await
                .disconnect_player_sensor(&departure.session_id),
            _ => None,
        };

        let mut outbound = vec![Outbound::To(
            departure.host,
            ServerMessage::SensorDisconnected {
                sensor_id: departure.slot,
                sensor_count: departure.sensor_count,
                max_sensors: departure.max_sensors,
                is_ready: departure.is_ready,
                state: departure.state,
            },
        )];
        if let Some(update) = room_update {
            outbound.push(Outbound::Many(
                update.members,
                ServerMessage::RoomUpdated { room: update.room },
            ));
        }
        outbound
    }

    async fn sensor_data(&self, id: ConnectionId, data: Value) -> Result<Vec<Outbound>, BrokerError> {
        if !data.is_object() {
            return Err(BrokerError::InvalidMessage(
                "data must be a JSON object".into(),
            ));
        }

        let frame = self
            .sessions
            .lock()
            .await
            .update_sensor_data(id, data.clone())?;
        self.hooks.sensor_data(&frame.session_id, &frame.slot, &data);

        Ok(vec![Outbound::To(
            frame.host,
            ServerMessage::SensorData {
                sensor_id: frame.slot,
                data,
                timestamp: frame.timestamp,
            },
        )])
    }

    async fn start_session(&self, id: ConnectionId) -> Result<Vec<Outbound>, BrokerError> {
        let transition = self.sessions.lock().await.start_game(id)?;
        self.hooks.game_started(&transition.session_id);

        Ok(vec![Outbound::Many(
            transition.members,
            ServerMessage::SessionStarted {
                session_id: transition.session_id,
            },
        )])
    }

    /// Room and connection bookkeeping for a session that no longer exists.
    /// The caller must not hold the session lock.
    async fn finish_closed_session(&self, closed: ClosedSession) -> Vec<Outbound> {
        let mut outbound = Vec::new();

        if closed.room_id.is_some() {
            let departure = self.rooms.lock().await.remove_player(&closed.session_id);
            if let Some(departure) = departure {
                outbound.extend(departure_outbound(departure));
            }
        }

        {
            let mut connections = self.connections.write().await;
            connections.set_room(closed.host, None);
            connections.set_session(closed.host, None);
            for sensor in &closed.sensors {
                connections.set_session(*sensor, None);
            }
        }
        self.hooks.session_ended(&closed.session_id, &closed.reason);

        let mut members = vec![closed.host];
        members.extend(closed.sensors);
        outbound.insert(
            0,
            Outbound::Many(
                members,
                ServerMessage::SessionEnded {
                    session_id: closed.session_id,
                    reason: closed.reason,
                },
            ),
        );
        outbound
    }

    async fn validate_session(
        &self,
        id: ConnectionId,
        code: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Vec<Outbound>, BrokerError> {
        let reply = match self.sessions.lock().await.validate(code, session_id) {
            Ok(session) => ServerMessage::SessionValidated {
                valid: true,
                session: Some(session),
                reason: None,
            },
            Err(BrokerError::InvalidMessage(message)) => {
                return Err(BrokerError::InvalidMessage(message))
            }
            Err(e) => ServerMessage::SessionValidated {
                valid: false,
                session: None,
                reason: Some(e.to_string()),
            },
        };
        Ok(vec![Outbound::To(id, reply)])
    }

    async fn sync_session(
        &self,
        id: ConnectionId,
        session_id: &str,
        client_state: Option<String>,
    ) -> Result<Vec<Outbound>, BrokerError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))?;

        let participant = if session.host == id {
            Some("host".to_string())
        } else {
            session.slot_for(id).map(|slot| slot.name.clone())
        };
        let snapshot = session.info();
        let in_sync = client_state.as_deref() == Some(snapshot.state.as_str());

        Ok(vec![Outbound::To(
            id,
            ServerMessage::SessionSynced {
                session: snapshot,
                in_sync,
                participant,
            },
        )])
    }

    async fn create_room(
        &self,
        id: ConnectionId,
        options: RoomOptions,
    ) -> Result<Vec<Outbound>, BrokerError> {
        let mut sessions = self.sessions.lock().await;
        self.ensure_connected(id).await?;
        let session = multiplayer_session_of(&sessions, id)?;
        if let Some(room_id) = &session.room_id {
            return Err(BrokerError::AlreadyInRoom(room_id.clone()));
        }
        let session_id = session.id.clone();
        let sensor_connected = session.sensor_count() > 0;

        let (room, player_id) =
            self.rooms
                .lock()
                .await
                .create_room(&session_id, id, sensor_connected, options)?;
        sessions.link_room(&session_id, &room.room_id)?;
        self.connections
            .write()
            .await
            .set_room(id, Some(room.room_id.clone()));
        drop(sessions);

        Ok(vec![Outbound::To(
            id,
            ServerMessage::RoomCreated { room, player_id },
        )])
    }

    async fn join_room(
        &self,
        id: ConnectionId,
        room_id: &str,
        nickname: Option<&str>,
    ) -> Result<Vec<Outbound>, BrokerError> {
        let mut sessions = self.sessions.lock().await;
        self.ensure_connected(id).await?;
        let session = multiplayer_session_of(&sessions, id)?;
        if let Some(existing) = &session.room_id {
            return Err(BrokerError::AlreadyInRoom(existing.clone()));
        }
        let session_id = session.id.clone();
        let sensor_connected = session.sensor_count() > 0;

        let join = self.rooms.lock().await.add_player(
            room_id,
            &session_id,
            id,
            nickname,
            sensor_connected,
        )?;
        sessions.link_room(&session_id, room_id)?;
        self.connections
            .write()
            .await
            .set_room(id, Some(room_id.to_string()));
        drop(sessions);

        Ok(vec![
            Outbound::To(
                id,
                ServerMessage::RoomJoined {
                    room: join.room.clone(),
                    player_id: join.player_id,
                },
            ),
            Outbound::Many(join.others, ServerMessage::RoomUpdated { room: join.room }),
        ])
    }

    async fn leave_room(&self, id: ConnectionId) -> Result<Vec<Outbound>, BrokerError> {
        let mut sessions = self.sessions.lock().await;
        let session_id = session_of(&sessions, id)?.id.clone();
        let departure = self
            .rooms
            .lock()
            .await
            .remove_player(&session_id)
            .ok_or_else(|| BrokerError::PlayerNotFound(session_id.clone()))?;
        sessions.unlink_room(&session_id);
        drop(sessions);

        self.connections.write().await.set_room(id, None);

        let mut outbound = vec![Outbound::To(
            id,
            ServerMessage::RoomLeft {
                room_id: departure.room_id.clone(),
            },
        )];
        outbound.extend(departure_outbound(departure));
        Ok(outbound)
    }

    async fn start_room(&self, id: ConnectionId) -> Result<Vec<Outbound>, BrokerError> {
        let start = {
            let sessions = self.sessions.lock().await;
            let session_id = session_of(&sessions, id)?.id.clone();
            self.rooms.lock().await.start_game(&session_id)?
        };

        let mut outbound = vec![Outbound::Many(
            start.members,
            ServerMessage::RoomStarting {
                room_id: start.room_id.clone(),
                starts_in_ms: start.starts_in.as_millis() as u64,
            },
        )];

        if start.starts_in.is_zero() {
            outbound.extend(
                self.complete_room_start(&start.room_id, start.started_at)
                    .await,
            );
        } else {
            let router = self.clone();
            let delay = start.starts_in;
            let room_id = start.room_id;
            let started_at = start.started_at;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let outbound = router.complete_room_start(&room_id, started_at).await;
                router.deliver(outbound).await;
            });
        }
        Ok(outbound)
    }

    async fn complete_room_start(&self, room_id: &str, started_at: Instant) -> Vec<Outbound> {
        let update = self.rooms.lock().await.complete_start(room_id, started_at);
        match update {
            Some(update) => {
                self.hooks.game_started(room_id);
                vec![Outbound::Many(
                    update.members,
                    ServerMessage::RoomStarted { room: update.room },
                )]
            }
            None => Vec::new(),
        }
    }

    /// The one place a connection is torn down
    ///
    /// Used for transport close, liveness timeout, quota eviction, admin
    /// kick and shutdown. Returns false when the connection was already gone.
    pub async fn handle_disconnect(&self, id: ConnectionId, reason: DisconnectReason) -> bool {
        // Removal and session cleanup share one session lock
        let outcome = {
            let mut sessions = self.sessions.lock().await;
            let removed = self.connections.write().await.remove(id);
            let connection = match removed {
                Some(connection) => connection,
                None => return false,
            };
            info!(
                "Connection {} ({}) disconnected: {}",
                id, connection.role, reason
            );
            sessions.handle_disconnection(id)
        };

        let outbound = match outcome {
            Some(DisconnectOutcome::SensorLeft(departure)) => self.sensor_departed(departure).await,
            Some(DisconnectOutcome::SessionClosed(closed)) => {
                self.finish_closed_session(closed).await
            }
            None => Vec::new(),
        };
        self.deliver(outbound).await;
        true
    }

    /// Pings everyone and evicts connections that missed two probes
    pub async fn heartbeat(&self) -> Vec<ConnectionId> {
        let stale = self
            .connections
            .write()
            .await
            .probe_liveness(self.config.ping_interval);

        for id in &stale {
            warn!("Connection {} missed its pong deadline", id);
            self.handle_disconnect(*id, DisconnectReason::Timeout).await;
        }
        stale
    }

    /// Ends idle sessions and drops inactive room players.
    /// Returns how many of each were collected.
    pub async fn cleanup(&self) -> (usize, usize) {
        let expired = self.sessions.lock().await.cleanup_expired();
        let expired_count = expired.len();

        let mut outbound = Vec::new();
        for closed in expired {
            debug!("Session {} expired", closed.session_id);
            outbound.extend(self.finish_closed_session(closed).await);
        }

        let departures = {
            let mut rooms = self.rooms.lock().await;
            let timeout = rooms.player_timeout();
            rooms.cleanup_inactive(timeout)
        };
        let departed_count = departures.len();

        if !departures.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for departure in &departures {
                sessions.unlink_room(&departure.session_id);
            }
        }
        if !departures.is_empty() {
            let mut connections = self.connections.write().await;
            for departure in &departures {
                connections.set_room(departure.connection_id, None);
            }
        }
        for departure in departures {
            outbound.push(Outbound::To(
                departure.connection_id,
                ServerMessage::RoomLeft {
                    room_id: departure.room_id.clone(),
                },
            ));
            outbound.extend(departure_outbound(departure));
        }

        self.deliver(outbound).await;
        if expired_count > 0 || departed_count > 0 {
            info!(
                "Cleanup collected {} sessions and {} room players",
                expired_count, departed_count
            );
        }
        (expired_count, departed_count)
    }

    /// Tells everyone the server is going away, then disconnects them all
    pub async fn shutdown(&self, reason: &str) {
        let ids = self.connections.read().await.ids();
        info!("Shutting down {} connections: {}", ids.len(), reason);

        self.deliver(vec![Outbound::Many(
            ids.clone(),
            ServerMessage::Shutdown {
                reason: reason.to_string(),
            },
        )])
        .await;

        for id in ids {
            self.handle_disconnect(id, DisconnectReason::ServerShutdown)
                .await;
        }
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let (active_sessions, playing_sessions) = {
            let sessions = self.sessions.lock().await;
            (sessions.len(), sessions.count_in_state(SessionState::Playing))
        };
        let (active_rooms, players_in_rooms) = {
            let rooms = self.rooms.lock().await;
            (rooms.len(), rooms.player_count())
        };
        let stats = self.connections.read().await.stats();

        self.metrics.snapshot(
            &stats,
            TableCounts {
                active_sessions,
                playing_sessions,
                active_rooms,
                players_in_rooms,
            },
        )
    }

    /// Delivery happens with only the connection table locked
    async fn deliver(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }

        let mut connections = self.connections.write().await;
        for item in outbound {
            match item {
                Outbound::To(id, message) => {
                    if let Err(e) = connections.send(id, &message) {
                        debug!("Dropped {} for connection {}: {}", message.message_type(), id, e);
                    }
                }
                Outbound::Many(ids, message) => {
                    let report = connections.broadcast(&ids, &message);
                    if !report.all_delivered() {
                        debug!(
                            "{} reached {} of {} connections",
                            message.message_type(),
                            report.delivered.len(),
                            ids.len()
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use serde_json::json;
    use shared::{ErrorCode, RoomState};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    struct TestPeer {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    impl TestPeer {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Message::Text(text) = frame {
                    messages.push(ServerMessage::from_json(&text).unwrap());
                }
            }
            messages
        }

        fn types(&mut self) -> Vec<&'static str> {
            self.drain().iter().map(|m| m.message_type()).collect()
        }

        fn expect_error(&mut self, code: ErrorCode) {
            match self.drain().pop() {
                Some(ServerMessage::Error { error }) => assert_eq!(error.code, code),
                other => panic!("Expected {:?} error, got {:?}", code, other),
            }
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            rooms: RoomConfig {
                start_delay: Duration::ZERO,
                ..RoomConfig::default()
            },
            admin_token: Some("secret".to_string()),
            ..ServerConfig::default()
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::new(test_config(), Hooks::new())
    }

    async fn connect(router: &MessageRouter) -> TestPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let metadata = ConnectionMetadata {
            addr: "127.0.0.1:40000".parse().unwrap(),
        };
        let id = router.register(tx, metadata).await.unwrap();
        let mut peer = TestPeer { id, rx };
        assert_eq!(peer.types(), vec!["connection:established"]);
        peer
    }

    async fn send(router: &MessageRouter, peer: &TestPeer, value: Value) {
        router.handle_message(peer.id, &value.to_string()).await;
    }

    async fn identified(router: &MessageRouter, role: &str) -> TestPeer {
        let mut peer = connect(router).await;
        send(router, &peer, json!({"type": "client:identify", "clientType": role})).await;
        assert_eq!(peer.types(), vec!["client:identified"]);
        peer
    }

    async fn hosted_session(router: &MessageRouter, mode: &str) -> (TestPeer, String, String) {
        let mut display = identified(router, "display").await;
        send(router, &display, json!({"type": "session:create", "gameType": mode})).await;
        match display.drain().pop() {
            Some(ServerMessage::SessionCreated {
                session_code,
                session_id,
                ..
            }) => (display, session_code, session_id),
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_table() {
        assert_eq!(required_access("ping"), Some(Access::Open));
        assert_eq!(
            required_access("room:create"),
            Some(Access::Role(ClientRole::Display))
        );
        assert_eq!(
            required_access("sensor:data"),
            Some(Access::Role(ClientRole::Sensor))
        );
        assert_eq!(required_access("bogus:type"), None);
    }

    #[test]
    fn test_authorize_roles() {
        let display = Access::Role(ClientRole::Display);
        assert!(authorize(ClientRole::Unknown, Access::Open, "ping").is_ok());
        assert!(authorize(ClientRole::Display, display, "room:create").is_ok());
        assert_eq!(
            authorize(ClientRole::Unknown, display, "room:create").unwrap_err(),
            BrokerError::NotIdentified("room:create".into())
        );
        assert!(matches!(
            authorize(ClientRole::Sensor, display, "room:create"),
            Err(BrokerError::Unauthorized { .. })
        ));
    }

    #[test]
    fn test_validate_envelope() {
        let envelope = validate_envelope(r#"{"type":"ping","timestamp":3}"#, 1024).unwrap();
        assert_eq!(envelope.message_type, "ping");
        assert_eq!(envelope.value["timestamp"], 3);
        assert!(matches!(
            validate_envelope("not json", 1024),
            Err(BrokerError::InvalidMessage(_))
        ));
        assert!(matches!(
            validate_envelope("[1,2]", 1024),
            Err(BrokerError::InvalidMessage(_))
        ));
        assert!(matches!(
            validate_envelope(r#"{"type":""}"#, 1024),
            Err(BrokerError::InvalidMessage(_))
        ));
        assert!(matches!(
            validate_envelope(r#"{"type":42}"#, 1024),
            Err(BrokerError::InvalidMessage(_))
        ));
        let long = format!(r#"{{"type":"{}"}}"#, "x".repeat(65));
        assert!(matches!(
            validate_envelope(&long, 1024),
            Err(BrokerError::InvalidMessage(_))
        ));
        assert!(matches!(
            validate_envelope(r#"{"type":"ping"}"#, 4),
            Err(BrokerError::MessageTooLarge { size: 15, limit: 4 })
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_and_unidentified_access() {
        let router = router();
        let mut peer = connect(&router).await;

        send(&router, &peer, json!({"type": "teleport"})).await;
        peer.expect_error(ErrorCode::UnknownMessageType);

        send(&router, &peer, json!({"type": "session:create", "gameType": "solo"})).await;
        peer.expect_error(ErrorCode::NotIdentified);

        send(&router, &peer, json!({"type": "ping", "timestamp": 5})).await;
        match peer.drain().pop() {
            Some(ServerMessage::Pong { timestamp, .. }) => assert_eq!(timestamp, 5),
            other => panic!("Unexpected reply: {:?}", other),
        }

        let stats = router.connections.read().await.stats();
        assert_eq!(stats.errors, 2);
    }

    #[tokio::test]
    async fn test_role_is_set_once() {
        let router = router();
        let mut peer = identified(&router, "display").await;

        send(&router, &peer, json!({"type": "client:identify", "clientType": "display"})).await;
        assert_eq!(peer.types(), vec!["client:identified"]);

        send(&router, &peer, json!({"type": "client:identify", "clientType": "sensor"})).await;
        peer.expect_error(ErrorCode::RoleAlreadySet);
    }

    #[tokio::test]
    async fn test_sensor_cannot_manage_rooms() {
        let router = router();
        let mut sensor = identified(&router, "sensor").await;

        send(&router, &sensor, json!({"type": "room:create"})).await;
        sensor.expect_error(ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_admin_requires_token() {
        let router = router();
        let mut peer = connect(&router).await;

        send(
            &router,
            &peer,
            json!({"type": "client:identify", "clientType": "admin", "adminToken": "wrong"}),
        )
        .await;
        peer.expect_error(ErrorCode::Unauthorized);

        send(
            &router,
            &peer,
            json!({"type": "client:identify", "clientType": "admin", "adminToken": "secret"}),
        )
        .await;
        assert_eq!(peer.types(), vec!["client:identified"]);

        send(&router, &peer, json!({"type": "admin:stats"})).await;
        match peer.drain().pop() {
            Some(ServerMessage::Stats { metrics }) => {
                assert_eq!(metrics.connections, 1);
                assert_eq!(metrics.admins, 1);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dual_session_flow() {
        let router = router();
        let (mut display, code, session_id) = hosted_session(&router, "dual").await;
        let mut left = identified(&router, "sensor").await;
        let mut right = identified(&router, "sensor").await;
        let mut third = identified(&router, "sensor").await;

        send(&router, &left, json!({"type": "session:join", "sessionCode": code})).await;
        match left.drain().pop() {
            Some(ServerMessage::SessionJoined { sensor_id, .. }) => assert_eq!(sensor_id, "left"),
            other => panic!("Unexpected reply: {:?}", other),
        }
        match display.drain().pop() {
            Some(ServerMessage::SensorConnected {
                sensor_id,
                sensor_count,
                is_ready,
                ..
            }) => {
                assert_eq!(sensor_id, "left");
                assert_eq!(sensor_count, 1);
                assert!(!is_ready);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }

        send(&router, &right, json!({"type": "session:join", "sessionCode": code})).await;
        right.drain();
        match display.drain().pop() {
            Some(ServerMessage::SensorConnected {
                sensor_id, state, ..
            }) => {
                assert_eq!(sensor_id, "right");
                assert_eq!(state, SessionState::GameReady);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }

        send(&router, &third, json!({"type": "session:join", "sessionCode": code})).await;
        third.expect_error(ErrorCode::SessionFull);
        assert!(display.drain().is_empty());

        send(
            &router,
            &left,
            json!({"type": "sensor:data", "data": {"orientation": {"beta": 12.5}}}),
        )
        .await;
        match display.drain().pop() {
            Some(ServerMessage::SensorData { sensor_id, data, .. }) => {
                assert_eq!(sensor_id, "left");
                assert_eq!(data["orientation"]["beta"], 12.5);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }

        send(&router, &display, json!({"type": "session:start"})).await;
        assert_eq!(display.types(), vec!["session:started"]);
        assert_eq!(left.types(), vec!["session:started"]);
        assert_eq!(right.types(), vec!["session:started"]);

        send(&router, &display, json!({"type": "session:end", "reason": "done"})).await;
        match left.drain().pop() {
            Some(ServerMessage::SessionEnded {
                session_id: ended,
                reason,
            }) => {
                assert_eq!(ended, session_id);
                assert_eq!(reason, "done");
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
        assert_eq!(router.metrics().sessions_ended(), 1);
        assert_eq!(router.metrics().games_started(), 1);
        assert_eq!(router.metrics().sensor_frames(), 1);
    }

    #[tokio::test]
    async fn test_start_before_ready_is_state_conflict() {
        let router = router();
        let (mut display, _code, _) = hosted_session(&router, "dual").await;

        send(&router, &display, json!({"type": "session:start"})).await;
        display.expect_error(ErrorCode::InvalidState);
    }

    #[tokio::test]
    async fn test_host_disconnect_notifies_sensors_once() {
        let router = router();
        let (display, code, session_id) = hosted_session(&router, "solo").await;
        let mut sensor = identified(&router, "sensor").await;
        send(&router, &sensor, json!({"type": "session:join", "sessionCode": code})).await;
        sensor.drain();

        assert!(router.handle_disconnect(display.id, DisconnectReason::ClientClosed).await);
        assert!(!router.handle_disconnect(display.id, DisconnectReason::ClientClosed).await);

        let messages = sensor.drain();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::SessionEnded {
                session_id: ended,
                reason,
            } => {
                assert_eq!(ended, &session_id);
                assert_eq!(reason, "host_disconnected");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(router.sessions.lock().await.is_empty());

        send(&router, &sensor, json!({"type": "session:join", "sessionCode": code})).await;
        sensor.expect_error(ErrorCode::SessionNotFound);
    }

    #[tokio::test]
    async fn test_sensor_disconnect_notifies_host() {
        let router = router();
        let (mut display, code, _) = hosted_session(&router, "dual").await;
        let mut sensor = identified(&router, "sensor").await;
        send(&router, &sensor, json!({"type": "session:join", "sessionCode": code})).await;
        sensor.drain();
        display.drain();

        router
            .handle_disconnect(sensor.id, DisconnectReason::Timeout)
            .await;
        match display.drain().pop() {
            Some(ServerMessage::SensorDisconnected {
                sensor_id,
                sensor_count,
                state,
                ..
            }) => {
                assert_eq!(sensor_id, "left");
                assert_eq!(sensor_count, 0);
                assert_eq!(state, SessionState::WaitingSensors);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validate_and_sync() {
        let router = router();
        let (mut display, code, session_id) = hosted_session(&router, "solo").await;

        send(&router, &display, json!({"type": "session:validate", "sessionCode": code})).await;
        match display.drain().pop() {
            Some(ServerMessage::SessionValidated { valid, session, .. }) => {
                assert!(valid);
                assert_eq!(session.unwrap().session_id, session_id);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }

        send(&router, &display, json!({"type": "session:validate", "sessionCode": "0"})).await;
        match display.drain().pop() {
            Some(ServerMessage::SessionValidated { valid, reason, .. }) => {
                assert!(!valid);
                assert!(reason.is_some());
            }
            other => panic!("Unexpected reply: {:?}", other),
        }

        send(
            &router,
            &display,
            json!({"type": "session:sync", "sessionId": session_id, "clientState": "CREATED"}),
        )
        .await;
        match display.drain().pop() {
            Some(ServerMessage::SessionSynced {
                in_sync,
                participant,
                ..
            }) => {
                assert!(in_sync);
                assert_eq!(participant.as_deref(), Some("host"));
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rate_limit_then_eviction() {
        let config = ServerConfig {
            rate_limit_max_messages: 2,
            rate_limit_window: Duration::from_secs(60),
            ..test_config()
        };
        let router = MessageRouter::new(config, Hooks::new());
        let mut peer = connect(&router).await;

        for _ in 0..2 {
            send(&router, &peer, json!({"type": "ping", "timestamp": 1})).await;
        }
        assert_eq!(peer.types(), vec!["pong", "pong"]);

        send(&router, &peer, json!({"type": "ping", "timestamp": 1})).await;
        peer.expect_error(ErrorCode::RateLimited);

        send(&router, &peer, json!({"type": "ping", "timestamp": 1})).await;
        send(&router, &peer, json!({"type": "ping", "timestamp": 1})).await;
        assert_eq!(router.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let router = router();
        let (mut host, host_code, _) = hosted_session(&router, "multiplayer").await;
        let (mut guest, guest_code, _) = hosted_session(&router, "multiplayer").await;
        let mut host_sensor = identified(&router, "sensor").await;
        let mut guest_sensor = identified(&router, "sensor").await;

        send(&router, &host, json!({"type": "room:create", "gameId": "race", "maxPlayers": 4})).await;
        let room_id = match host.drain().pop() {
            Some(ServerMessage::RoomCreated { room, .. }) => {
                assert_eq!(room.game_id, "race");
                room.room_id
            }
            other => panic!("Unexpected reply: {:?}", other),
        };

        send(&router, &guest, json!({"type": "room:join", "roomId": room_id, "nickname": "Gus"})).await;
        assert_eq!(guest.types(), vec!["room:joined"]);
        assert_eq!(host.types(), vec!["room:updated"]);

        send(&router, &guest, json!({"type": "room:ready", "ready": true})).await;
        guest.expect_error(ErrorCode::InvalidState);

        send(&router, &host_sensor, json!({"type": "session:join", "sessionCode": host_code})).await;
        send(&router, &guest_sensor, json!({"type": "session:join", "sessionCode": guest_code})).await;
        host.drain();
        guest.drain();

        send(&router, &host, json!({"type": "room:ready", "ready": true})).await;
        send(&router, &guest, json!({"type": "room:ready", "ready": true})).await;
        match host.drain().pop() {
            Some(ServerMessage::RoomUpdated { room }) => assert_eq!(room.state, RoomState::Ready),
            other => panic!("Unexpected reply: {:?}", other),
        }
        guest.drain();

        send(&router, &guest, json!({"type": "room:start"})).await;
        guest.expect_error(ErrorCode::NotRoomHost);

        send(&router, &host, json!({"type": "room:start"})).await;
        assert_eq!(host.types(), vec!["room:starting", "room:started"]);
        assert_eq!(guest.types(), vec!["room:starting", "room:started"]);

        send(&router, &guest, json!({"type": "game:update", "score": 7})).await;
        assert!(guest.drain().is_empty());
        match host.drain().pop() {
            Some(ServerMessage::GameUpdate { score, .. }) => assert_eq!(score, 7),
            other => panic!("Unexpected reply: {:?}", other),
        }

        router
            .handle_disconnect(guest.id, DisconnectReason::ClientClosed)
            .await;
        let types = host.types();
        assert!(types.contains(&"room:ended"));
        assert!(types.contains(&"room:updated"));

        let rooms = router.rooms.lock().await;
        let room = rooms.get(&room_id).unwrap();
        assert_eq!(room.players.len(), 1);
        assert_eq!(room.state, RoomState::Waiting);
    }

    #[tokio::test]
    async fn test_room_requires_multiplayer_session() {
        let router = router();
        let (mut display, _, _) = hosted_session(&router, "solo").await;

        send(&router, &display, json!({"type": "room:create"})).await;
        display.expect_error(ErrorCode::InvalidState);
        assert!(router.rooms.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_evicted_connection_cannot_open_sessions() {
        let router = router();
        let display = identified(&router, "display").await;
        let sensor = identified(&router, "sensor").await;
        let (_host, code, _) = hosted_session(&router, "dual").await;

        assert!(router.handle_disconnect(display.id, DisconnectReason::Timeout).await);
        assert!(router.handle_disconnect(sensor.id, DisconnectReason::Timeout).await);

        assert_eq!(
            router.create_session(display.id, GameMode::Dual).await.unwrap_err(),
            BrokerError::ConnectionNotFound(display.id)
        );
        assert_eq!(
            router.join_session(sensor.id, &code, None).await.unwrap_err(),
            BrokerError::ConnectionNotFound(sensor.id)
        );

        let sessions = router.sessions.lock().await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions.hosted_session(display.id).is_none());
        assert_eq!(sessions.get_by_code(&code).unwrap().sensor_count(), 0);
    }

    /// Two multiplayer displays with sensors, both ready, sharing one room
    async fn ready_room(
        router: &MessageRouter,
    ) -> (TestPeer, TestPeer, TestPeer, TestPeer, String) {
        let (mut host, host_code, _) = hosted_session(router, "multiplayer").await;
        let (mut guest, guest_code, _) = hosted_session(router, "multiplayer").await;
        let mut host_sensor = identified(router, "sensor").await;
        let mut guest_sensor = identified(router, "sensor").await;
        send(router, &host_sensor, json!({"type": "session:join", "sessionCode": host_code})).await;
        send(router, &guest_sensor, json!({"type": "session:join", "sessionCode": guest_code})).await;

        send(router, &host, json!({"type": "room:create", "gameId": "race"})).await;
        let room_id = match host.drain().pop() {
            Some(ServerMessage::RoomCreated { room, .. }) => room.room_id,
            other => panic!("Unexpected reply: {:?}", other),
        };
        send(router, &guest, json!({"type": "room:join", "roomId": room_id})).await;
        send(router, &host, json!({"type": "room:ready", "ready": true})).await;
        send(router, &guest, json!({"type": "room:ready", "ready": true})).await;

        host.drain();
        guest.drain();
        host_sensor.drain();
        guest_sensor.drain();
        (host, guest, host_sensor, guest_sensor, room_id)
    }

    fn delayed_start_router(delay: Duration) -> MessageRouter {
        let config = ServerConfig {
            rooms: RoomConfig {
                start_delay: delay,
                ..RoomConfig::default()
            },
            ..test_config()
        };
        MessageRouter::new(config, Hooks::new())
    }

    #[tokio::test]
    async fn test_room_start_waits_for_countdown() {
        let router = delayed_start_router(Duration::from_millis(50));
        let (mut host, mut guest, _hs, _gs, room_id) = ready_room(&router).await;

        send(&router, &host, json!({"type": "room:start"})).await;
        match host.drain().as_slice() {
            [ServerMessage::RoomStarting { starts_in_ms, .. }] => assert_eq!(*starts_in_ms, 50),
            other => panic!("Unexpected messages: {:?}", other),
        }
        assert_eq!(guest.types(), vec!["room:starting"]);
        assert_eq!(
            router.rooms.lock().await.get(&room_id).unwrap().state,
            RoomState::Starting
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        match host.drain().as_slice() {
            [ServerMessage::RoomStarted { room }] => assert_eq!(room.state, RoomState::Playing),
            other => panic!("Unexpected messages: {:?}", other),
        }
        assert_eq!(guest.types(), vec!["room:started"]);
    }

    #[tokio::test]
    async fn test_sensor_leaving_during_countdown_cancels_start() {
        let router = delayed_start_router(Duration::from_millis(50));
        let (mut host, mut guest, _hs, guest_sensor, room_id) = ready_room(&router).await;

        send(&router, &host, json!({"type": "room:start"})).await;
        assert_eq!(host.types(), vec!["room:starting"]);

        send(&router, &guest_sensor, json!({"type": "session:leave"})).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let host_types = host.types();
        assert!(host_types.contains(&"room:updated"));
        assert!(!host_types.contains(&"room:started"));
        assert!(!guest.types().contains(&"room:started"));
        assert_eq!(
            router.rooms.lock().await.get(&room_id).unwrap().state,
            RoomState::Waiting
        );
    }

    #[tokio::test]
    async fn test_retried_start_keeps_its_own_countdown() {
        let router = delayed_start_router(Duration::from_millis(200));
        let (mut host, mut guest, _hs, mut guest_sensor, room_id) = ready_room(&router).await;
        let guest_code = {
            let sessions = router.sessions.lock().await;
            sessions.hosted_session(guest.id).unwrap().code.clone()
        };

        send(&router, &host, json!({"type": "room:start"})).await;
        send(&router, &guest_sensor, json!({"type": "session:leave"})).await;
        send(&router, &guest_sensor, json!({"type": "session:join", "sessionCode": guest_code})).await;
        send(&router, &guest, json!({"type": "room:ready", "ready": true})).await;
        guest_sensor.drain();

        tokio::time::sleep(Duration::from_millis(100)).await;
        send(&router, &host, json!({"type": "room:start"})).await;
        host.drain();
        guest.drain();

        // The first countdown would have finished by now
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!host.types().contains(&"room:started"));
        assert_eq!(
            router.rooms.lock().await.get(&room_id).unwrap().state,
            RoomState::Starting
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(host.types(), vec!["room:started"]);
        assert_eq!(
            router.rooms.lock().await.get(&room_id).unwrap().state,
            RoomState::Playing
        );
    }

    #[tokio::test]
    async fn test_admin_disconnect_and_shutdown() {
        let router = router();
        let mut admin = connect(&router).await;
        send(
            &router,
            &admin,
            json!({"type": "client:identify", "clientType": "admin", "adminToken": "secret"}),
        )
        .await;
        admin.drain();
        let victim = connect(&router).await;

        send(&router, &admin, json!({"type": "admin:disconnect", "connectionId": victim.id})).await;
        assert_eq!(admin.types(), vec!["server:stats"]);
        assert_eq!(router.connection_count().await, 1);

        send(&router, &admin, json!({"type": "admin:disconnect", "connectionId": 999})).await;
        admin.expect_error(ErrorCode::ConnectionNotFound);

        router.shutdown("maintenance").await;
        assert_eq!(router.connection_count().await, 0);
        let frames: Vec<Message> = std::iter::from_fn(|| admin.rx.try_recv().ok()).collect();
        assert!(matches!(frames.first(), Some(Message::Text(text)) if text.contains("server:shutdown")));
        assert_eq!(frames.last(), Some(&Message::Close(None)));
    }

    #[tokio::test]
    async fn test_heartbeat_evicts_silent_connections() {
        let config = ServerConfig {
            ping_interval: Duration::from_millis(10),
            ..test_config()
        };
        let router = MessageRouter::new(config, Hooks::new());
        let mut peer = connect(&router).await;

        assert!(router.heartbeat().await.is_empty());
        assert_eq!(peer.types(), vec!["ping"]);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(router.heartbeat().await, vec![peer.id]);
        assert_eq!(router.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_pong_keeps_connection_alive() {
        let config = ServerConfig {
            ping_interval: Duration::from_millis(10),
            ..test_config()
        };
        let router = MessageRouter::new(config, Hooks::new());
        let mut peer = connect(&router).await;

        router.heartbeat().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        send(&router, &peer, json!({"type": "pong", "timestamp": 1})).await;
        assert!(router.heartbeat().await.is_empty());
        assert_eq!(peer.types(), vec!["ping", "ping"]);

        let latency = router.connections.read().await.get(peer.id).unwrap().latency_ms;
        assert!(latency.unwrap() >= 30);
    }
}
