//! Wire protocol shared by the hub server and its clients.
//!
//! Every frame is a UTF-8 JSON object with a mandatory `type` field. Inbound
//! frames decode into [`ClientMessage`], outbound frames are produced from
//! [`ServerMessage`]. Both enums use the `type` field as the serde tag, so the
//! variant names below map one-to-one onto the protocol's message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const PROTOCOL_VERSION: &str = "1.0";

/// Upper bound on the length of a message `type` string.
pub const MAX_TYPE_LENGTH: usize = 64;

/// Upper bound on sensors in a multiplayer session.
pub const MAX_MULTIPLAYER_SENSORS: usize = 10;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Role a connection declares with `client:identify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Display,
    Sensor,
    Admin,
    Unknown,
}

impl ClientRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Display => "display",
            ClientRole::Sensor => "sensor",
            ClientRole::Admin => "admin",
            ClientRole::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Game mode of a session. Determines how many sensors may attach and how
/// default slot names are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Solo,
    Dual,
    Multiplayer,
}

impl GameMode {
    pub fn max_sensors(&self) -> usize {
        match self {
            GameMode::Solo => 1,
            GameMode::Dual => 2,
            GameMode::Multiplayer => MAX_MULTIPLAYER_SENSORS,
        }
    }

    /// Solo and dual sessions become `GAME_READY` as soon as every slot is
    /// filled. Multiplayer sessions wait for their room to start.
    pub fn auto_ready(&self) -> bool {
        !matches!(self, GameMode::Multiplayer)
    }

    /// Slot names in the order they are handed out.
    pub fn slot_names(&self) -> Vec<String> {
        match self {
            GameMode::Solo => vec!["main".to_string()],
            GameMode::Dual => vec!["left".to_string(), "right".to_string()],
            GameMode::Multiplayer => (1..=MAX_MULTIPLAYER_SENSORS)
                .map(|n| format!("player_{}", n))
                .collect(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GameMode::Solo => "solo",
            GameMode::Dual => "dual",
            GameMode::Multiplayer => "multiplayer",
        }
    }
}

impl fmt::Display for GameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    WaitingSensors,
    SensorsConnected,
    GameReady,
    Playing,
    Paused,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::WaitingSensors => "WAITING_SENSORS",
            SessionState::SensorsConnected => "SENSORS_CONNECTED",
            SessionState::GameReady => "GAME_READY",
            SessionState::Playing => "PLAYING",
            SessionState::Paused => "PAUSED",
            SessionState::Ended => "ENDED",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Waiting,
    Ready,
    Starting,
    Playing,
    Paused,
    Finished,
}

impl RoomState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomState::Waiting => "WAITING",
            RoomState::Ready => "READY",
            RoomState::Starting => "STARTING",
            RoomState::Playing => "PLAYING",
            RoomState::Paused => "PAUSED",
            RoomState::Finished => "FINISHED",
        }
    }

    /// Rooms accept new players only while in the lobby.
    pub fn is_lobby(&self) -> bool {
        matches!(self, RoomState::Waiting | RoomState::Ready)
    }
}

impl fmt::Display for RoomState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    WaitingSensor,
    Connected,
    Ready,
    Playing,
}

/// Broad failure class carried by every `error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Authorization,
    NotFound,
    Capacity,
    StateConflict,
    RateLimit,
    Internal,
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    UnknownMessageType,
    MessageTooLarge,
    NotIdentified,
    Unauthorized,
    NotRoomHost,
    ConnectionNotFound,
    ConnectionClosed,
    SessionNotFound,
    RoomNotFound,
    PlayerNotFound,
    ServerFull,
    SessionLimit,
    RoomLimit,
    SessionFull,
    RoomFull,
    CodeSpaceExhausted,
    SlotTaken,
    RoleAlreadySet,
    AlreadyInSession,
    AlreadyInRoom,
    InvalidState,
    RateLimited,
    InternalError,
}

impl ErrorCode {
    pub fn category(&self) -> ErrorCategory {
        use ErrorCode::*;
        match self {
            InvalidMessage | UnknownMessageType | MessageTooLarge => ErrorCategory::Validation,
            NotIdentified | Unauthorized | NotRoomHost => ErrorCategory::Authorization,
            ConnectionNotFound | ConnectionClosed | SessionNotFound | RoomNotFound
            | PlayerNotFound => ErrorCategory::NotFound,
            ServerFull | SessionLimit | RoomLimit | SessionFull | RoomFull
            | CodeSpaceExhausted => ErrorCategory::Capacity,
            SlotTaken | RoleAlreadySet | AlreadyInSession | AlreadyInRoom | InvalidState => {
                ErrorCategory::StateConflict
            }
            RateLimited => ErrorCategory::RateLimit,
            InternalError => ErrorCategory::Internal,
        }
    }
}

/// Body of an `error` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            message: message.into(),
        }
    }
}

/// Snapshot of a session as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub session_code: String,
    pub game_type: GameMode,
    pub state: SessionState,
    pub sensor_count: usize,
    pub max_sensors: usize,
    pub sensors: Vec<String>,
    pub room_id: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub player_id: String,
    pub session_id: String,
    pub nickname: String,
    pub is_host: bool,
    pub is_ready: bool,
    pub sensor_connected: bool,
    pub status: PlayerStatus,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub room_id: String,
    pub game_id: String,
    pub host_session_id: String,
    pub state: RoomState,
    pub max_players: usize,
    pub is_private: bool,
    pub players: Vec<PlayerInfo>,
    pub created_at: u64,
}

/// Short listing entry returned by `room:list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub game_id: String,
    pub state: RoomState,
    pub player_count: usize,
    pub max_players: usize,
}

/// Aggregated server health figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: usize,
    pub displays: usize,
    pub sensors: usize,
    pub admins: usize,
    pub unidentified: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub average_latency_ms: f64,
    pub active_sessions: usize,
    pub playing_sessions: usize,
    pub active_rooms: usize,
    pub players_in_rooms: usize,
    pub sessions_created: u64,
    pub sessions_ended: u64,
    pub games_started: u64,
    pub sensor_frames: u64,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "client:identify", rename_all = "camelCase")]
    Identify {
        client_type: ClientRole,
        #[serde(default)]
        user_agent: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        admin_token: Option<String>,
    },
    #[serde(rename = "session:create", rename_all = "camelCase")]
    CreateSession { game_type: GameMode },
    #[serde(rename = "session:join", rename_all = "camelCase")]
    JoinSession {
        session_code: String,
        #[serde(default)]
        sensor_id: Option<String>,
    },
    #[serde(rename = "session:leave")]
    LeaveSession,
    #[serde(rename = "sensor:data")]
    SensorData { data: Value },
    #[serde(rename = "session:start")]
    StartSession,
    #[serde(rename = "session:pause")]
    PauseSession,
    #[serde(rename = "session:resume")]
    ResumeSession,
    #[serde(rename = "session:end")]
    EndSession {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "session:close")]
    CloseSession {
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "session:validate", rename_all = "camelCase")]
    ValidateSession {
        #[serde(default)]
        session_code: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "session:sync", rename_all = "camelCase")]
    SyncSession {
        session_id: String,
        #[serde(default)]
        client_state: Option<String>,
    },
    #[serde(rename = "room:create", rename_all = "camelCase")]
    CreateRoom {
        #[serde(default)]
        game_id: Option<String>,
        #[serde(default)]
        max_players: Option<usize>,
        #[serde(default)]
        is_private: Option<bool>,
        #[serde(default)]
        nickname: Option<String>,
    },
    #[serde(rename = "room:join", rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        nickname: Option<String>,
    },
    #[serde(rename = "room:leave")]
    LeaveRoom,
    #[serde(rename = "room:ready")]
    SetReady { ready: bool },
    #[serde(rename = "room:start")]
    StartRoom,
    #[serde(rename = "room:pause")]
    PauseRoom,
    #[serde(rename = "room:resume")]
    ResumeRoom,
    #[serde(rename = "room:end")]
    EndRoom,
    #[serde(rename = "room:list")]
    ListRooms,
    #[serde(rename = "game:update")]
    GameUpdate {
        #[serde(default)]
        score: Option<i64>,
        #[serde(default)]
        position: Option<Value>,
        #[serde(default)]
        data: Option<Value>,
    },
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        timestamp: u64,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: u64,
    },
    #[serde(rename = "admin:stats")]
    AdminStats,
    #[serde(rename = "admin:disconnect", rename_all = "camelCase")]
    AdminDisconnect {
        connection_id: u32,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ClientMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::Identify { .. } => "client:identify",
            ClientMessage::CreateSession { .. } => "session:create",
            ClientMessage::JoinSession { .. } => "session:join",
            ClientMessage::LeaveSession => "session:leave",
            ClientMessage::SensorData { .. } => "sensor:data",
            ClientMessage::StartSession => "session:start",
            ClientMessage::PauseSession => "session:pause",
            ClientMessage::ResumeSession => "session:resume",
            ClientMessage::EndSession { .. } => "session:end",
            ClientMessage::CloseSession { .. } => "session:close",
            ClientMessage::ValidateSession { .. } => "session:validate",
            ClientMessage::SyncSession { .. } => "session:sync",
            ClientMessage::CreateRoom { .. } => "room:create",
            ClientMessage::JoinRoom { .. } => "room:join",
            ClientMessage::LeaveRoom => "room:leave",
            ClientMessage::SetReady { .. } => "room:ready",
            ClientMessage::StartRoom => "room:start",
            ClientMessage::PauseRoom => "room:pause",
            ClientMessage::ResumeRoom => "room:resume",
            ClientMessage::EndRoom => "room:end",
            ClientMessage::ListRooms => "room:list",
            ClientMessage::GameUpdate { .. } => "game:update",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong { .. } => "pong",
            ClientMessage::AdminStats => "admin:stats",
            ClientMessage::AdminDisconnect { .. } => "admin:disconnect",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection:established", rename_all = "camelCase")]
    ConnectionEstablished {
        connection_id: u32,
        protocol_version: String,
        server_time: u64,
    },
    #[serde(rename = "client:identified", rename_all = "camelCase")]
    Identified {
        connection_id: u32,
        client_type: ClientRole,
        server_time: u64,
    },
    #[serde(rename = "session:created", rename_all = "camelCase")]
    SessionCreated {
        session_code: String,
        session_id: String,
        game_type: GameMode,
        max_sensors: usize,
    },
    #[serde(rename = "session:joined", rename_all = "camelCase")]
    SessionJoined {
        session_code: String,
        session_id: String,
        sensor_id: String,
        game_type: GameMode,
        state: SessionState,
    },
    #[serde(rename = "session:left", rename_all = "camelCase")]
    SessionLeft { session_id: String, sensor_id: String },
    #[serde(rename = "sensor:connected", rename_all = "camelCase")]
    SensorConnected {
        sensor_id: String,
        sensor_count: usize,
        max_sensors: usize,
        is_ready: bool,
        state: SessionState,
    },
    #[serde(rename = "sensor:disconnected", rename_all = "camelCase")]
    SensorDisconnected {
        sensor_id: String,
        sensor_count: usize,
        max_sensors: usize,
        is_ready: bool,
        state: SessionState,
    },
    #[serde(rename = "sensor:data", rename_all = "camelCase")]
    SensorData {
        sensor_id: String,
        data: Value,
        timestamp: u64,
    },
    #[serde(rename = "session:started", rename_all = "camelCase")]
    SessionStarted { session_id: String },
    #[serde(rename = "session:paused", rename_all = "camelCase")]
    SessionPaused { session_id: String },
    #[serde(rename = "session:resumed", rename_all = "camelCase")]
    SessionResumed { session_id: String },
    #[serde(rename = "session:ended", rename_all = "camelCase")]
    SessionEnded { session_id: String, reason: String },
    #[serde(rename = "session:validated", rename_all = "camelCase")]
    SessionValidated {
        valid: bool,
        session: Option<SessionInfo>,
        reason: Option<String>,
    },
    #[serde(rename = "session:synced", rename_all = "camelCase")]
    SessionSynced {
        session: SessionInfo,
        in_sync: bool,
        participant: Option<String>,
    },
    #[serde(rename = "room:created", rename_all = "camelCase")]
    RoomCreated { room: RoomInfo, player_id: String },
    #[serde(rename = "room:joined", rename_all = "camelCase")]
    RoomJoined { room: RoomInfo, player_id: String },
    #[serde(rename = "room:left", rename_all = "camelCase")]
    RoomLeft { room_id: String },
    #[serde(rename = "room:updated")]
    RoomUpdated { room: RoomInfo },
    #[serde(rename = "room:starting", rename_all = "camelCase")]
    RoomStarting { room_id: String, starts_in_ms: u64 },
    #[serde(rename = "room:started", rename_all = "camelCase")]
    RoomStarted { room: RoomInfo },
    #[serde(rename = "room:paused", rename_all = "camelCase")]
    RoomPaused { room_id: String },
    #[serde(rename = "room:resumed", rename_all = "camelCase")]
    RoomResumed { room_id: String },
    #[serde(rename = "room:ended")]
    RoomEnded { room: RoomInfo },
    #[serde(rename = "room:list")]
    RoomList { rooms: Vec<RoomSummary> },
    #[serde(rename = "game:update", rename_all = "camelCase")]
    GameUpdate {
        player_id: String,
        score: i64,
        position: Option<Value>,
        data: Option<Value>,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
    #[serde(rename = "pong", rename_all = "camelCase")]
    Pong { timestamp: u64, server_time: u64 },
    #[serde(rename = "server:stats")]
    Stats { metrics: MetricsSnapshot },
    #[serde(rename = "server:shutdown")]
    Shutdown { reason: String },
    #[serde(rename = "error")]
    Error { error: WireError },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: WireError::new(code, message),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection:established",
            ServerMessage::Identified { .. } => "client:identified",
            ServerMessage::SessionCreated { .. } => "session:created",
            ServerMessage::SessionJoined { .. } => "session:joined",
            ServerMessage::SessionLeft { .. } => "session:left",
            ServerMessage::SensorConnected { .. } => "sensor:connected",
            ServerMessage::SensorDisconnected { .. } => "sensor:disconnected",
            ServerMessage::SensorData { .. } => "sensor:data",
            ServerMessage::SessionStarted { .. } => "session:started",
            ServerMessage::SessionPaused { .. } => "session:paused",
            ServerMessage::SessionResumed { .. } => "session:resumed",
            ServerMessage::SessionEnded { .. } => "session:ended",
            ServerMessage::SessionValidated { .. } => "session:validated",
            ServerMessage::SessionSynced { .. } => "session:synced",
            ServerMessage::RoomCreated { .. } => "room:created",
            ServerMessage::RoomJoined { .. } => "room:joined",
            ServerMessage::RoomLeft { .. } => "room:left",
            ServerMessage::RoomUpdated { .. } => "room:updated",
            ServerMessage::RoomStarting { .. } => "room:starting",
            ServerMessage::RoomStarted { .. } => "room:started",
            ServerMessage::RoomPaused { .. } => "room:paused",
            ServerMessage::RoomResumed { .. } => "room:resumed",
            ServerMessage::RoomEnded { .. } => "room:ended",
            ServerMessage::RoomList { .. } => "room:list",
            ServerMessage::GameUpdate { .. } => "game:update",
            ServerMessage::Ping { .. } => "ping",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Stats { .. } => "server:stats",
            ServerMessage::Shutdown { .. } => "server:shutdown",
            ServerMessage::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_max_sensors_per_mode() {
        assert_eq!(GameMode::Solo.max_sensors(), 1);
        assert_eq!(GameMode::Dual.max_sensors(), 2);
        assert_eq!(GameMode::Multiplayer.max_sensors(), 10);
    }

    #[test]
    fn test_slot_names_follow_mode() {
        assert_eq!(GameMode::Solo.slot_names(), vec!["main"]);
        assert_eq!(GameMode::Dual.slot_names(), vec!["left", "right"]);

        let multi = GameMode::Multiplayer.slot_names();
        assert_eq!(multi.len(), GameMode::Multiplayer.max_sensors());
        assert_eq!(multi[0], "player_1");
        assert_eq!(multi[9], "player_10");
    }

    #[test]
    fn test_auto_ready_modes() {
        assert!(GameMode::Solo.auto_ready());
        assert!(GameMode::Dual.auto_ready());
        assert!(!GameMode::Multiplayer.auto_ready());
    }

    #[test]
    fn test_client_message_uses_type_tag() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "session:join",
            "sessionCode": "4821"
        }))
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::JoinSession {
                session_code: "4821".to_string(),
                sensor_id: None,
            }
        );
        assert_eq!(msg.message_type(), "session:join");
    }

    #[test]
    fn test_identify_optional_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "client:identify",
            "clientType": "sensor",
            "userAgent": "Mozilla/5.0"
        }))
        .unwrap();

        match msg {
            ClientMessage::Identify {
                client_type,
                user_agent,
                version,
                admin_token,
            } => {
                assert_eq!(client_type, ClientRole::Sensor);
                assert_eq!(user_agent.as_deref(), Some("Mozilla/5.0"));
                assert!(version.is_none());
                assert!(admin_token.is_none());
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_game_type_is_rejected() {
        let result: Result<ClientMessage, _> = serde_json::from_value(json!({
            "type": "session:create",
            "gameType": "quad"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::SessionCreated {
            session_code: "4821".to_string(),
            session_id: "session_abc".to_string(),
            game_type: GameMode::Dual,
            max_sensors: 2,
        };

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], msg.message_type());
        assert_eq!(value["type"], "session:created");
        assert_eq!(value["sessionCode"], "4821");
        assert_eq!(value["gameType"], "dual");
        assert_eq!(value["maxSensors"], 2);
    }

    #[test]
    fn test_error_message_carries_category() {
        let msg = ServerMessage::error(ErrorCode::SessionFull, "Session is full");
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["code"], "SESSION_FULL");
        assert_eq!(value["error"]["category"], "capacity");
        assert_eq!(value["error"]["message"], "Session is full");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(ErrorCode::InvalidMessage.category(), ErrorCategory::Validation);
        assert_eq!(ErrorCode::Unauthorized.category(), ErrorCategory::Authorization);
        assert_eq!(ErrorCode::SessionNotFound.category(), ErrorCategory::NotFound);
        assert_eq!(ErrorCode::RoomFull.category(), ErrorCategory::Capacity);
        assert_eq!(ErrorCode::InvalidState.category(), ErrorCategory::StateConflict);
        assert_eq!(ErrorCode::RateLimited.category(), ErrorCategory::RateLimit);
        assert_eq!(ErrorCode::InternalError.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_state_names_match_wire() {
        assert_eq!(
            serde_json::to_value(SessionState::WaitingSensors).unwrap(),
            json!("WAITING_SENSORS")
        );
        assert_eq!(SessionState::GameReady.to_string(), "GAME_READY");
        assert_eq!(serde_json::to_value(RoomState::Starting).unwrap(), json!("STARTING"));
        assert!(RoomState::Ready.is_lobby());
        assert!(!RoomState::Playing.is_lobby());
    }

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let t1 = get_timestamp();
        std::thread::sleep(Duration::from_millis(2));
        let t2 = get_timestamp();
        assert!(t2 > t1);
    }
}
