//! Multiplayer rooms grouping several displays, each backed by its own
//! multiplayer session.
//!
//! Players are keyed by session id. The host is always a current member; when
//! the host leaves, the earliest remaining joiner takes over. A room whose
//! last player leaves is FINISHED and dropped on the spot.
//!
//! ```text
//! WAITING ⇄ READY → STARTING → PLAYING ⇄ PAUSED → (end) → WAITING
//! ```

use crate::config::{RoomConfig, MAX_ROOM_PLAYERS, MIN_ROOM_PLAYERS};
use crate::connection::ConnectionId;
use crate::error::BrokerError;
use crate::utils::{generate_id, get_timestamp, is_older_than};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use shared::{PlayerInfo, PlayerStatus, RoomInfo, RoomState, RoomSummary};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_NICKNAME_LENGTH: usize = 32;
const DEFAULT_GAME_ID: &str = "default";

#[derive(Debug, Clone)]
pub struct Player {
    pub id: String,
    pub session_id: String,
    /// Display connection the player's messages are delivered to
    pub connection_id: ConnectionId,
    pub nickname: String,
    pub is_host: bool,
    pub is_ready: bool,
    pub sensor_connected: bool,
    pub status: PlayerStatus,
    pub score: i64,
    pub position: Option<Value>,
    pub data: Option<Value>,
    pub last_activity: Instant,
}

impl Player {
    fn new(
        id: String,
        session_id: String,
        connection_id: ConnectionId,
        nickname: String,
        sensor_connected: bool,
    ) -> Self {
        Self {
            id,
            session_id,
            connection_id,
            nickname,
            is_host: false,
            is_ready: false,
            sensor_connected,
            status: Self::idle_status(sensor_connected),
            score: 0,
            position: None,
            data: None,
            last_activity: Instant::now(),
        }
    }

    fn idle_status(sensor_connected: bool) -> PlayerStatus {
        if sensor_connected {
            PlayerStatus::Connected
        } else {
            PlayerStatus::WaitingSensor
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            player_id: self.id.clone(),
            session_id: self.session_id.clone(),
            nickname: self.nickname.clone(),
            is_host: self.is_host,
            is_ready: self.is_ready,
            sensor_connected: self.sensor_connected,
            status: self.status,
            score: self.score,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GameRoom {
    pub id: String,
    pub game_id: String,
    pub host_session_id: String,
    pub state: RoomState,
    pub max_players: usize,
    pub is_private: bool,
    /// Join order
    pub players: Vec<Player>,
    pub created_at: u64,
    pub last_activity: Instant,
    pub starting_since: Option<Instant>,
}

impl GameRoom {
    pub fn player(&self, session_id: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.session_id == session_id)
    }

    fn player_mut(&mut self, session_id: &str) -> Option<&mut Player> {
        self.players.iter_mut().find(|p| p.session_id == session_id)
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= self.max_players
    }

    pub fn is_host(&self, session_id: &str) -> bool {
        self.host_session_id == session_id
    }

    /// At least two players, every one with a sensor attached and marked ready
    pub fn are_all_players_ready(&self) -> bool {
        self.players.len() >= MIN_ROOM_PLAYERS
            && self
                .players
                .iter()
                .all(|p| p.sensor_connected && p.is_ready)
    }

    pub fn members(&self) -> Vec<ConnectionId> {
        self.players.iter().map(|p| p.connection_id).collect()
    }

    pub fn members_except(&self, session_id: &str) -> Vec<ConnectionId> {
        self.players
            .iter()
            .filter(|p| p.session_id != session_id)
            .map(|p| p.connection_id)
            .collect()
    }

    /// Re-derives state after membership or readiness changed.
    /// Returns true when a running game had to end.
    fn refresh_state(&mut self) -> bool {
        match self.state {
            RoomState::Waiting | RoomState::Ready => {
                self.state = self.lobby_state();
            }
            RoomState::Starting if !self.are_all_players_ready() => {
                debug!("Room {} lost readiness while starting", self.id);
                self.starting_since = None;
                self.state = self.lobby_state();
            }
            RoomState::Playing | RoomState::Paused if self.players.len() < MIN_ROOM_PLAYERS => {
                info!("Room {} ended: not enough players", self.id);
                self.reset_after_game();
                return true;
            }
            _ => {}
        }
        false
    }

    fn lobby_state(&self) -> RoomState {
        if self.are_all_players_ready() {
            RoomState::Ready
        } else {
            RoomState::Waiting
        }
    }

    fn reset_after_game(&mut self) {
        self.starting_since = None;
        for player in &mut self.players {
            player.is_ready = false;
            player.status = Player::idle_status(player.sensor_connected);
        }
        self.state = self.lobby_state();
    }

    fn reassign_host(&mut self) {
        if self.player(&self.host_session_id).is_some() {
            return;
        }
        if let Some(next) = self.players.first_mut() {
            next.is_host = true;
            self.host_session_id = next.session_id.clone();
            info!("Room {} host is now {}", self.id, next.id);
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id.clone(),
            game_id: self.game_id.clone(),
            host_session_id: self.host_session_id.clone(),
            state: self.state,
            max_players: self.max_players,
            is_private: self.is_private,
            players: self.players.iter().map(Player::info).collect(),
            created_at: self.created_at,
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id.clone(),
            game_id: self.game_id.clone(),
            state: self.state,
            player_count: self.players.len(),
            max_players: self.max_players,
        }
    }
}

/// Options accepted by `room:create`
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    pub game_id: Option<String>,
    pub max_players: Option<usize>,
    pub is_private: bool,
    pub nickname: Option<String>,
}

/// A room snapshot and who should receive it
#[derive(Debug, Clone)]
pub struct RoomUpdate {
    pub room: RoomInfo,
    pub members: Vec<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct RoomJoin {
    pub room: RoomInfo,
    pub player_id: String,
    /// Members other than the joiner
    pub others: Vec<ConnectionId>,
}

#[derive(Debug, Clone)]
pub struct PlayerDeparture {
    pub room_id: String,
    pub session_id: String,
    pub player_id: String,
    pub connection_id: ConnectionId,
    /// None when the room was removed
    pub room: Option<RoomInfo>,
    pub members: Vec<ConnectionId>,
    /// A running game ended because too few players were left
    pub game_ended: bool,
}

#[derive(Debug, Clone)]
pub struct RoomStart {
    pub room_id: String,
    pub members: Vec<ConnectionId>,
    pub starts_in: Duration,
    /// Identifies this start attempt for `complete_start`
    pub started_at: Instant,
}

#[derive(Debug, Clone)]
pub struct PlayerUpdate {
    pub player_id: String,
    pub score: i64,
    pub position: Option<Value>,
    pub data: Option<Value>,
    pub others: Vec<ConnectionId>,
}

pub struct GameStateManager {
    rooms: HashMap<String, GameRoom>,
    by_session: HashMap<String, String>,
    config: RoomConfig,
    rng: StdRng,
}

impl GameStateManager {
    pub fn new(config: RoomConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: RoomConfig, rng: StdRng) -> Self {
        Self {
            rooms: HashMap::new(),
            by_session: HashMap::new(),
            config,
            rng,
        }
    }

    fn nickname(requested: Option<&str>, position: usize) -> Result<String, BrokerError> {
        match requested.map(str::trim) {
            Some(name) if name.len() > MAX_NICKNAME_LENGTH => Err(BrokerError::InvalidMessage(
                format!("nickname must be at most {} characters", MAX_NICKNAME_LENGTH),
            )),
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Ok(format!("Player {}", position)),
        }
    }

    /// Opens a room with the requesting session as host and first player
    pub fn create_room(
        &mut self,
        session_id: &str,
        connection_id: ConnectionId,
        sensor_connected: bool,
        options: RoomOptions,
    ) -> Result<(RoomInfo, String), BrokerError> {
        if let Some(room_id) = self.by_session.get(session_id) {
            return Err(BrokerError::AlreadyInRoom(room_id.clone()));
        }
        if self.rooms.len() >= self.config.max_rooms {
            return Err(BrokerError::RoomLimit);
        }

        let max_players = options
            .max_players
            .unwrap_or(self.config.default_max_players);
        if !(MIN_ROOM_PLAYERS..=MAX_ROOM_PLAYERS).contains(&max_players) {
            return Err(BrokerError::InvalidMessage(format!(
                "maxPlayers must be between {} and {}",
                MIN_ROOM_PLAYERS, MAX_ROOM_PLAYERS
            )));
        }
        let nickname = Self::nickname(options.nickname.as_deref(), 1)?;
        let game_id = options
            .game_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_GAME_ID.to_string());

        let room_id = generate_id(&mut self.rng, "room", 6);
        let player_id = generate_id(&mut self.rng, "player", 8);

        let mut host = Player::new(
            player_id.clone(),
            session_id.to_string(),
            connection_id,
            nickname,
            sensor_connected,
        );
        host.is_host = true;

        let room = GameRoom {
            id: room_id.clone(),
            game_id,
            host_session_id: session_id.to_string(),
            state: RoomState::Waiting,
            max_players,
            is_private: options.is_private,
            players: vec![host],
            created_at: get_timestamp(),
            last_activity: Instant::now(),
            starting_since: None,
        };
        let info = room.info();

        self.by_session.insert(session_id.to_string(), room_id.clone());
        self.rooms.insert(room_id.clone(), room);

        info!(
            "Room {} created by session {} ({} players max)",
            room_id, session_id, max_players
        );
        Ok((info, player_id))
    }

    pub fn add_player(
        &mut self,
        room_id: &str,
        session_id: &str,
        connection_id: ConnectionId,
        nickname: Option<&str>,
        sensor_connected: bool,
    ) -> Result<RoomJoin, BrokerError> {
        if let Some(existing) = self.by_session.get(session_id) {
            return Err(BrokerError::AlreadyInRoom(existing.clone()));
        }
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| BrokerError::RoomNotFound(room_id.to_string()))?;

        if !room.state.is_lobby() {
            return Err(BrokerError::InvalidState(format!(
                "Room {} is {} and not accepting players",
                room.id, room.state
            )));
        }
        if room.is_full() {
            return Err(BrokerError::RoomFull(room.max_players));
        }

        let nickname = Self::nickname(nickname, room.players.len() + 1)?;
        let player_id = generate_id(&mut self.rng, "player", 8);
        room.players.push(Player::new(
            player_id.clone(),
            session_id.to_string(),
            connection_id,
            nickname,
            sensor_connected,
        ));
        room.touch();
        room.refresh_state();

        let join = RoomJoin {
            room: room.info(),
            player_id,
            others: room.members_except(session_id),
        };
        self.by_session
            .insert(session_id.to_string(), room_id.to_string());

        debug!("Session {} joined room {}", session_id, room_id);
        Ok(join)
    }

    /// Drops the session's player, handing host over and removing the room
    /// when it becomes empty
    pub fn remove_player(&mut self, session_id: &str) -> Option<PlayerDeparture> {
        let room_id = self.by_session.remove(session_id)?;
        let room = self.rooms.get_mut(&room_id)?;

        let index = room
            .players
            .iter()
            .position(|p| p.session_id == session_id)?;
        let player = room.players.remove(index);
        room.touch();

        if room.players.is_empty() {
            room.state = RoomState::Finished;
            self.rooms.remove(&room_id);
            info!("Room {} finished: last player left", room_id);
            return Some(PlayerDeparture {
                room_id,
                session_id: player.session_id,
                player_id: player.id,
                connection_id: player.connection_id,
                room: None,
                members: Vec::new(),
                game_ended: false,
            });
        }

        room.reassign_host();
        let game_ended = room.refresh_state();

        Some(PlayerDeparture {
            room_id,
            session_id: player.session_id,
            player_id: player.id,
            connection_id: player.connection_id,
            room: Some(room.info()),
            members: room.members(),
            game_ended,
        })
    }

    fn room_for_session_mut(&mut self, session_id: &str) -> Result<&mut GameRoom, BrokerError> {
        let room_id = self
            .by_session
            .get(session_id)
            .ok_or_else(|| BrokerError::PlayerNotFound(session_id.to_string()))?;
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| BrokerError::RoomNotFound(room_id.clone()))
    }

    fn set_sensor(&mut self, session_id: &str, connected: bool) -> Option<RoomUpdate> {
        let room = self.room_for_session_mut(session_id).ok()?;
        let in_lobby = !matches!(room.state, RoomState::Playing | RoomState::Paused);
        let player = room.player_mut(session_id)?;

        if player.sensor_connected == connected {
            return None;
        }
        player.sensor_connected = connected;
        if !connected {
            player.is_ready = false;
        }
        if in_lobby {
            player.status = Player::idle_status(connected);
        }
        player.touch();
        room.refresh_state();

        Some(RoomUpdate {
            room: room.info(),
            members: room.members(),
        })
    }

    /// Marks the session's player as having a sensor. None when nothing changed.
    pub fn connect_player_sensor(&mut self, session_id: &str) -> Option<RoomUpdate> {
        self.set_sensor(session_id, true)
    }

    /// Clears the sensor flag and readiness. None when nothing changed.
    pub fn disconnect_player_sensor(&mut self, session_id: &str) -> Option<RoomUpdate> {
        self.set_sensor(session_id, false)
    }

    pub fn set_player_ready(
        &mut self,
        session_id: &str,
        ready: bool,
    ) -> Result<RoomUpdate, BrokerError> {
        let room = self.room_for_session_mut(session_id)?;
        if !room.state.is_lobby() {
            return Err(BrokerError::InvalidState(format!(
                "Cannot change readiness while room is {}",
                room.state
            )));
        }
        let player = room
            .player_mut(session_id)
            .ok_or_else(|| BrokerError::PlayerNotFound(session_id.to_string()))?;

        if ready && !player.sensor_connected {
            return Err(BrokerError::InvalidState(
                "A sensor must be connected before marking ready".into(),
            ));
        }
        player.is_ready = ready;
        player.status = if ready {
            PlayerStatus::Ready
        } else {
            Player::idle_status(player.sensor_connected)
        };
        player.touch();
        room.touch();
        room.refresh_state();

        Ok(RoomUpdate {
            room: room.info(),
            members: room.members(),
        })
    }

    pub fn are_all_players_ready(&self, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(GameRoom::are_all_players_ready)
            .unwrap_or(false)
    }

    fn hosted_room_mut(
        &mut self,
        session_id: &str,
        action: &'static str,
    ) -> Result<&mut GameRoom, BrokerError> {
        let room = self.room_for_session_mut(session_id)?;
        if !room.is_host(session_id) {
            return Err(BrokerError::NotRoomHost(action));
        }
        Ok(room)
    }

    /// READY → STARTING; PLAYING follows via `complete_start`
    pub fn start_game(&mut self, session_id: &str) -> Result<RoomStart, BrokerError> {
        let starts_in = self.config.start_delay;
        let room = self.hosted_room_mut(session_id, "start the game")?;

        if room.state != RoomState::Ready || !room.are_all_players_ready() {
            return Err(BrokerError::InvalidState(format!(
                "Cannot start while room is {} and not every player is ready",
                room.state
            )));
        }

        let started_at = Instant::now();
        room.state = RoomState::Starting;
        room.starting_since = Some(started_at);
        room.touch();
        info!("Room {} starting in {:?}", room.id, starts_in);

        Ok(RoomStart {
            room_id: room.id.clone(),
            members: room.members(),
            starts_in,
            started_at,
        })
    }

    /// Finishes the start attempt begun at `started_at` if it is still pending.
    /// A start that was cancelled and retried is not completed by the older timer.
    pub fn complete_start(&mut self, room_id: &str, started_at: Instant) -> Option<RoomUpdate> {
        let room = self.rooms.get_mut(room_id)?;
        if room.state != RoomState::Starting {
            debug!("Room {} no longer starting ({})", room_id, room.state);
            return None;
        }
        if room.starting_since != Some(started_at) {
            debug!("Room {} ignoring a superseded start", room_id);
            return None;
        }

        room.state = RoomState::Playing;
        room.starting_since = None;
        for player in &mut room.players {
            player.status = PlayerStatus::Playing;
            player.score = 0;
        }
        room.touch();
        info!("Room {} is playing", room_id);

        Some(RoomUpdate {
            room: room.info(),
            members: room.members(),
        })
    }

    pub fn pause_game(&mut self, session_id: &str) -> Result<RoomUpdate, BrokerError> {
        let room = self.hosted_room_mut(session_id, "pause the game")?;
        if room.state != RoomState::Playing {
            return Err(BrokerError::InvalidState(format!(
                "Cannot pause while room is {}",
                room.state
            )));
        }
        room.state = RoomState::Paused;
        room.touch();

        Ok(RoomUpdate {
            room: room.info(),
            members: room.members(),
        })
    }

    pub fn resume_game(&mut self, session_id: &str) -> Result<RoomUpdate, BrokerError> {
        let room = self.hosted_room_mut(session_id, "resume the game")?;
        if room.state != RoomState::Paused {
            return Err(BrokerError::InvalidState(format!(
                "Cannot resume while room is {}",
                room.state
            )));
        }
        room.state = RoomState::Playing;
        room.touch();

        Ok(RoomUpdate {
            room: room.info(),
            members: room.members(),
        })
    }

    /// PLAYING or PAUSED back to the lobby with readiness cleared
    pub fn end_game(&mut self, session_id: &str) -> Result<RoomUpdate, BrokerError> {
        let room = self.hosted_room_mut(session_id, "end the game")?;
        if !matches!(room.state, RoomState::Playing | RoomState::Paused) {
            return Err(BrokerError::InvalidState(format!(
                "Cannot end the game while room is {}",
                room.state
            )));
        }
        room.reset_after_game();
        room.touch();
        info!("Room {} game ended by host", room.id);

        Ok(RoomUpdate {
            room: room.info(),
            members: room.members(),
        })
    }

    /// Records a player's score, position or scratch data while playing
    pub fn update_player_state(
        &mut self,
        session_id: &str,
        score: Option<i64>,
        position: Option<Value>,
        data: Option<Value>,
    ) -> Result<PlayerUpdate, BrokerError> {
        let room = self.room_for_session_mut(session_id)?;
        if room.state != RoomState::Playing {
            return Err(BrokerError::InvalidState(format!(
                "Game updates are only accepted while playing, room is {}",
                room.state
            )));
        }
        let others = room.members_except(session_id);
        let player = room
            .player_mut(session_id)
            .ok_or_else(|| BrokerError::PlayerNotFound(session_id.to_string()))?;

        if let Some(score) = score {
            player.score = score;
        }
        if position.is_some() {
            player.position = position;
        }
        if data.is_some() {
            player.data = data;
        }
        player.touch();

        let update = PlayerUpdate {
            player_id: player.id.clone(),
            score: player.score,
            position: player.position.clone(),
            data: player.data.clone(),
            others,
        };
        room.touch();
        Ok(update)
    }

    /// Public rooms that can still take players
    pub fn list_public_rooms(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<&GameRoom> = self
            .rooms
            .values()
            .filter(|r| !r.is_private && r.state.is_lobby() && !r.is_full())
            .collect();
        rooms.sort_by_key(|r| r.created_at);
        rooms.into_iter().map(GameRoom::summary).collect()
    }

    /// Removes players idle beyond `timeout`
    pub fn cleanup_inactive(&mut self, timeout: Duration) -> Vec<PlayerDeparture> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .rooms
            .values()
            .flat_map(|room| room.players.iter())
            .filter(|p| is_older_than(p.last_activity, timeout, now))
            .map(|p| p.session_id.clone())
            .collect();

        stale
            .iter()
            .filter_map(|session_id| self.remove_player(session_id))
            .collect()
    }

    pub fn get(&self, room_id: &str) -> Option<&GameRoom> {
        self.rooms.get(room_id)
    }

    pub fn player_timeout(&self) -> Duration {
        self.config.player_timeout
    }

    pub fn player_count(&self) -> usize {
        self.by_session.len()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
