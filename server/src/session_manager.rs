//! Code-addressable sessions pairing one display with its sensors
//!
//! This module owns every `GameSession` and the indexes used to reach them:
//! - by internal id, by numeric code and by connection id (host or sensor)
//! - a cooldown set of recently released codes
//!
//! It also drives the session state machine:
//!
//! ```text
//! CREATED → WAITING_SENSORS → SENSORS_CONNECTED → GAME_READY → PLAYING ⇄ PAUSED → ENDED
//! ```
//!
//! State is recomputed whenever slot membership changes. A full session
//! advances to SENSORS_CONNECTED, and solo/dual sessions continue to
//! GAME_READY on their own. Losing a sensor in SENSORS_CONNECTED or
//! GAME_READY falls back to WAITING_SENSORS. ENDED is terminal; the session
//! is removed and its code enters the cooldown set.

use crate::config::SessionConfig;
use crate::connection::ConnectionId;
use crate::error::BrokerError;
use crate::utils::{generate_id, generate_numeric_code, get_timestamp, is_older_than};
use log::{debug, error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use shared::{GameMode, SessionInfo, SessionState};
use std::collections::HashMap;
use std::time::Instant;

const MAX_SLOT_NAME_LENGTH: usize = 32;

/// A named position inside a session held by one sensor connection
#[derive(Debug, Clone)]
pub struct SensorSlot {
    pub name: String,
    pub connection_id: ConnectionId,
    /// Latest payload received from this sensor
    pub last_data: Option<Value>,
    pub last_data_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct GameSession {
    pub id: String,
    pub code: String,
    pub mode: GameMode,
    pub host: ConnectionId,
    /// Slots in join order
    pub sensors: Vec<SensorSlot>,
    pub state: SessionState,
    pub created_at: u64,
    pub last_activity: Instant,
    pub room_id: Option<String>,
}

impl GameSession {
    fn new(id: String, code: String, mode: GameMode, host: ConnectionId) -> Self {
        Self {
            id,
            code,
            mode,
            host,
            sensors: Vec::new(),
            state: SessionState::Created,
            created_at: get_timestamp(),
            last_activity: Instant::now(),
            room_id: None,
        }
    }

    pub fn max_sensors(&self) -> usize {
        self.mode.max_sensors()
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_full(&self) -> bool {
        self.sensors.len() >= self.max_sensors()
    }

    /// Whether the display may start the game right now
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            SessionState::SensorsConnected | SessionState::GameReady
        )
    }

    pub fn slot_for(&self, connection_id: ConnectionId) -> Option<&SensorSlot> {
        self.sensors.iter().find(|s| s.connection_id == connection_id)
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.sensors.iter().any(|s| s.name == name)
    }

    pub fn sensor_connections(&self) -> Vec<ConnectionId> {
        self.sensors.iter().map(|s| s.connection_id).collect()
    }

    /// Host first, then sensors in join order
    pub fn members(&self) -> Vec<ConnectionId> {
        let mut members = vec![self.host];
        members.extend(self.sensor_connections());
        members
    }

    /// Default slot for the next sensor
    ///
    /// The name is derived from the mode and the current slot count. If that
    /// name was claimed explicitly by another sensor, the first free name in
    /// the mode's sequence is used instead.
    fn default_slot_name(&self) -> Option<String> {
        let names = self.mode.slot_names();
        let candidate = names.get(self.sensors.len()).cloned();

        match candidate {
            Some(name) if !self.has_slot(&name) => Some(name),
            _ => names.into_iter().find(|name| !self.has_slot(name)),
        }
    }

    /// Re-derives state after slot membership changed
    ///
    /// Returns every state passed through, in order. Only CREATED,
    /// WAITING_SENSORS, SENSORS_CONNECTED and GAME_READY are affected;
    /// a running game keeps its state when a sensor drops.
    fn refresh_state(&mut self) -> Vec<SessionState> {
        let full = self.is_full();
        let mut visited = Vec::new();

        loop {
            let next = match self.state {
                SessionState::Created => Some(SessionState::WaitingSensors),
                SessionState::WaitingSensors if full => Some(SessionState::SensorsConnected),
                SessionState::SensorsConnected if full && self.mode.auto_ready() => {
                    Some(SessionState::GameReady)
                }
                SessionState::SensorsConnected | SessionState::GameReady if !full => {
                    Some(SessionState::WaitingSensors)
                }
                _ => None,
            };

            match next {
                Some(state) => {
                    self.state = state;
                    visited.push(state);
                }
                None => break,
            }
        }

        visited
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            session_code: self.code.clone(),
            game_type: self.mode,
            state: self.state,
            sensor_count: self.sensor_count(),
            max_sensors: self.max_sensors(),
            sensors: self.sensors.iter().map(|s| s.name.clone()).collect(),
            room_id: self.room_id.clone(),
            created_at: self.created_at,
        }
    }
}

/// Result of a successful sensor join
#[derive(Debug, Clone)]
pub struct SensorJoin {
    pub session_id: String,
    pub session_code: String,
    pub mode: GameMode,
    pub host: ConnectionId,
    pub slot: String,
    pub sensor_count: usize,
    pub max_sensors: usize,
    pub is_ready: bool,
    pub state: SessionState,
    pub room_id: Option<String>,
}

/// Result of a sensor leaving a session that stays alive
#[derive(Debug, Clone)]
pub struct SensorDeparture {
    pub session_id: String,
    pub host: ConnectionId,
    pub slot: String,
    pub sensor_count: usize,
    pub max_sensors: usize,
    pub is_ready: bool,
    pub state: SessionState,
    pub room_id: Option<String>,
}

/// A session that has been ended and removed
#[derive(Debug, Clone)]
pub struct ClosedSession {
    pub session_id: String,
    pub code: String,
    pub mode: GameMode,
    pub host: ConnectionId,
    pub sensors: Vec<ConnectionId>,
    pub room_id: Option<String>,
    pub reason: String,
}

/// What a departing connection meant for its session
#[derive(Debug, Clone)]
pub enum DisconnectOutcome {
    SensorLeft(SensorDeparture),
    SessionClosed(ClosedSession),
}

/// Routing data for one stored sensor payload
#[derive(Debug, Clone)]
pub struct SensorFrame {
    pub session_id: String,
    pub host: ConnectionId,
    pub slot: String,
    pub timestamp: u64,
}

/// A host-driven state change and who should hear about it
#[derive(Debug, Clone)]
pub struct SessionTransition {
    pub session_id: String,
    pub state: SessionState,
    pub members: Vec<ConnectionId>,
}

pub struct SessionManager {
    sessions: HashMap<String, GameSession>,
    by_code: HashMap<String, String>,
    by_connection: HashMap<ConnectionId, String>,
    /// Released codes and when they were released
    released_codes: HashMap<String, Instant>,
    config: SessionConfig,
    rng: StdRng,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: SessionConfig, rng: StdRng) -> Self {
        Self {
            sessions: HashMap::new(),
            by_code: HashMap::new(),
            by_connection: HashMap::new(),
            released_codes: HashMap::new(),
            config,
            rng,
        }
    }

    /// Whether `code` may be handed out now
    ///
    /// A code is unavailable while a live session holds it and for
    /// `code_cooldown` after that session released it.
    pub fn is_code_available(&self, code: &str, now: Instant) -> bool {
        if self.by_code.contains_key(code) {
            return false;
        }
        match self.released_codes.get(code) {
            Some(released) => is_older_than(*released, self.config.code_cooldown, now),
            None => true,
        }
    }

    fn generate_code(&mut self) -> Result<String, BrokerError> {
        let now = Instant::now();
        for _ in 0..self.config.max_code_attempts {
            let code = generate_numeric_code(&mut self.rng, self.config.code_length);
            if self.is_code_available(&code, now) {
                self.released_codes.remove(&code);
                return Ok(code);
            }
        }

        error!(
            "Could not allocate a session code after {} attempts ({} live sessions, {} cooling down)",
            self.config.max_code_attempts,
            self.sessions.len(),
            self.released_codes.len()
        );
        Err(BrokerError::CodeSpaceExhausted(self.config.max_code_attempts))
    }

    /// Allocates a session in state CREATED owned by `host`
    pub fn create_session(
        &mut self,
        mode: GameMode,
        host: ConnectionId,
    ) -> Result<SessionInfo, BrokerError> {
        if let Some(existing) = self.by_connection.get(&host) {
            return Err(BrokerError::AlreadyInSession(existing.clone()));
        }
        if self.sessions.len() >= self.config.max_sessions {
            return Err(BrokerError::SessionLimit);
        }

        let code = self.generate_code()?;
        let id = generate_id(&mut self.rng, "session", 12);
        let session = GameSession::new(id.clone(), code.clone(), mode, host);
        let info = session.info();

        self.by_code.insert(code.clone(), id.clone());
        self.by_connection.insert(host, id.clone());
        self.sessions.insert(id.clone(), session);

        info!(
            "Session {} created with code {} ({}) for connection {}",
            id, code, mode, host
        );
        Ok(info)
    }

    /// Attaches a sensor to the session addressed by `code`
    ///
    /// Without `requested_slot` the slot name is derived from the mode.
    /// Nothing is registered unless every check passes.
    pub fn connect_sensor(
        &mut self,
        code: &str,
        connection_id: ConnectionId,
        requested_slot: Option<&str>,
    ) -> Result<SensorJoin, BrokerError> {
        if let Some(existing) = self.by_connection.get(&connection_id) {
            return Err(BrokerError::AlreadyInSession(existing.clone()));
        }

        let session_id = self
            .by_code
            .get(code)
            .cloned()
            .ok_or_else(|| BrokerError::SessionNotFound(code.to_string()))?;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(code.to_string()))?;

        if session.is_full() {
            return Err(BrokerError::SessionFull(session.max_sensors()));
        }

        let slot = match requested_slot {
            Some(name) => {
                let name = name.trim();
                if name.is_empty() || name.len() > MAX_SLOT_NAME_LENGTH {
                    return Err(BrokerError::InvalidMessage(format!(
                        "sensorId must be 1 to {} characters",
                        MAX_SLOT_NAME_LENGTH
                    )));
                }
                if session.has_slot(name) {
                    return Err(BrokerError::SlotTaken(name.to_string()));
                }
                name.to_string()
            }
            None => session
                .default_slot_name()
                .ok_or(BrokerError::SessionFull(session.max_sensors()))?,
        };

        session.sensors.push(SensorSlot {
            name: slot.clone(),
            connection_id,
            last_data: None,
            last_data_at: None,
        });
        session.touch();
        let transitions = session.refresh_state();

        debug!(
            "Sensor {} joined session {} as {} ({:?})",
            connection_id, session.id, slot, transitions
        );

        let join = SensorJoin {
            session_id: session.id.clone(),
            session_code: session.code.clone(),
            mode: session.mode,
            host: session.host,
            slot,
            sensor_count: session.sensor_count(),
            max_sensors: session.max_sensors(),
            is_ready: session.is_ready(),
            state: session.state,
            room_id: session.room_id.clone(),
        };

        self.by_connection.insert(connection_id, session_id);
        Ok(join)
    }

    /// Releases the slot held by a sensor connection
    pub fn disconnect_sensor(
        &mut self,
        connection_id: ConnectionId,
    ) -> Result<SensorDeparture, BrokerError> {
        let session_id = self
            .by_connection
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidState("Connection is not in a session".into()))?;
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;

        let index = session
            .sensors
            .iter()
            .position(|s| s.connection_id == connection_id)
            .ok_or_else(|| BrokerError::InvalidState("Connection is not a sensor".into()))?;

        let slot = session.sensors.remove(index);
        session.touch();
        let transitions = session.refresh_state();
        self.by_connection.remove(&connection_id);

        debug!(
            "Sensor {} left session {} from {} ({:?})",
            connection_id, session.id, slot.name, transitions
        );

        Ok(SensorDeparture {
            session_id: session.id.clone(),
            host: session.host,
            slot: slot.name,
            sensor_count: session.sensor_count(),
            max_sensors: session.max_sensors(),
            is_ready: session.is_ready(),
            state: session.state,
            room_id: session.room_id.clone(),
        })
    }

    /// Cleans up after a connection went away
    ///
    /// A departing sensor releases its slot. A departing host ends the whole
    /// session, since a session cannot outlive its host. Connections that
    /// were not part of any session yield None.
    pub fn handle_disconnection(&mut self, connection_id: ConnectionId) -> Option<DisconnectOutcome> {
        let session_id = self.by_connection.get(&connection_id)?.clone();
        let is_host = self
            .sessions
            .get(&session_id)
            .map(|s| s.host == connection_id)?;

        if is_host {
            self.remove_session(&session_id, "host_disconnected")
                .map(DisconnectOutcome::SessionClosed)
        } else {
            self.disconnect_sensor(connection_id)
                .ok()
                .map(DisconnectOutcome::SensorLeft)
        }
    }

    /// Stores the latest payload for the sensor's slot
    pub fn update_sensor_data(
        &mut self,
        connection_id: ConnectionId,
        data: Value,
    ) -> Result<SensorFrame, BrokerError> {
        let session_id = self
            .by_connection
            .get(&connection_id)
            .ok_or_else(|| BrokerError::InvalidState("Sensor has not joined a session".into()))?;
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;

        let now = Instant::now();
        let slot = session
            .sensors
            .iter_mut()
            .find(|s| s.connection_id == connection_id)
            .ok_or_else(|| BrokerError::InvalidState("Connection is not a sensor".into()))?;

        slot.last_data = Some(data);
        slot.last_data_at = Some(now);
        let slot_name = slot.name.clone();
        session.last_activity = now;

        Ok(SensorFrame {
            session_id: session.id.clone(),
            host: session.host,
            slot: slot_name,
            timestamp: get_timestamp(),
        })
    }

    fn hosted_session_mut(&mut self, host: ConnectionId) -> Result<&mut GameSession, BrokerError> {
        let session_id = self
            .by_connection
            .get(&host)
            .ok_or_else(|| BrokerError::InvalidState("Display has no session".into()))?;
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;
        if session.host != host {
            return Err(BrokerError::InvalidState(
                "Only the session host may control it".into(),
            ));
        }
        Ok(session)
    }

    fn transition(
        &mut self,
        host: ConnectionId,
        action: &'static str,
        allowed: &[SessionState],
        target: SessionState,
    ) -> Result<SessionTransition, BrokerError> {
        let session = self.hosted_session_mut(host)?;
        if !allowed.contains(&session.state) {
            return Err(BrokerError::InvalidSessionState {
                action,
                state: session.state,
            });
        }

        session.state = target;
        session.touch();
        info!("Session {} is now {}", session.id, target);

        Ok(SessionTransition {
            session_id: session.id.clone(),
            state: target,
            members: session.members(),
        })
    }

    /// GAME_READY or SENSORS_CONNECTED → PLAYING
    pub fn start_game(&mut self, host: ConnectionId) -> Result<SessionTransition, BrokerError> {
        self.transition(
            host,
            "start the game",
            &[SessionState::GameReady, SessionState::SensorsConnected],
            SessionState::Playing,
        )
    }

    pub fn pause_game(&mut self, host: ConnectionId) -> Result<SessionTransition, BrokerError> {
        self.transition(
            host,
            "pause the game",
            &[SessionState::Playing],
            SessionState::Paused,
        )
    }

    pub fn resume_game(&mut self, host: ConnectionId) -> Result<SessionTransition, BrokerError> {
        self.transition(
            host,
            "resume the game",
            &[SessionState::Paused],
            SessionState::Playing,
        )
    }

    /// PLAYING or PAUSED → ENDED, then removal
    pub fn end_game(
        &mut self,
        host: ConnectionId,
        reason: &str,
    ) -> Result<ClosedSession, BrokerError> {
        let session = self.hosted_session_mut(host)?;
        if !matches!(session.state, SessionState::Playing | SessionState::Paused) {
            return Err(BrokerError::InvalidSessionState {
                action: "end the game",
                state: session.state,
            });
        }
        let session_id = session.id.clone();
        self.remove_session(&session_id, reason)
            .ok_or(BrokerError::SessionNotFound(session_id))
    }

    /// Tears the host's session down from any state
    pub fn close_session(
        &mut self,
        host: ConnectionId,
        reason: &str,
    ) -> Result<ClosedSession, BrokerError> {
        let session_id = self.hosted_session_mut(host)?.id.clone();
        self.remove_session(&session_id, reason)
            .ok_or(BrokerError::SessionNotFound(session_id))
    }

    fn remove_session(&mut self, session_id: &str, reason: &str) -> Option<ClosedSession> {
        let mut session = self.sessions.remove(session_id)?;
        session.state = SessionState::Ended;

        self.by_code.remove(&session.code);
        self.released_codes.insert(session.code.clone(), Instant::now());
        for member in session.members() {
            self.by_connection.remove(&member);
        }

        info!(
            "Session {} ({}) ended: {}",
            session.id, session.code, reason
        );

        Some(ClosedSession {
            session_id: session.id.clone(),
            code: session.code.clone(),
            mode: session.mode,
            host: session.host,
            sensors: session.sensor_connections(),
            room_id: session.room_id.clone(),
            reason: reason.to_string(),
        })
    }

    /// Ends sessions idle beyond `session_timeout` and forgets expired
    /// cooldown entries
    pub fn cleanup_expired(&mut self) -> Vec<ClosedSession> {
        let now = Instant::now();
        let timeout = self.config.session_timeout;
        let cooldown = self.config.code_cooldown;

        self.released_codes
            .retain(|_, released| !is_older_than(*released, cooldown, now));

        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| is_older_than(s.last_activity, timeout, now))
            .map(|s| s.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.remove_session(id, "timeout"))
            .collect()
    }

    /// Checks a client's remembered code and/or id against live sessions
    pub fn validate(
        &self,
        code: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<SessionInfo, BrokerError> {
        let by_code = match code {
            Some(code) => Some(
                self.get_by_code(code)
                    .ok_or_else(|| BrokerError::SessionNotFound(code.to_string()))?,
            ),
            None => None,
        };
        let by_id = match session_id {
            Some(id) => Some(
                self.get(id)
                    .ok_or_else(|| BrokerError::SessionNotFound(id.to_string()))?,
            ),
            None => None,
        };

        match (by_code, by_id) {
            (Some(a), Some(b)) if a.id != b.id => Err(BrokerError::InvalidState(
                "Session code and id refer to different sessions".into(),
            )),
            (Some(session), _) | (None, Some(session)) => Ok(session.info()),
            (None, None) => Err(BrokerError::InvalidMessage(
                "sessionCode or sessionId is required".into(),
            )),
        }
    }

    /// Current view of a session, used to resynchronise a reconnecting client
    pub fn snapshot(&self, session_id: &str) -> Result<SessionInfo, BrokerError> {
        self.get(session_id)
            .map(GameSession::info)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))
    }

    pub fn link_room(&mut self, session_id: &str, room_id: &str) -> Result<(), BrokerError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))?;
        session.room_id = Some(room_id.to_string());
        session.touch();
        Ok(())
    }

    pub fn unlink_room(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.room_id = None;
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&GameSession> {
        self.sessions.get(session_id)
    }

    pub fn get_by_code(&self, code: &str) -> Option<&GameSession> {
        self.by_code.get(code).and_then(|id| self.sessions.get(id))
    }

    pub fn session_for_connection(&self, connection_id: ConnectionId) -> Option<&GameSession> {
        self.by_connection
            .get(&connection_id)
            .and_then(|id| self.sessions.get(id))
    }

    /// The session hosted by `host`, if any
    pub fn hosted_session(&self, host: ConnectionId) -> Option<&GameSession> {
        self.session_for_connection(host)
            .filter(|s| s.host == host)
    }

    pub fn count_in_state(&self, state: SessionState) -> usize {
        self.sessions.values().filter(|s| s.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
