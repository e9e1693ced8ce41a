//! Connection registry for the hub server
//!
//! This module owns every live transport endpoint and is the only place that
//! writes to a socket. It handles:
//! - Connection lifecycle (register, role assignment, removal)
//! - Unicast and fan-out delivery of serialized server messages
//! - Per-connection counters used for health metrics
//! - Fixed-window rate limiting
//! - Liveness probing with ping/pong and detection of unresponsive peers
//!
//! Delivery is a channel enqueue, so holding the manager lock while sending
//! never waits on the network.

use crate::connection::{
    Connection, ConnectionId, ConnectionMetadata, OutboundSender, RateLimitStatus,
};
use crate::error::BrokerError;
use log::{debug, info, warn};
use shared::{get_timestamp, ClientRole, ServerMessage};
use std::collections::HashMap;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

/// Per-id results of a fan-out
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<ConnectionId>,
    pub failed: Vec<(ConnectionId, BrokerError)>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregated counters over all live connections
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub total: usize,
    pub displays: usize,
    pub sensors: usize,
    pub admins: usize,
    pub unidentified: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub average_latency_ms: f64,
}

/// Manages all live connections
///
/// Connection ids start at 1 and are never reused during the lifetime of the
/// process, so a stale id can never address a newer connection.
pub struct ConnectionManager {
    connections: HashMap<ConnectionId, Connection>,
    next_connection_id: ConnectionId,
    max_connections: usize,
    rate_limit_window: Duration,
    rate_limit_max_messages: u32,
    // Totals of connections that have already gone away
    retired_messages_sent: u64,
    retired_messages_received: u64,
    retired_bytes_sent: u64,
    retired_bytes_received: u64,
    retired_errors: u64,
}

impl ConnectionManager {
    pub fn new(
        max_connections: usize,
        rate_limit_window: Duration,
        rate_limit_max_messages: u32,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_connections,
            rate_limit_window,
            rate_limit_max_messages,
            retired_messages_sent: 0,
            retired_messages_received: 0,
            retired_bytes_sent: 0,
            retired_bytes_received: 0,
            retired_errors: 0,
        }
    }

    /// Registers a new connection
    ///
    /// Fails with `ServerFull` when the live-connection count is at capacity.
    pub fn add(
        &mut self,
        sender: OutboundSender,
        metadata: ConnectionMetadata,
    ) -> Result<ConnectionId, BrokerError> {
        if self.connections.len() >= self.max_connections {
            return Err(BrokerError::ServerFull);
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        info!("Connection {} registered from {}", id, metadata.addr);
        self.connections
            .insert(id, Connection::new(id, metadata, sender));

        Ok(id)
    }

    /// Closes and forgets a connection
    ///
    /// Returns the removed connection, or None when it was already gone. The
    /// writer task receives a Close frame and then sees its channel end.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(&id)?;
        connection.close();

        self.retired_messages_sent += connection.messages_sent;
        self.retired_messages_received += connection.messages_received;
        self.retired_bytes_sent += connection.bytes_sent;
        self.retired_bytes_received += connection.bytes_received;
        self.retired_errors += connection.error_count;

        info!(
            "Connection {} ({}) removed after {:?}",
            id,
            connection.role,
            connection.connected_at.elapsed()
        );
        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    fn get_mut(&mut self, id: ConnectionId) -> Result<&mut Connection, BrokerError> {
        self.connections
            .get_mut(&id)
            .ok_or(BrokerError::ConnectionNotFound(id))
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn role(&self, id: ConnectionId) -> Result<ClientRole, BrokerError> {
        self.connections
            .get(&id)
            .map(|c| c.role)
            .ok_or(BrokerError::ConnectionNotFound(id))
    }

    /// Assigns the connection's role
    ///
    /// A role is set at most once. Re-identifying with the same role is
    /// accepted as a no-op and returns false; a different role is rejected.
    pub fn set_role(
        &mut self,
        id: ConnectionId,
        role: ClientRole,
        user_agent: Option<String>,
        version: Option<String>,
    ) -> Result<bool, BrokerError> {
        let connection = self.get_mut(id)?;

        if connection.is_identified() {
            if connection.role == role {
                return Ok(false);
            }
            return Err(BrokerError::RoleAlreadySet(connection.role));
        }

        connection.role = role;
        connection.user_agent = user_agent;
        connection.client_version = version;
        debug!("Connection {} identified as {}", id, role);
        Ok(true)
    }

    pub fn set_session(&mut self, id: ConnectionId, session_id: Option<String>) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.session_id = session_id;
        }
    }

    pub fn set_room(&mut self, id: ConnectionId, room_id: Option<String>) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.room_id = room_id;
        }
    }

    pub fn touch_activity(&mut self, id: ConnectionId) -> Result<(), BrokerError> {
        self.get_mut(id)?.touch_activity();
        Ok(())
    }

    pub fn touch_pong(&mut self, id: ConnectionId) -> Result<(), BrokerError> {
        self.get_mut(id)?.touch_pong();
        Ok(())
    }

    /// Stamps activity and counters for an inbound frame
    pub fn record_received(&mut self, id: ConnectionId, bytes: usize) -> Result<(), BrokerError> {
        self.get_mut(id)?.record_received(bytes);
        Ok(())
    }

    /// Counts one message against the connection's fixed rate window
    pub fn check_rate_limit(&mut self, id: ConnectionId) -> Result<RateLimitStatus, BrokerError> {
        let window = self.rate_limit_window;
        let max = self.rate_limit_max_messages;
        Ok(self.get_mut(id)?.rate_window.hit(window, max))
    }

    pub fn record_error(&mut self, id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.error_count += 1;
        }
    }

    /// Serializes a message and queues it for one connection
    pub fn send(&mut self, id: ConnectionId, message: &ServerMessage) -> Result<(), BrokerError> {
        let text = message
            .to_json()
            .map_err(|e| BrokerError::Internal(e.to_string()))?;
        self.send_text(id, text)
    }

    fn send_text(&mut self, id: ConnectionId, text: String) -> Result<(), BrokerError> {
        let connection = self.get_mut(id)?;
        if connection.send_raw(Message::Text(text)) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed(id))
        }
    }

    /// Sends one message to many connections
    ///
    /// The message is serialized once. Failures are collected per id and do
    /// not stop delivery to the remaining ids.
    pub fn broadcast(&mut self, ids: &[ConnectionId], message: &ServerMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();

        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                let error = BrokerError::Internal(e.to_string());
                report.failed = ids.iter().map(|id| (*id, error.clone())).collect();
                return report;
            }
        };

        for id in ids {
            match self.send_text(*id, text.clone()) {
                Ok(()) => report.delivered.push(*id),
                Err(e) => {
                    debug!("Broadcast to connection {} failed: {}", id, e);
                    report.failed.push((*id, e));
                }
            }
        }

        report
    }

    /// Sends a liveness probe to every connection
    ///
    /// Returns the ids that have not answered within twice the probe
    /// interval; those are not pinged again. The caller evicts them through
    /// the regular disconnect path.
    pub fn probe_liveness(&mut self, interval: Duration) -> Vec<ConnectionId> {
        let deadline = interval * 2;
        let ping = ServerMessage::Ping {
            timestamp: get_timestamp(),
        };
        let text = match ping.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize ping: {}", e);
                return Vec::new();
            }
        };

        let mut unresponsive = Vec::new();
        for connection in self.connections.values_mut() {
            if connection.is_unresponsive(deadline) {
                unresponsive.push(connection.id);
                continue;
            }
            if connection.send_raw(Message::Text(text.clone())) {
                connection.last_ping_sent = Some(std::time::Instant::now());
            }
        }

        unresponsive.sort_unstable();
        unresponsive
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> ConnectionStats {
        let mut stats = ConnectionStats {
            total: self.connections.len(),
            messages_sent: self.retired_messages_sent,
            messages_received: self.retired_messages_received,
            bytes_sent: self.retired_bytes_sent,
            bytes_received: self.retired_bytes_received,
            errors: self.retired_errors,
            ..ConnectionStats::default()
        };

        let mut latency_total = 0u64;
        let mut latency_samples = 0u64;

        for connection in self.connections.values() {
            match connection.role {
                ClientRole::Display => stats.displays += 1,
                ClientRole::Sensor => stats.sensors += 1,
                ClientRole::Admin => stats.admins += 1,
                ClientRole::Unknown => stats.unidentified += 1,
            }
            stats.messages_sent += connection.messages_sent;
            stats.messages_received += connection.messages_received;
            stats.bytes_sent += connection.bytes_sent;
            stats.bytes_received += connection.bytes_received;
            stats.errors += connection.error_count;

            if let Some(latency) = connection.latency_ms {
                latency_total += latency;
                latency_samples += 1;
            }
        }

        if latency_samples > 0 {
            stats.average_latency_ms = latency_total as f64 / latency_samples as f64;
        }

        stats
    }

    /// Returns the number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connections are registered
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

/// Tests cover registration, capacity, role assignment, delivery and liveness
/// probing.
#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn metadata() -> ConnectionMetadata {
        ConnectionMetadata {
            addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }

    fn manager(max: usize) -> ConnectionManager {
        ConnectionManager::new(max, Duration::from_secs(1), 5)
    }

    fn add(manager: &mut ConnectionManager) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = manager.add(tx, metadata()).unwrap();
        (id, rx)
    }

    fn next_text(rx: &mut mpsc::UnboundedReceiver<Message>) -> ServerMessage {
        match rx.try_recv().unwrap() {
            Message::Text(text) => ServerMessage::from_json(&text).unwrap(),
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_manager_creation() {
        let manager = manager(5);
        assert_eq!(manager.max_connections, 5);
        assert!(manager.is_empty());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_add_assigns_increasing_ids() {
        let mut manager = manager(3);
        let (id1, _rx1) = add(&mut manager);
        let (id2, _rx2) = add(&mut manager);

        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(manager.len(), 2);
        assert_eq!(manager.ids(), vec![1, 2]);
    }

    #[test]
    fn test_add_rejects_at_capacity() {
        let mut manager = manager(1);
        let (_id, _rx) = add(&mut manager);

        let (tx, _rx2) = mpsc::unbounded_channel();
        let result = manager.add(tx, metadata());
        assert_eq!(result, Err(BrokerError::ServerFull));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let mut manager = manager(1);
        let (id1, _rx1) = add(&mut manager);
        assert!(manager.remove(id1).is_some());

        let (id2, _rx2) = add(&mut manager);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_remove_closes_and_is_idempotent() {
        let mut manager = manager(2);
        let (id, mut rx) = add(&mut manager);

        assert!(manager.remove(id).is_some());
        assert_eq!(rx.try_recv().unwrap(), Message::Close(None));
        assert!(manager.remove(id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_set_role_once() {
        let mut manager = manager(2);
        let (id, _rx) = add(&mut manager);

        assert_eq!(manager.role(id).unwrap(), ClientRole::Unknown);
        assert!(manager
            .set_role(id, ClientRole::Sensor, Some("phone".into()), None)
            .unwrap());
        assert!(!manager.set_role(id, ClientRole::Sensor, None, None).unwrap());
        assert_eq!(
            manager.set_role(id, ClientRole::Display, None, None),
            Err(BrokerError::RoleAlreadySet(ClientRole::Sensor))
        );
        assert_eq!(manager.role(id).unwrap(), ClientRole::Sensor);
        assert_eq!(manager.get(id).unwrap().user_agent.as_deref(), Some("phone"));
    }

    #[test]
    fn test_unknown_connection_fails_fast() {
        let mut manager = manager(2);
        let ping = ServerMessage::Ping { timestamp: 1 };

        assert_eq!(manager.send(99, &ping), Err(BrokerError::ConnectionNotFound(99)));
        assert_eq!(manager.touch_pong(99), Err(BrokerError::ConnectionNotFound(99)));
        assert_eq!(manager.role(99), Err(BrokerError::ConnectionNotFound(99)));
        assert!(manager.set_role(99, ClientRole::Display, None, None).is_err());
    }

    #[test]
    fn test_send_to_closed_connection() {
        let mut manager = manager(2);
        let (id, rx) = add(&mut manager);
        drop(rx);

        let ping = ServerMessage::Ping { timestamp: 1 };
        assert_eq!(manager.send(id, &ping), Err(BrokerError::ConnectionClosed(id)));
    }

    #[test]
    fn test_send_serializes_json() {
        let mut manager = manager(2);
        let (id, mut rx) = add(&mut manager);

        manager
            .send(id, &ServerMessage::Ping { timestamp: 42 })
            .unwrap();

        assert_eq!(next_text(&mut rx), ServerMessage::Ping { timestamp: 42 });
        assert_eq!(manager.get(id).unwrap().messages_sent, 1);
    }

    #[test]
    fn test_broadcast_partial_failure() {
        let mut manager = manager(4);
        let (id1, mut rx1) = add(&mut manager);
        let (id2, rx2) = add(&mut manager);
        let (id3, mut rx3) = add(&mut manager);
        drop(rx2);

        let message = ServerMessage::Shutdown {
            reason: "test".into(),
        };
        let report = manager.broadcast(&[id1, id2, id3, 77], &message);

        assert_eq!(report.delivered, vec![id1, id3]);
        assert_eq!(report.failed.len(), 2);
        assert!(!report.all_delivered());
        assert_eq!(next_text(&mut rx1), message);
        assert_eq!(next_text(&mut rx3), message);
    }

    #[test]
    fn test_rate_limit_per_connection() {
        let mut manager = manager(2);
        let (id, _rx) = add(&mut manager);
        let (other, _rx2) = add(&mut manager);

        for _ in 0..5 {
            manager.record_received(id, 10).unwrap();
            assert_eq!(manager.check_rate_limit(id).unwrap(), RateLimitStatus::Allowed);
        }
        assert_eq!(manager.check_rate_limit(id).unwrap(), RateLimitStatus::Limited);
        assert_eq!(manager.check_rate_limit(other).unwrap(), RateLimitStatus::Allowed);
        assert_eq!(manager.get(id).unwrap().messages_received, 5);
        assert_eq!(manager.get(id).unwrap().bytes_received, 50);
        assert_eq!(manager.check_rate_limit(99), Err(BrokerError::ConnectionNotFound(99)));
    }

    #[test]
    fn test_probe_liveness_pings_and_reports_stale() {
        let mut manager = manager(3);
        let (alive, mut alive_rx) = add(&mut manager);
        let (stale, mut stale_rx) = add(&mut manager);

        manager.connections.get_mut(&stale).unwrap().last_pong_received =
            Instant::now() - Duration::from_secs(30);

        let unresponsive = manager.probe_liveness(Duration::from_secs(10));

        assert_eq!(unresponsive, vec![stale]);
        assert!(matches!(next_text(&mut alive_rx), ServerMessage::Ping { .. }));
        assert!(stale_rx.try_recv().is_err());
        assert!(manager.get(alive).unwrap().last_ping_sent.is_some());
    }

    #[test]
    fn test_stats_by_role_and_latency() {
        let mut manager = manager(4);
        let (display, _rx1) = add(&mut manager);
        let (sensor, _rx2) = add(&mut manager);
        let (_unknown, _rx3) = add(&mut manager);

        manager.set_role(display, ClientRole::Display, None, None).unwrap();
        manager.set_role(sensor, ClientRole::Sensor, None, None).unwrap();
        manager.connections.get_mut(&display).unwrap().latency_ms = Some(10);
        manager.connections.get_mut(&sensor).unwrap().latency_ms = Some(25);
        manager.record_error(sensor);

        let stats = manager.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.displays, 1);
        assert_eq!(stats.sensors, 1);
        assert_eq!(stats.unidentified, 1);
        assert_eq!(stats.errors, 1);
        assert_approx_eq!(stats.average_latency_ms, 17.5);
    }

    #[test]
    fn test_stats_keep_totals_of_removed_connections() {
        let mut manager = manager(2);
        let (id, _rx) = add(&mut manager);
        manager.record_received(id, 100).unwrap();
        manager.remove(id);

        let stats = manager.stats();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.bytes_received, 100);
    }
}
