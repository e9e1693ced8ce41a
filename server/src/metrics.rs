use crate::connection_manager::ConnectionStats;
use crate::hooks::{SensorDataHandler, SessionLifecycleHandler};
use serde_json::Value;
use shared::{MetricsSnapshot, SessionInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Table sizes sampled under the manager locks
#[derive(Debug, Clone, Copy, Default)]
pub struct TableCounts {
    pub active_sessions: usize,
    pub playing_sessions: usize,
    pub active_rooms: usize,
    pub players_in_rooms: usize,
}

/// Lifetime counters fed through the hook traits
#[derive(Debug)]
pub struct BrokerMetrics {
    started_at: Instant,
    sessions_created: AtomicU64,
    sessions_ended: AtomicU64,
    games_started: AtomicU64,
    sensor_frames: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            sessions_created: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
            games_started: AtomicU64::new(0),
            sensor_frames: AtomicU64::new(0),
        }
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created.load(Ordering::Relaxed)
    }

    pub fn sessions_ended(&self) -> u64 {
        self.sessions_ended.load(Ordering::Relaxed)
    }

    pub fn games_started(&self) -> u64 {
        self.games_started.load(Ordering::Relaxed)
    }

    pub fn sensor_frames(&self) -> u64 {
        self.sensor_frames.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, connections: &ConnectionStats, tables: TableCounts) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.started_at.elapsed().as_secs(),
            connections: connections.total,
            displays: connections.displays,
            sensors: connections.sensors,
            admins: connections.admins,
            unidentified: connections.unidentified,
            messages_received: connections.messages_received,
            messages_sent: connections.messages_sent,
            bytes_received: connections.bytes_received,
            bytes_sent: connections.bytes_sent,
            errors: connections.errors,
            average_latency_ms: connections.average_latency_ms,
            active_sessions: tables.active_sessions,
            playing_sessions: tables.playing_sessions,
            active_rooms: tables.active_rooms,
            players_in_rooms: tables.players_in_rooms,
            sessions_created: self.sessions_created(),
            sessions_ended: self.sessions_ended(),
            games_started: self.games_started(),
            sensor_frames: self.sensor_frames(),
        }
    }
}

impl Default for BrokerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorDataHandler for BrokerMetrics {
    fn on_sensor_data(&self, _session_id: &str, _slot: &str, _data: &Value) {
        self.sensor_frames.fetch_add(1, Ordering::Relaxed);
    }
}

impl SessionLifecycleHandler for BrokerMetrics {
    fn on_session_created(&self, _session: &SessionInfo) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    fn on_game_started(&self, _id: &str) {
        self.games_started.fetch_add(1, Ordering::Relaxed);
    }

    fn on_session_ended(&self, _session_id: &str, _reason: &str) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use serde_json::json;

    #[test]
    fn test_counters_follow_hooks() {
        let metrics = BrokerMetrics::new();

        metrics.on_sensor_data("s", "main", &json!({}));
        metrics.on_sensor_data("s", "main", &json!({}));
        metrics.on_game_started("s");
        metrics.on_session_ended("s", "done");

        assert_eq!(metrics.sensor_frames(), 2);
        assert_eq!(metrics.games_started(), 1);
        assert_eq!(metrics.sessions_ended(), 1);
        assert_eq!(metrics.sessions_created(), 0);
    }

    #[test]
    fn test_snapshot_merges_sources() {
        let metrics = BrokerMetrics::new();
        let connections = ConnectionStats {
            total: 3,
            displays: 1,
            sensors: 2,
            average_latency_ms: 12.5,
            ..ConnectionStats::default()
        };
        let tables = TableCounts {
            active_sessions: 1,
            playing_sessions: 1,
            ..TableCounts::default()
        };

        let snapshot = metrics.snapshot(&connections, tables);
        assert_eq!(snapshot.connections, 3);
        assert_eq!(snapshot.sensors, 2);
        assert_eq!(snapshot.active_sessions, 1);
        assert_eq!(snapshot.active_rooms, 0);
        assert_approx_eq!(snapshot.average_latency_ms, 12.5);
    }
}
