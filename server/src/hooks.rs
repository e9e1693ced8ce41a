//! Extension points invoked by the router after state has changed.
//!
//! Handlers are registered once when the server is composed and are called
//! outside every manager lock, so they may take their own locks freely.
//! Every method has an empty default; implement only what you need.

use serde_json::Value;
use shared::SessionInfo;
use std::sync::Arc;

/// Receives every sensor payload after it has been stored
pub trait SensorDataHandler: Send + Sync {
    fn on_sensor_data(&self, _session_id: &str, _slot: &str, _data: &Value) {}
}

/// Observes session and game lifecycle events
pub trait SessionLifecycleHandler: Send + Sync {
    fn on_session_created(&self, _session: &SessionInfo) {}

    fn on_sensor_joined(&self, _session_id: &str, _slot: &str) {}

    fn on_sensor_left(&self, _session_id: &str, _slot: &str) {}

    /// A session or room entered PLAYING
    fn on_game_started(&self, _id: &str) {}

    fn on_session_ended(&self, _session_id: &str, _reason: &str) {}
}

#[derive(Clone, Default)]
pub struct Hooks {
    sensor_data: Vec<Arc<dyn SensorDataHandler>>,
    lifecycle: Vec<Arc<dyn SessionLifecycleHandler>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sensor_data_handler(mut self, handler: Arc<dyn SensorDataHandler>) -> Self {
        self.sensor_data.push(handler);
        self
    }

    pub fn with_lifecycle_handler(mut self, handler: Arc<dyn SessionLifecycleHandler>) -> Self {
        self.lifecycle.push(handler);
        self
    }

    /// Appends another set of handlers after this one's
    pub fn merge(mut self, other: Hooks) -> Self {
        self.sensor_data.extend(other.sensor_data);
        self.lifecycle.extend(other.lifecycle);
        self
    }

    pub fn sensor_data(&self, session_id: &str, slot: &str, data: &Value) {
        for handler in &self.sensor_data {
            handler.on_sensor_data(session_id, slot, data);
        }
    }

    pub fn session_created(&self, session: &SessionInfo) {
        for handler in &self.lifecycle {
            handler.on_session_created(session);
        }
    }

    pub fn sensor_joined(&self, session_id: &str, slot: &str) {
        for handler in &self.lifecycle {
            handler.on_sensor_joined(session_id, slot);
        }
    }

    pub fn sensor_left(&self, session_id: &str, slot: &str) {
        for handler in &self.lifecycle {
            handler.on_sensor_left(session_id, slot);
        }
    }

    pub fn game_started(&self, id: &str) {
        for handler in &self.lifecycle {
            handler.on_game_started(id);
        }
    }

    pub fn session_ended(&self, session_id: &str, reason: &str) {
        for handler in &self.lifecycle {
            handler.on_session_ended(session_id, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SensorDataHandler for Recorder {
        fn on_sensor_data(&self, session_id: &str, slot: &str, data: &Value) {
            self.events
                .lock()
                .unwrap()
                .push(format!("data:{}:{}:{}", session_id, slot, data));
        }
    }

    impl SessionLifecycleHandler for Recorder {
        fn on_session_ended(&self, session_id: &str, reason: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("ended:{}:{}", session_id, reason));
        }
    }

    #[test]
    fn test_hooks_fan_out_to_every_handler() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let hooks = Hooks::new()
            .with_sensor_data_handler(first.clone())
            .with_sensor_data_handler(second.clone())
            .with_lifecycle_handler(first.clone());

        hooks.sensor_data("session_x", "left", &json!({"a": 1}));
        hooks.session_ended("session_x", "timeout");
        // Default methods are no-ops
        hooks.sensor_joined("session_x", "left");

        assert_eq!(
            *first.events.lock().unwrap(),
            vec![
                "data:session_x:left:{\"a\":1}".to_string(),
                "ended:session_x:timeout".to_string()
            ]
        );
        assert_eq!(second.events.lock().unwrap().len(), 1);
    }
}
