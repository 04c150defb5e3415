//! État d'exécution par source, possédé par le worker et lu par `status()`.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Phase de la machine à états d'un worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Idle,
    Connecting,
    Polling,
    Disconnected,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    pub phase: WorkerPhase,
    pub connected: bool,
    /// Dernier cycle de polling ayant lu au moins un node
    pub heartbeat: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    /// Passages en Disconnected depuis le démarrage du worker
    pub disconnects: u64,
    pub node_count: usize,
    pub cycles: u64,
}

impl ConnectionState {
    pub fn new(node_count: usize) -> Self {
        Self {
            phase: WorkerPhase::Idle,
            connected: false,
            heartbeat: None,
            last_error: None,
            consecutive_failures: 0,
            disconnects: 0,
            node_count,
            cycles: 0,
        }
    }

    pub fn mark_connecting(&mut self) {
        self.phase = WorkerPhase::Connecting;
    }

    /// Session ouverte ; les échecs ne sont effacés qu'au premier cycle réussi
    pub fn mark_connected(&mut self) {
        self.phase = WorkerPhase::Polling;
        self.connected = true;
    }

    pub fn mark_disconnected(&mut self, error: impl Into<String>) {
        self.phase = WorkerPhase::Disconnected;
        self.connected = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.disconnects += 1;
        self.last_error = Some(error.into());
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Fin d'un cycle où au moins un node a répondu
    pub fn beat(&mut self, at: OffsetDateTime) {
        self.heartbeat = Some(at);
        self.consecutive_failures = 0;
        self.cycles += 1;
    }

    pub fn mark_stopped(&mut self) {
        self.phase = WorkerPhase::Stopped;
        self.connected = false;
    }
}
