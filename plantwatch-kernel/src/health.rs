/**
 * HEALTH - Santé du connecteur publiée périodiquement sur MQTT
 *
 * RÔLE :
 * Suit l'état de la connexion MQTT (statut, reconnexions) et publie toutes les
 * 30 s un instantané : uptime, mémoire, statut du superviseur par source.
 */

use crate::manager::{ConnectorManager, StatusSnapshot};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub const HEALTH_TOPIC: &str = "plantwatch/connector/status@v1";

const PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct ConnectorHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub status: StatusSnapshot,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, manager: &ConnectorManager) -> ConnectorHealth {
        let status = manager.status();
        let mqtt_status = self.mqtt_status.lock().clone();
        ConnectorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status,
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            status,
        }
    }

    /// Publie la santé sur le client partagé (sa boucle est pilotée par le relais)
    pub fn spawn_health_publisher(
        &self,
        client: AsyncClient,
        manager: Arc<ConnectorManager>,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PUBLISH_INTERVAL);
            loop {
                interval.tick().await;
                let health = tracker.get_health(&manager);
                let payload = match serde_json::to_vec(&health) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize health");
                        continue;
                    }
                };
                match client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                    Ok(()) => tracing::debug!(
                        uptime = health.uptime_seconds,
                        connected = health.status.connected,
                        sources = health.status.sources.len(),
                        "published connector health"
                    ),
                    Err(e) => tracing::warn!(error = ?e, "failed to publish health"),
                }
            }
        })
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
