/**
 * NOTIFICATIONS - Diffusion des alarmes vers l'extérieur
 *
 * RÔLE :
 * Webhook HTTP (POST JSON) et/ou topic MQTT, combinés par un fan-out.
 *
 * FONCTIONNEMENT :
 * - dispatch() lance l'envoi dans une tâche détachée : fire-and-forget
 * - Un échec de livraison est journalisé puis oublié, jamais propagé à l'ingestion
 */

use crate::models::Alarm;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use std::time::Duration;

/// Topic MQTT par défaut des alarmes
pub const DEFAULT_ALARM_TOPIC: &str = "plantwatch/alarms@v1";

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alarm: &Alarm) -> Result<(), NotificationError>;
}

/// Envoie la notification en tâche de fond, le résultat n'est que journalisé
pub fn dispatch(notifier: Arc<dyn Notifier>, alarm: Alarm) {
    tokio::spawn(async move {
        match notifier.notify(&alarm).await {
            Ok(()) => tracing::debug!(
                alarm = %alarm.id,
                alias = %alarm.alias,
                "alarm notification delivered"
            ),
            Err(e) => tracing::warn!(
                alarm = %alarm.id,
                alias = %alarm.alias,
                error = %e,
                "alarm notification failed"
            ),
        }
    });
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alarm: &Alarm) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.url)
            .json(alarm)
            .send()
            .await
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            let msg = format!("webhook answered {}", response.status());
            return Err(NotificationError::Delivery(msg));
        }
        Ok(())
    }
}

/// Publication sur le client MQTT partagé du kernel
pub struct MqttNotifier {
    client: AsyncClient,
    topic: String,
}

impl MqttNotifier {
    pub fn new(client: AsyncClient, topic: impl Into<String>) -> Self {
        Self { client, topic: topic.into() }
    }
}

#[async_trait]
impl Notifier for MqttNotifier {
    async fn notify(&self, alarm: &Alarm) -> Result<(), NotificationError> {
        let payload = serde_json::to_vec(alarm)?;
        self.client
            .publish(self.topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| NotificationError::Delivery(e.to_string()))
    }
}

/// Combine plusieurs canaux ; vide = aucune notification
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, alarm: &Alarm) -> Result<(), NotificationError> {
        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(alarm).await {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::Delivery(failures.join("; ")))
        }
    }
}
