/**
 * STOCKAGE - Interface de persistance consommée par le routeur et le pont de détection
 *
 * RÔLE :
 * Machines et capteurs auto-provisionnés (get-or-create idempotent), série
 * temporelle des échantillons, prédictions et alarmes en ajout seul.
 *
 * CONTRAT :
 * - get_or_create_* doivent rester corrects sous courses concurrentes
 * - Un échantillon est unique par (sensor_id, timestamp)
 * - Le connecteur crée et lit, ne supprime jamais
 */

use crate::models::{Alarm, Machine, Prediction, SampleRecord, Sensor};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

pub mod memory;

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Attributs d'un capteur à la création (ignorés s'il existe déjà)
#[derive(Debug, Clone, Default)]
pub struct SensorSpec<'a> {
    pub unit: Option<&'a str>,
    pub category: Option<&'a str>,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_or_create_machine(
        &self,
        tag: &str,
        metadata: serde_json::Value,
    ) -> Result<Machine, StorageError>;

    async fn get_or_create_sensor(
        &self,
        machine_id: Uuid,
        alias: &str,
        spec: SensorSpec<'_>,
    ) -> Result<Sensor, StorageError>;

    async fn insert_sample(&self, record: SampleRecord) -> Result<(), StorageError>;

    async fn latest_timestamp(
        &self,
        sensor_id: Uuid,
    ) -> Result<Option<OffsetDateTime>, StorageError>;

    async fn insert_prediction(&self, prediction: Prediction) -> Result<(), StorageError>;

    async fn insert_alarm(&self, alarm: Alarm) -> Result<(), StorageError>;
}
