/**
 * MEMORY STORE - Stockage en processus avec snapshot JSON
 *
 * FONCTIONNEMENT :
 * - Tables protégées par un seul Mutex, jamais tenu à travers un await
 * - get-or-create atomique sous ce verrou (équivalent d'une contrainte d'unicité)
 * - Rétention bornée des échantillons, prédictions et alarmes : les plus anciens
 *   sont évincés
 * - load()/flush() sérialisent l'ensemble vers un fichier JSON (data/store.json) ;
 *   flush() copie sous verrou puis sérialise sur le pool bloquant
 */

use super::{SensorSpec, Storage, StorageError};
use crate::models::{Alarm, Machine, Prediction, SampleRecord, Sensor};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use uuid::Uuid;

/// Lignes conservées par défaut dans chaque table en ajout seul, tous capteurs confondus
pub const DEFAULT_SAMPLE_RETENTION: usize = 100_000;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    machines: Vec<Machine>,
    sensors: Vec<Sensor>,
    samples: VecDeque<SampleRecord>,
    predictions: VecDeque<Prediction>,
    alarms: VecDeque<Alarm>,
    /// Index dérivé, reconstruit au chargement
    #[serde(skip)]
    latest: HashMap<Uuid, OffsetDateTime>,
}

impl Tables {
    fn reindex(&mut self) {
        self.latest.clear();
        for s in &self.samples {
            let entry = self.latest.entry(s.sensor_id).or_insert(s.timestamp);
            if s.timestamp > *entry {
                *entry = s.timestamp;
            }
        }
    }

    fn enforce_retention(&mut self, limit: usize) {
        trim_front(&mut self.samples, limit);
        trim_front(&mut self.predictions, limit);
        trim_front(&mut self.alarms, limit);
    }
}

fn trim_front<T>(rows: &mut VecDeque<T>, limit: usize) {
    while rows.len() > limit {
        rows.pop_front();
    }
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot: Option<PathBuf>,
    retention: usize,
}

impl MemoryStore {
    /// Store volatile, sans fichier de snapshot
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot: None,
            retention: DEFAULT_SAMPLE_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        {
            let mut tables = self.tables.lock();
            tables.enforce_retention(self.retention);
            tables.reindex();
        }
        self
    }

    /// Charge le snapshot s'il existe, sinon démarre vide
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut tables = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            if content.trim().is_empty() {
                Tables::default()
            } else {
                serde_json::from_str::<Tables>(&content)?
            }
        } else {
            tracing::info!(path = %path.display(), "no existing store snapshot, starting fresh");
            Tables::default()
        };
        tables.reindex();
        tracing::info!(
            machines = tables.machines.len(),
            sensors = tables.sensors.len(),
            samples = tables.samples.len(),
            "store snapshot loaded"
        );

        Ok(Self {
            tables: Mutex::new(tables),
            snapshot: Some(path),
            retention: DEFAULT_SAMPLE_RETENTION,
        })
    }

    /// Écrit le snapshot (no-op pour un store volatile)
    pub async fn flush(&self) -> Result<(), StorageError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let tables = self.tables.lock().clone();
        let content = tokio::task::spawn_blocking(move || serde_json::to_string(&tables))
            .await
            .map_err(std::io::Error::other)??;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // écriture atomique : fichier temporaire puis rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.tables.lock().machines.clone()
    }

    pub fn sensors(&self) -> Vec<Sensor> {
        self.tables.lock().sensors.clone()
    }

    pub fn samples_for(&self, sensor_id: Uuid) -> Vec<SampleRecord> {
        self.tables
            .lock()
            .samples
            .iter()
            .filter(|s| s.sensor_id == sensor_id)
            .cloned()
            .collect()
    }

    pub fn sample_count(&self) -> usize {
        self.tables.lock().samples.len()
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.tables.lock().predictions.iter().cloned().collect()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.tables.lock().alarms.iter().cloned().collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get_or_create_machine(
        &self,
        tag: &str,
        metadata: serde_json::Value,
    ) -> Result<Machine, StorageError> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.machines.iter().find(|m| m.name == tag) {
            return Ok(existing.clone());
        }
        let machine = Machine {
            id: Uuid::new_v4(),
            name: tag.to_string(),
            metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.machines.push(machine.clone());
        Ok(machine)
    }

    async fn get_or_create_sensor(
        &self,
        machine_id: Uuid,
        alias: &str,
        spec: SensorSpec<'_>,
    ) -> Result<Sensor, StorageError> {
        let mut tables = self.tables.lock();
        if !tables.machines.iter().any(|m| m.id == machine_id) {
            return Err(StorageError::Conflict(format!("unknown machine {machine_id}")));
        }
        if let Some(existing) = tables
            .sensors
            .iter()
            .find(|s| s.machine_id == machine_id && s.alias == alias)
        {
            return Ok(existing.clone());
        }
        let sensor = Sensor {
            id: Uuid::new_v4(),
            machine_id,
            alias: alias.to_string(),
            unit: spec.unit.map(str::to_string),
            category: spec.category.map(str::to_string),
            metadata: spec.metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        tables.sensors.push(sensor.clone());
        Ok(sensor)
    }

    async fn insert_sample(&self, record: SampleRecord) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        let out_of_order = tables
            .latest
            .get(&record.sensor_id)
            .is_some_and(|latest| record.timestamp <= *latest);
        if out_of_order
            && tables
                .samples
                .iter()
                .any(|s| s.sensor_id == record.sensor_id && s.timestamp == record.timestamp)
        {
            return Err(StorageError::Conflict(format!(
                "sample already stored for sensor {} at {}",
                record.sensor_id, record.timestamp
            )));
        }

        let latest = tables.latest.entry(record.sensor_id).or_insert(record.timestamp);
        if record.timestamp > *latest {
            *latest = record.timestamp;
        }
        tables.samples.push_back(record);
        trim_front(&mut tables.samples, self.retention);
        Ok(())
    }

    async fn latest_timestamp(
        &self,
        sensor_id: Uuid,
    ) -> Result<Option<OffsetDateTime>, StorageError> {
        Ok(self.tables.lock().latest.get(&sensor_id).copied())
    }

    async fn insert_prediction(&self, prediction: Prediction) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        tables.predictions.push_back(prediction);
        trim_front(&mut tables.predictions, self.retention);
        Ok(())
    }

    async fn insert_alarm(&self, alarm: Alarm) -> Result<(), StorageError> {
        let mut tables = self.tables.lock();
        tables.alarms.push_back(alarm);
        trim_front(&mut tables.alarms, self.retention);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use serde_json::json;
    use std::sync::Arc;
    use time::Duration;

    fn record(sensor: &Sensor, ts: OffsetDateTime, value: f64) -> SampleRecord {
        SampleRecord {
            sensor_id: sensor.id,
            machine_id: sensor.machine_id,
            value: Some(value),
            timestamp: ts,
            metadata: json!({ "alias": sensor.alias }),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.get_or_create_machine("LineA", json!({})).await.unwrap();
        let b = store.get_or_create_machine("LineA", json!({"other": true})).await.unwrap();
        assert_eq!(a.id, b.id);

        let s1 = store

            .get_or_create_sensor(a.id, "temperature", SensorSpec::default())

            .await

            .unwrap();
        let s2 = store
            .get_or_create_sensor(a.id, "temperature", SensorSpec::default())
            .await
            .unwrap();
        assert_eq!(s1.id, s2.id);
        assert_eq!(store.machines().len(), 1);
        assert_eq!(store.sensors().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_machine_creation() {
        let store = Arc::new(MemoryStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.get_or_create_machine("LineA", json!({})).await.unwrap().id
            }));
        }
        let mut ids = Vec::new();
        for t in tasks {
            ids.push(t.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.machines().len(), 1);
    }

    #[tokio::test]
    async fn test_sample_key_conflict_and_latest() {
        let store = MemoryStore::new();
        let m = store.get_or_create_machine("LineA", json!({})).await.unwrap();
        let s = store
            .get_or_create_sensor(m.id, "temperature", SensorSpec::default())
            .await
            .unwrap();
        let t0 = OffsetDateTime::now_utc();

        assert_eq!(store.latest_timestamp(s.id).await.unwrap(), None);
        store.insert_sample(record(&s, t0, 1.0)).await.unwrap();
        store.insert_sample(record(&s, t0 + Duration::seconds(1), 2.0)).await.unwrap();
        assert_eq!(store.latest_timestamp(s.id).await.unwrap(), Some(t0 + Duration::seconds(1)));

        let dup = store.insert_sample(record(&s, t0, 3.0)).await;
        assert!(matches!(dup, Err(StorageError::Conflict(_))));
        assert_eq!(store.sample_count(), 2);
    }

    #[tokio::test]
    async fn test_sensor_requires_known_machine() {
        let store = MemoryStore::new();
        let err = store
            .get_or_create_sensor(Uuid::new_v4(), "temperature", SensorSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let store = MemoryStore::new().with_retention(3);
        let m = store.get_or_create_machine("LineA", json!({})).await.unwrap();
        let s = store
            .get_or_create_sensor(m.id, "temperature", SensorSpec::default())
            .await
            .unwrap();
        let t0 = OffsetDateTime::now_utc();
        for i in 0..5 {
            store.insert_sample(record(&s, t0 + Duration::seconds(i), i as f64)).await.unwrap();
        }
        let kept = store.samples_for(s.id);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].value, Some(2.0));
    }

    #[tokio::test]
    async fn test_retention_bounds_predictions_and_alarms() {
        let store = MemoryStore::new().with_retention(3);
        let m = store.get_or_create_machine("LineA", json!({})).await.unwrap();
        let s = store
            .get_or_create_sensor(m.id, "temperature", SensorSpec::default())
            .await
            .unwrap();
        let t0 = OffsetDateTime::now_utc();
        for i in 0..5 {
            let prediction = Prediction {
                id: Uuid::new_v4(),
                sensor_id: s.id,
                machine_id: m.id,
                sample_time: t0 + Duration::seconds(i),
                verdict: crate::detection::threshold::evaluate(101.0, Some(0.0), Some(100.0)),
                created_at: t0,
            };
            store
                .insert_alarm(Alarm {
                    id: Uuid::new_v4(),
                    prediction_id: prediction.id,
                    sensor_id: s.id,
                    machine_id: m.id,
                    alias: s.alias.clone(),
                    severity: Severity::Critical,
                    message: format!("reading {i} out of range"),
                    sample_time: prediction.sample_time,
                    created_at: t0,
                })
                .await
                .unwrap();
            store.insert_prediction(prediction).await.unwrap();
        }

        let predictions = store.predictions();
        assert_eq!(predictions.len(), 3);
        assert_eq!(predictions[0].sample_time, t0 + Duration::seconds(2));
        let alarms = store.alarms();
        assert_eq!(alarms.len(), 3);
        assert!(alarms[0].message.contains("reading 2"));
    }

    #[tokio::test]
    async fn test_reload_applies_lower_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = MemoryStore::load(&path).await.unwrap();
        let m = store.get_or_create_machine("LineA", json!({})).await.unwrap();
        let s = store
            .get_or_create_sensor(m.id, "temperature", SensorSpec::default())
            .await
            .unwrap();
        let t0 = OffsetDateTime::now_utc();
        for i in 0..4 {
            store.insert_sample(record(&s, t0 + Duration::seconds(i), i as f64)).await.unwrap();
        }
        store.flush().await.unwrap();

        let reloaded = MemoryStore::load(&path).await.unwrap().with_retention(2);
        assert_eq!(reloaded.sample_count(), 2);
        assert_eq!(
            reloaded.latest_timestamp(s.id).await.unwrap(),
            Some(t0 + Duration::seconds(3))
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("store.json");

        let store = MemoryStore::load(&path).await.unwrap();
        let m = store.get_or_create_machine("LineA", json!({})).await.unwrap();
        let s = store
            .get_or_create_sensor(m.id, "temperature", SensorSpec::default())
            .await
            .unwrap();
        let t0 = OffsetDateTime::now_utc();
        store.insert_sample(record(&s, t0, 42.0)).await.unwrap();
        store.flush().await.unwrap();

        let reloaded = MemoryStore::load(&path).await.unwrap();
        assert_eq!(reloaded.machines().len(), 1);
        assert_eq!(reloaded.samples_for(s.id).len(), 1);
        assert_eq!(reloaded.latest_timestamp(s.id).await.unwrap(), Some(t0));
    }
}
