/**
 * INGESTION ROUTER - Échantillon canonique → série temporelle
 *
 * RÔLE :
 * Garantit l'existence de la machine (tag de routage) et du capteur (alias)
 * puis persiste l'échantillon, en écartant les horodatages déjà vus.
 *
 * FONCTIONNEMENT :
 * - Création sérialisée par verrou async indexé (un par tag, un par (machine, alias)) :
 *   au plus une création même si plusieurs sources arrivent en même temps
 * - Caches DashMap des entités résolues, le stockage n'est interrogé qu'au premier passage
 * - Déduplication : horodatage <= dernier stocké ⇒ Duplicate, pas une erreur
 */

use crate::models::{IngestOrigin, Machine, NodeConfig, Sample, SampleRecord, Sensor};
use crate::storage::{SensorSpec, Storage, StorageError};
use dashmap::DashMap;
use serde_json::json;
use std::hash::Hash;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Stored { machine_id: Uuid, sensor_id: Uuid, timestamp: OffsetDateTime },
    Duplicate,
}

/// Verrous async à la demande, un par clé
struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    fn new() -> Self {
        Self { locks: DashMap::new() }
    }

    fn for_key(&self, key: &K) -> Arc<Mutex<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }
}

pub struct IngestionRouter {
    storage: Arc<dyn Storage>,
    machines: DashMap<String, Machine>,
    sensors: DashMap<(Uuid, String), Sensor>,
    machine_locks: KeyedLocks<String>,
    sensor_locks: KeyedLocks<(Uuid, String)>,
}

impl IngestionRouter {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            machines: DashMap::new(),
            sensors: DashMap::new(),
            machine_locks: KeyedLocks::new(),
            sensor_locks: KeyedLocks::new(),
        }
    }

    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    pub async fn route(
        &self,
        origin: &IngestOrigin,
        node: &NodeConfig,
        sample: &Sample,
    ) -> Result<RouteOutcome, StorageError> {
        let machine = self.resolve_machine(origin).await?;
        let sensor = self.resolve_sensor(&machine, node, sample, origin).await?;

        if origin.deduplicate {
            if let Some(latest) = self.storage.latest_timestamp(sensor.id).await? {
                if sample.timestamp <= latest {
                    tracing::debug!(
                        source = %origin.source_id,
                        alias = %sample.alias,
                        timestamp = %sample.timestamp,
                        "duplicate sample skipped"
                    );
                    return Ok(RouteOutcome::Duplicate);
                }
            }
        }

        let record = SampleRecord {
            sensor_id: sensor.id,
            machine_id: machine.id,
            value: sample.value,
            timestamp: sample.timestamp,
            metadata: json!({
                "alias": sample.alias,
                "unit": sample.unit,
                "origin": origin.kind.as_str(),
                "quality": sample.quality.as_str(),
                "source_id": origin.source_id,
                "node_id": node.node_id.to_string(),
            }),
        };
        self.storage.insert_sample(record).await?;

        Ok(RouteOutcome::Stored {
            machine_id: machine.id,
            sensor_id: sensor.id,
            timestamp: sample.timestamp,
        })
    }

    async fn resolve_machine(&self, origin: &IngestOrigin) -> Result<Machine, StorageError> {
        let tag = &origin.routing_tag;
        if let Some(cached) = self.machines.get(tag) {
            return Ok(cached.clone());
        }

        let lock = self.machine_locks.for_key(tag);
        let _guard = lock.lock().await;
        if let Some(cached) = self.machines.get(tag) {
            return Ok(cached.clone());
        }

        let machine = self
            .storage
            .get_or_create_machine(
                tag,
                json!({
                    "auto_provisioned": true,
                    "origin": origin.kind.as_str(),
                    "source_id": origin.source_id,
                }),
            )
            .await?;
        tracing::info!(machine = %machine.name, id = %machine.id, "machine resolved");
        self.machines.insert(tag.clone(), machine.clone());
        Ok(machine)
    }

    async fn resolve_sensor(
        &self,
        machine: &Machine,
        node: &NodeConfig,
        sample: &Sample,
        origin: &IngestOrigin,
    ) -> Result<Sensor, StorageError> {
        let key = (machine.id, sample.alias.clone());
        if let Some(cached) = self.sensors.get(&key) {
            return Ok(cached.clone());
        }

        let lock = self.sensor_locks.for_key(&key);
        let _guard = lock.lock().await;
        if let Some(cached) = self.sensors.get(&key) {
            return Ok(cached.clone());
        }

        let spec = SensorSpec {
            unit: sample.unit.as_deref().or(node.unit.as_deref()),
            category: node.category.as_deref(),
            metadata: json!({
                "node_id": node.node_id.to_string(),
                "origin": origin.kind.as_str(),
                "min": node.min,
                "max": node.max,
            }),
        };
        let sensor = self.storage.get_or_create_sensor(machine.id, &sample.alias, spec).await?;
        tracing::info!(
            machine = %machine.name,
            alias = %sensor.alias,
            id = %sensor.id,
            "sensor resolved"
        );
        self.sensors.insert(key, sensor.clone());
        Ok(sensor)
    }
}
