//! Chaîne Normalizer → Router → Bridge, partagée par le polling natif et le relais MQTT.

use crate::detection::{DetectionBridge, Observation};
use crate::models::{IngestOrigin, NodeConfig, Sample, Verdict};
use crate::normalizer::{normalize, RawReading};
use crate::router::{IngestionRouter, RouteOutcome};
use crate::storage::StorageError;

/// Signaux de profil de simulation : stockés, jamais évalués
const PROFILE_ALIASES: [&str; 3] = ["simulationprofile", "profile", "simulation_profile"];

pub fn is_profile_signal(alias: &str) -> bool {
    PROFILE_ALIASES.iter().any(|p| alias.eq_ignore_ascii_case(p))
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Stocké ; `verdict` absent pour une valeur nulle ou un signal de profil
    Stored { verdict: Option<Verdict> },
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub sample: Sample,
    pub outcome: IngestOutcome,
}

pub struct IngestPipeline {
    router: IngestionRouter,
    bridge: DetectionBridge,
}

impl IngestPipeline {
    pub fn new(router: IngestionRouter, bridge: DetectionBridge) -> Self {
        Self { router, bridge }
    }

    pub fn router(&self) -> &IngestionRouter {
        &self.router
    }

    /// Seule l'erreur de stockage remonte ; la détection ne peut pas échouer
    pub async fn ingest(
        &self,
        origin: &IngestOrigin,
        node: &NodeConfig,
        raw: &RawReading,
    ) -> Result<Ingested, StorageError> {
        let sample = normalize(node, raw, origin.timestamp_source, origin.unit_policy);

        let (machine_id, sensor_id) = match self.router.route(origin, node, &sample).await? {
            RouteOutcome::Stored { machine_id, sensor_id, .. } => (machine_id, sensor_id),
            RouteOutcome::Duplicate => {
                return Ok(Ingested { sample, outcome: IngestOutcome::Duplicate });
            }
        };

        let verdict = match sample.value {
            Some(value) if !is_profile_signal(&sample.alias) => {
                let observation = Observation {
                    machine_id,
                    sensor_id,
                    node,
                    value,
                    timestamp: sample.timestamp,
                };
                Some(self.bridge.observe(observation).await)
            }
            _ => None,
        };

        Ok(Ingested { sample, outcome: IngestOutcome::Stored { verdict } })
    }
}
