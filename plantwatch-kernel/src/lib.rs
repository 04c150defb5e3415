/**
 * PLANTWATCH KERNEL - Connecteur de télémétrie industrielle
 *
 * RÔLE : Registre des sources, polling OPC UA par source, normalisation,
 * routage vers le stockage, pont de détection d'anomalies, relais MQTT.
 *
 * FLUX : Worker → Normalizer → Router → Bridge (aucun appel remontant).
 */

pub mod config;
pub mod detection;
pub mod health;
pub mod manager;
pub mod models;
pub mod normalizer;
pub mod notify;
pub mod pipeline;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod state;
pub mod storage;
pub mod worker;

#[cfg(test)]
mod testkit;

pub use manager::{Activation, ConnectorManager, StatusSnapshot, TestReport};
pub use models::{NodeConfig, Sample, SourceConfig};
pub use registry::{RegistryError, SourceRegistry};
