/**
 * CONFIGURATION - plantwatch.yaml + variables d'environnement
 *
 * FONCTIONNEMENT :
 * - Chemin via PLANTWATCH_CONFIG (défaut plantwatch.yaml)
 * - Fichier absent ou vide : valeurs par défaut ; fichier invalide : erreur au démarrage
 * - Surcharges : PLANTWATCH_SCORER_URL, PLANTWATCH_MQTT_HOST, PLANTWATCH_MQTT_PORT,
 *   PLANTWATCH_WEBHOOK_URL
 *
 * EXEMPLE :
 * ```yaml
 * scorer: { url: "http://ai-service:8000", timeout_ms: 10000 }
 * mqtt: { host: "localhost", port: 1883 }
 * sources:
 *   - name: "Extruder PLC"
 *     endpoint_url: "opc.tcp://plc-01:4840"
 *     active: true
 *     tags: { machine: "extruder-01" }
 *     nodes:
 *       - { node_id: "ns=2;i=1009", alias: "temperature", unit: "°C", min: 0, max: 100 }
 * ```
 */

use crate::models::SourceConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "plantwatch.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("invalid configuration in {}: {source}", path.display())]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("invalid value for {var}: {value}")]
    Env { var: String, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub storage: StorageConf,
    pub scorer: ScorerConf,
    pub notifications: NotificationConf,
    pub mqtt: Option<MqttConf>,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConf {
    pub data_dir: PathBuf,
    pub flush_interval_secs: u64,
    pub sample_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConf {
    pub url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConf {
    pub webhook_url: Option<String>,
    /// Topic MQTT des alarmes (nécessite la section mqtt)
    pub mqtt_topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Topics relayés vers la chaîne d'ingestion
    pub topics: Vec<String>,
}

impl Default for StorageConf {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            flush_interval_secs: 60,
            sample_retention: crate::storage::memory::DEFAULT_SAMPLE_RETENTION,
        }
    }
}

impl Default for ScorerConf {
    fn default() -> Self {
        Self { url: "http://ai-service:8000".into(), timeout_ms: 10_000 }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "plantwatch-kernel".into(),
            keep_alive_secs: 15,
            topics: vec![
                "factory/+/telemetry".into(),
                "sensors/+/telemetry".into(),
                "edge/#".into(),
            ],
        }
    }
}

impl ScorerConf {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl StorageConf {
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl KernelConfig {
    /// Applique les surcharges d'environnement (lookup injecté pour les tests)
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(url) = lookup("PLANTWATCH_SCORER_URL") {
            self.scorer.url = url;
        }
        if let Some(url) = lookup("PLANTWATCH_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(url);
        }
        if let Some(host) = lookup("PLANTWATCH_MQTT_HOST") {
            self.mqtt.get_or_insert_with(MqttConf::default).host = host;
        }
        if let Some(port) = lookup("PLANTWATCH_MQTT_PORT") {
            let parsed = port.trim().parse::<u16>().map_err(|_| ConfigError::Env {
                var: "PLANTWATCH_MQTT_PORT".into(),
                value: port.clone(),
            })?;
            self.mqtt.get_or_insert_with(MqttConf::default).port = parsed;
        }
        Ok(())
    }
}

/// Lit un fichier YAML ; absent ou vide = défauts
pub async fn load_config_from(path: &Path) -> Result<KernelConfig, ConfigError> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file, using defaults");
        return Ok(KernelConfig::default());
    }
    let txt = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("PLANTWATCH_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut cfg = load_config_from(Path::new(&path)).await?;
    cfg.apply_env(|var| std::env::var(var).ok())?;
    Ok(cfg)
}
