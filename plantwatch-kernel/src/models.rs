/**
 * MODÈLES - Types partagés du connecteur de télémétrie
 *
 * RÔLE :
 * Configuration des sources (endpoint + liste de nodes), échantillon canonique
 * produit par le normaliseur, entités durables (machine, capteur, prédiction,
 * alarme) manipulées par le routeur et le pont de détection.
 *
 * FONCTIONNEMENT :
 * - SourceConfig/NodeConfig = ce que l'opérateur déclare (YAML ou activation)
 * - Sample = valeur éphémère produite une fois par (source, node, tick)
 * - Machine/Sensor/Prediction/Alarm = enregistrements possédés par le stockage
 */

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Tag machine utilisé quand la source n'en déclare aucun
pub const DEFAULT_ROUTING_TAG: &str = "extruder-01";

/// Plancher du timeout de lecture d'un node
const MIN_READ_TIMEOUT_MS: u64 = 50;

// ============ IDENTIFIANTS DE NODES ============

/// Clé d'une variable côté protocole : numérique ou texte
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Numeric(u32),
    String(String),
}

/// Identifiant protocolaire d'une variable (`ns=2;i=1009`, `ns=3;s=Motor.Temp`)
/// Sans `ns=` explicite, le namespace de la source s'applique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId {
    pub namespace: Option<u16>,
    pub identifier: Identifier,
}

impl NodeId {
    pub fn numeric(namespace: u16, value: u32) -> Self {
        Self { namespace: Some(namespace), identifier: Identifier::Numeric(value) }
    }

    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self { namespace: Some(namespace), identifier: Identifier::String(value.into()) }
    }

    /// Namespace effectif : celui du node, sinon la portée de la source
    pub fn namespace_or(&self, scope: u16) -> u16 {
        self.namespace.unwrap_or(scope)
    }
}

impl FromStr for NodeId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("node id cannot be empty".into());
        }

        let (namespace, rest) = match raw.strip_prefix("ns=") {
            Some(tail) => {
                let (ns, key) = tail
                    .split_once(';')
                    .ok_or_else(|| format!("node id '{raw}' is missing ';' after namespace"))?;
                let ns = ns
                    .parse::<u16>()
                    .map_err(|_| format!("invalid namespace in node id '{raw}'"))?;
                (Some(ns), key)
            }
            None => (None, raw),
        };

        let identifier = if let Some(num) = rest.strip_prefix("i=") {
            Identifier::Numeric(
                num.parse::<u32>()
                    .map_err(|_| format!("invalid numeric identifier in node id '{raw}'"))?,
            )
        } else if let Some(text) = rest.strip_prefix("s=") {
            if text.is_empty() {
                return Err(format!("empty string identifier in node id '{raw}'"));
            }
            Identifier::String(text.to_string())
        } else if let Ok(num) = rest.parse::<u32>() {
            // forme courte "1009"
            Identifier::Numeric(num)
        } else {
            return Err(format!("unsupported node id '{raw}' (expected i=<num> or s=<text>)"));
        };

        Ok(Self { namespace, identifier })
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeId> for String {
    fn from(value: NodeId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ns) = self.namespace {
            write!(f, "ns={ns};")?;
        }
        match &self.identifier {
            Identifier::Numeric(n) => write!(f, "i={n}"),
            Identifier::String(s) => write!(f, "s={s}"),
        }
    }
}

// ============ CONFIGURATION DES SOURCES ============

/// Variable déclarée pour le polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Nom canonique du capteur
    pub alias: String,
    pub unit: Option<String>,
    pub category: Option<String>,
    /// Bornes d'affichage, reprises par la règle de seuil de secours
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    #[default]
    Anonymous,
    #[serde(alias = "username_password")]
    Credentials,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Origine de l'horodatage d'un échantillon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    #[default]
    Server,
    Local,
}

/// Politique d'unité : garder celle du serveur ou imposer celle du node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitPolicy {
    #[default]
    Preserve,
    Override,
}

/// Source de télémétrie configurée : endpoint protocolaire + liste de nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "new_source_id")]
    pub id: String,
    #[serde(default = "default_source_name")]
    pub name: String,
    pub endpoint_url: String,
    #[serde(default = "default_namespace_index")]
    pub namespace_index: u16,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Budget par lecture de node, dérivé de l'intervalle si absent
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub security_mode: SecurityMode,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub timestamp_source: TimestampSource,
    #[serde(default = "enabled")]
    pub deduplication_enabled: bool,
    #[serde(default)]
    pub unit_override_policy: UnitPolicy,
    /// Machine cible ; sinon tags["machine"], sinon DEFAULT_ROUTING_TAG
    #[serde(default)]
    pub routing_tag: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub active: bool,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

fn new_source_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_source_name() -> String {
    "OPC UA Source".to_string()
}

fn default_namespace_index() -> u16 {
    2
}

fn default_polling_interval_ms() -> u64 {
    1_000
}

fn default_session_timeout_ms() -> u64 {
    60_000
}

fn enabled() -> bool {
    true
}

impl SourceConfig {
    /// Construit une source avec les valeurs par défaut des réglages
    pub fn new(
        name: impl Into<String>,
        endpoint_url: impl Into<String>,
        nodes: Vec<NodeConfig>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: new_source_id(),
            name: name.into(),
            endpoint_url: endpoint_url.into(),
            namespace_index: default_namespace_index(),
            polling_interval_ms: default_polling_interval_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            read_timeout_ms: None,
            security_mode: SecurityMode::Anonymous,
            credentials: None,
            timestamp_source: TimestampSource::Server,
            deduplication_enabled: true,
            unit_override_policy: UnitPolicy::Preserve,
            routing_tag: None,
            tags: HashMap::new(),
            nodes,
            active: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Vérifie les invariants d'une source avant enregistrement
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint_url.trim().is_empty() {
            return Err("endpoint url is required".into());
        }
        if self.nodes.is_empty() {
            return Err("at least one node must be configured".into());
        }
        if self.polling_interval_ms == 0 {
            return Err("polling interval must be greater than zero".into());
        }
        if self.session_timeout_ms == 0 {
            return Err("session timeout must be greater than zero".into());
        }
        if self.security_mode == SecurityMode::Credentials && self.credentials.is_none() {
            return Err("credentials security mode requires a username and password".into());
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.alias.trim().is_empty() {
                return Err(format!("node {} has an empty alias", node.node_id));
            }
            if !seen.insert(node.alias.as_str()) {
                return Err(format!("duplicate node alias '{}'", node.alias));
            }
            if let (Some(min), Some(max)) = (node.min, node.max) {
                if min > max {
                    return Err(format!(
                        "node '{}' has min {} greater than max {}",
                        node.alias, min, max
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn routing_tag(&self) -> String {
        self.routing_tag
            .clone()
            .or_else(|| self.tags.get("machine").cloned())
            .filter(|tag| !tag.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ROUTING_TAG.to_string())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Budget d'une lecture : explicite, sinon min(timeout session, intervalle / 2)
    pub fn read_timeout(&self) -> Duration {
        let ms = self
            .read_timeout_ms
            .unwrap_or_else(|| self.session_timeout_ms.min(self.polling_interval_ms / 2));
        Duration::from_millis(ms.max(MIN_READ_TIMEOUT_MS))
    }

    /// Politique d'ingestion portée par chaque échantillon de cette source
    pub fn origin(&self) -> IngestOrigin {
        IngestOrigin {
            source_id: self.id.clone(),
            routing_tag: self.routing_tag(),
            kind: OriginKind::Opcua,
            deduplicate: self.deduplication_enabled,
            timestamp_source: self.timestamp_source,
            unit_policy: self.unit_override_policy,
        }
    }
}

// ============ ORIGINE D'INGESTION ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OriginKind {
    Opcua,
    MqttRelay,
}

impl OriginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginKind::Opcua => "opcua",
            OriginKind::MqttRelay => "mqtt-relay",
        }
    }
}

/// Contexte commun aux deux chemins (polling natif et relais MQTT)
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOrigin {
    pub source_id: String,
    pub routing_tag: String,
    pub kind: OriginKind,
    pub deduplicate: bool,
    pub timestamp_source: TimestampSource,
    pub unit_policy: UnitPolicy,
}

// ============ ÉCHANTILLON CANONIQUE ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
        }
    }
}

/// Lecture normalisée d'un node à un instant donné
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub alias: String,
    /// `None` quand la valeur brute n'était pas numérique
    pub value: Option<f64>,
    pub unit: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub quality: Quality,
}

// ============ ENTITÉS DURABLES ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Uuid,
    /// Tag de routage, clé naturelle
    pub name: String,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub id: Uuid,
    pub machine_id: Uuid,
    /// Alias du node, clé naturelle avec machine_id
    pub alias: String,
    pub unit: Option<String>,
    pub category: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Ligne de série temporelle, clé (sensor_id, timestamp)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub sensor_id: Uuid,
    pub machine_id: Uuid,
    pub value: Option<f64>,
    pub timestamp: OffsetDateTime,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStatus {
    Normal,
    Warning,
    Critical,
    Buffering,
}

impl DetectionStatus {
    pub fn is_alarming(&self) -> bool {
        matches!(self, DetectionStatus::Warning | DetectionStatus::Critical)
    }
}

/// Qui a produit le verdict : le modèle externe ou la règle de seuil
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictOrigin {
    #[default]
    Model,
    Threshold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub prediction: String,
    pub status: DetectionStatus,
    pub score: f64,
    pub confidence: f64,
    pub anomaly_type: Option<String>,
    /// Durée de vie résiduelle estimée
    pub rul: Option<f64>,
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub origin: VerdictOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: Uuid,
    pub sensor_id: Uuid,
    pub machine_id: Uuid,
    pub sample_time: OffsetDateTime,
    pub verdict: Verdict,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn from_status(status: DetectionStatus) -> Option<Self> {
        match status {
            DetectionStatus::Warning => Some(Severity::Warning),
            DetectionStatus::Critical => Some(Severity::Critical),
            DetectionStatus::Normal | DetectionStatus::Buffering => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: Uuid,
    pub prediction_id: Uuid,
    pub sensor_id: Uuid,
    pub machine_id: Uuid,
    pub alias: String,
    pub severity: Severity,
    pub message: String,
    pub sample_time: OffsetDateTime,
    pub created_at: OffsetDateTime,
}
