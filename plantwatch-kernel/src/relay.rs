/**
 * MQTT RELAY - Chemin d'ingestion alternatif via la passerelle edge
 *
 * RÔLE :
 * Adaptateur mince : les messages JSON publiés par la passerelle sont découpés
 * en lectures brutes puis poussés dans la même chaîne Normalizer → Router → Bridge
 * que le polling natif (origine `mqtt-relay`).
 *
 * FORMATS ACCEPTÉS :
 * - Multi-capteurs : { timestamp, machineId, profile, temperature, vibration, pressure,
 *   motorCurrent, wearIndex }
 * - Lecture unique : { machine_id, sensor_id, value, unit?, quality?, timestamp? }
 * Machine absente du payload : segment du topic (factory/<machine>/telemetry,
 * sensors/<machine>/telemetry).
 *
 * FONCTIONNEMENT :
 * - La boucle d'événements rumqttc ne fait que router les publish vers une file
 * - Une tâche consommatrice ingère dans l'ordre d'arrivée
 * - Message malformé : journalisé puis ignoré
 */

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::{
    Identifier, IngestOrigin, NodeConfig, NodeId, OriginKind, TimestampSource, UnitPolicy,
};
use crate::normalizer::{RawQuality, RawReading};
use crate::pipeline::{IngestOutcome, IngestPipeline};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Capteurs de la passerelle edge : clé JSON, alias canonique, unité
const GATEWAY_SENSORS: [(&str, &str, &str); 5] = [
    ("temperature", "temperature", "°C"),
    ("vibration", "vibration", "mm/s"),
    ("pressure", "pressure", "bar"),
    ("motorCurrent", "motor_current", "A"),
    ("wearIndex", "wear_index", "%"),
];

/// Champs d'enveloppe, jamais interprétés comme capteurs
const ENVELOPE_KEYS: [&str; 9] = [
    "timestamp",
    "machineId",
    "machine_id",
    "sensorId",
    "sensor_id",
    "unit",
    "quality",
    "value",
    "source",
];

const QUEUE_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("no machine id in payload or topic '{0}'")]
    MissingMachine(String),
    #[error("single reading payload without sensor_id")]
    MissingSensor,
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
    #[error("no sensor readings in payload")]
    NoReadings,
}

/// Lecture extraite d'un message relayé
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedReading {
    pub machine: String,
    pub node: NodeConfig,
    pub raw: RawReading,
}

impl RelayedReading {
    pub fn origin(&self, topic: &str) -> IngestOrigin {
        IngestOrigin {
            source_id: format!("mqtt:{topic}"),
            routing_tag: self.machine.clone(),
            kind: OriginKind::MqttRelay,
            deduplicate: true,
            timestamp_source: TimestampSource::Server,
            unit_policy: UnitPolicy::Preserve,
        }
    }
}

pub fn parse_gateway_payload(
    topic: &str,
    payload: &[u8],
) -> Result<Vec<RelayedReading>, RelayError> {
    let value: Value = serde_json::from_slice(payload)?;
    let Value::Object(obj) = value else {
        return Err(RelayError::NotAnObject);
    };

    let machine = text(&obj, &["machine_id", "machineId"])
        .or_else(|| machine_from_topic(topic))
        .ok_or_else(|| RelayError::MissingMachine(topic.to_string()))?;

    let received_at = OffsetDateTime::now_utc();
    let stamped = parse_timestamp(obj.get("timestamp"))?;
    let reading = |value: Value| {
        let mut raw = RawReading::new(value);
        raw.received_at = received_at;
        raw.source_timestamp = stamped;
        raw
    };

    if let Some(value) = obj.get("value") {
        let alias = text(&obj, &["sensor_id", "sensorId"]).ok_or(RelayError::MissingSensor)?;
        let mut raw = reading(value.clone());
        if let Some(q) = obj.get("quality").and_then(Value::as_str) {
            raw = raw.with_quality(RawQuality::Text(q.to_string()));
        }
        if let Some(unit) = obj.get("unit").and_then(Value::as_str) {
            raw = raw.with_unit(unit);
        }
        return Ok(vec![RelayedReading { machine, node: relay_node(&alias, &alias, None), raw }]);
    }

    let readings: Vec<RelayedReading> = obj
        .iter()
        .filter(|(key, _)| !ENVELOPE_KEYS.contains(&key.as_str()))
        .filter(|(_, value)| is_scalar_reading(value))
        .map(|(key, value)| {
            let (alias, unit) = match GATEWAY_SENSORS.iter().find(|(k, _, _)| k == key) {
                Some((_, alias, unit)) => (alias.to_string(), Some(*unit)),
                None => (snake_case(key), None),
            };
            RelayedReading {
                machine: machine.clone(),
                node: relay_node(key, &alias, unit),
                raw: reading(value.clone()),
            }
        })
        .collect();

    if readings.is_empty() {
        return Err(RelayError::NoReadings);
    }
    Ok(readings)
}

fn text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn machine_from_topic(topic: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts.as_slice() {
        ["factory" | "sensors", machine, "telemetry"] if !machine.is_empty() && *machine != "+" => {
            Some(machine.to_string())
        }
        _ => None,
    }
}

/// RFC 3339 ou epoch en secondes (fractionnaires) ; absent = None
fn parse_timestamp(value: Option<&Value>) -> Result<Option<OffsetDateTime>, RelayError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => OffsetDateTime::parse(s, &Rfc3339)
            .map(Some)
            .map_err(|_| RelayError::Timestamp(s.clone())),
        Some(Value::Number(n)) => {
            let secs = n.as_f64().ok_or_else(|| RelayError::Timestamp(n.to_string()))?;
            OffsetDateTime::from_unix_timestamp_nanos((secs * 1e9) as i128)
                .map(Some)
                .map_err(|_| RelayError::Timestamp(n.to_string()))
        }
        Some(other) => Err(RelayError::Timestamp(other.to_string())),
    }
}

fn is_scalar_reading(value: &Value) -> bool {
    match value {
        Value::Number(_) | Value::Bool(_) | Value::Null => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn relay_node(key: &str, alias: &str, unit: Option<&str>) -> NodeConfig {
    NodeConfig {
        node_id: NodeId { namespace: None, identifier: Identifier::String(key.to_string()) },
        alias: alias.to_string(),
        unit: unit.map(str::to_string),
        category: Some("gateway".to_string()),
        min: None,
        max: None,
    }
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Filtre MQTT (`+` = un niveau, `#` = reste du topic)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut topic_levels = topic.split('/');
    for level in filter.split('/') {
        match level {
            "#" => return true,
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            exact => {
                if topic_levels.next() != Some(exact) {
                    return false;
                }
            }
        }
    }
    topic_levels.next().is_none()
}

// ============ CLIENT ET BOUCLE MQTT ============

pub fn create_mqtt_client(cfg: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&cfg.client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    AsyncClient::new(opts, 10)
}

/// Pilote la boucle d'événements du client partagé et relaie la télémétrie
pub fn spawn_relay_listener(
    client: AsyncClient,
    mut eventloop: EventLoop,
    topics: Vec<String>,
    pipeline: Arc<IngestPipeline>,
    health: HealthTracker,
) -> JoinHandle<()> {
    let (tx, rx) = mpsc::channel::<(String, Vec<u8>)>(QUEUE_DEPTH);
    tokio::spawn(consume(rx, pipeline));

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    // (re)souscription à chaque connexion, session propre côté broker
                    for topic in &topics {
                        if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                            tracing::error!(topic = %topic, error = ?e, "mqtt subscribe failed");
                        } else {
                            tracing::info!(topic = %topic, "subscribed to relay topic");
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    if !topics.iter().any(|f| topic_matches(f, &p.topic)) {
                        continue;
                    }
                    if tx.try_send((p.topic.clone(), p.payload.to_vec())).is_err() {
                        tracing::warn!(topic = %p.topic, "relay queue full, message dropped");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = ?e, "mqtt connection error");
                    health.mark_mqtt_disconnected();
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

async fn consume(mut rx: mpsc::Receiver<(String, Vec<u8>)>, pipeline: Arc<IngestPipeline>) {
    while let Some((topic, payload)) = rx.recv().await {
        relay_message(&pipeline, &topic, &payload).await;
    }
}

/// Ingère un message relayé ; renvoie le nombre d'échantillons stockés
pub async fn relay_message(pipeline: &IngestPipeline, topic: &str, payload: &[u8]) -> usize {
    let readings = match parse_gateway_payload(topic, payload) {
        Ok(readings) => readings,
        Err(e) => {
            tracing::warn!(topic = %topic, error = %e, "malformed relay message dropped");
            return 0;
        }
    };

    let mut stored = 0;
    for reading in &readings {
        let origin = reading.origin(topic);
        match pipeline.ingest(&origin, &reading.node, &reading.raw).await {
            Ok(ingested) if matches!(ingested.outcome, IngestOutcome::Stored { .. }) => stored += 1,
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    topic = %topic,
                    alias = %reading.node.alias,
                    error = %e,
                    "relayed sample dropped, storage failure"
                );
            }
        }
    }
    tracing::debug!(
        topic = %topic,
        machine = %readings[0].machine,
        readings = readings.len(),
        stored,
        "relay message ingested"
    );
    stored
}
