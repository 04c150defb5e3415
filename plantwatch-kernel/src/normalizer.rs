/**
 * SCHEMA NORMALIZER - Lecture brute → Sample canonique
 *
 * RÔLE :
 * Point unique où convergent les formats hétérogènes (variant OPC UA natif,
 * JSON relayé par la passerelle edge). Fonction pure, sans I/O ni état.
 *
 * RÈGLES :
 * - Coercion numérique fermée : valeur non numérique → quality bad, value None
 * - Horodatage : stamp serveur si la source le demande et le fournit, sinon réception locale
 * - Unité : celle du serveur est conservée, sauf politique override
 */

use crate::models::{NodeConfig, Quality, Sample, TimestampSource, UnitPolicy};
use serde_json::Value;
use time::OffsetDateTime;

/// Qualité telle que rapportée par la source
#[derive(Debug, Clone, PartialEq)]
pub enum RawQuality {
    /// Status code OPC UA (bits 30-31 = sévérité)
    Code(u32),
    /// Qualité textuelle des passerelles ("Good", "BadCommFailure"...)
    Text(String),
    Unknown,
}

/// Lecture d'un node avant normalisation
#[derive(Debug, Clone, PartialEq)]
pub struct RawReading {
    pub value: Value,
    pub source_timestamp: Option<OffsetDateTime>,
    pub quality: RawQuality,
    /// Unité annoncée par le serveur, si le protocole la transporte
    pub unit: Option<String>,
    pub received_at: OffsetDateTime,
}

impl RawReading {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            source_timestamp: None,
            quality: RawQuality::Unknown,
            unit: None,
            received_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_source_timestamp(mut self, ts: OffsetDateTime) -> Self {
        self.source_timestamp = Some(ts);
        self
    }

    pub fn with_quality(mut self, quality: RawQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

pub fn normalize(
    node: &NodeConfig,
    raw: &RawReading,
    timestamps: TimestampSource,
    units: UnitPolicy,
) -> Sample {
    let value = coerce_numeric(&raw.value);
    let quality = match value {
        Some(_) => decode_quality(&raw.quality),
        None => Quality::Bad,
    };

    let timestamp = match (timestamps, raw.source_timestamp) {
        (TimestampSource::Server, Some(ts)) => ts,
        _ => raw.received_at,
    };

    let unit = match units {
        UnitPolicy::Preserve => raw.unit.clone().or_else(|| node.unit.clone()),
        UnitPolicy::Override => node.unit.clone().or_else(|| raw.unit.clone()),
    }
    .filter(|u| !u.is_empty());

    Sample {
        alias: node.alias.clone(),
        value,
        unit,
        timestamp,
        quality,
    }
}

fn coerce_numeric(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::Bool(b) => {
            if *b { 1.0 } else { 0.0 }
        }
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    };
    n.is_finite().then_some(n)
}

fn decode_quality(raw: &RawQuality) -> Quality {
    match raw {
        RawQuality::Code(code) => match code >> 30 {
            0 => Quality::Good,
            1 => Quality::Uncertain,
            _ => Quality::Bad,
        },
        RawQuality::Text(text) => {
            let text = text.trim().to_ascii_lowercase();
            if text.starts_with("good") {
                Quality::Good
            } else if text.starts_with("bad") {
                Quality::Bad
            } else {
                Quality::Uncertain
            }
        }
        RawQuality::Unknown => Quality::Good,
    }
}
