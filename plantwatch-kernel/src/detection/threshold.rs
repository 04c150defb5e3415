//! Règle de seuil statique appliquée quand le scorer ne répond pas.
//! Verdict dégradé : confiance nulle, origine `threshold`.

use crate::models::{DetectionStatus, Verdict, VerdictOrigin};

/// Largeur de la bande d'alerte, en fraction de l'étendue [min, max]
const WARNING_BAND: f64 = 0.10;

pub fn evaluate(value: f64, min: Option<f64>, max: Option<f64>) -> Verdict {
    let margin = match (min, max) {
        (Some(lo), Some(hi)) => (hi - lo) * WARNING_BAND,
        _ => 0.0,
    };

    let (status, anomaly_type) = match (min, max) {
        (_, Some(hi)) if value > hi => (DetectionStatus::Critical, Some("threshold_high")),
        (Some(lo), _) if value < lo => (DetectionStatus::Critical, Some("threshold_low")),
        (_, Some(hi)) if margin > 0.0 && value >= hi - margin => {
            (DetectionStatus::Warning, Some("threshold_high"))
        }
        (Some(lo), _) if margin > 0.0 && value <= lo + margin => {
            (DetectionStatus::Warning, Some("threshold_low"))
        }
        _ => (DetectionStatus::Normal, None),
    };

    let score = match status {
        DetectionStatus::Critical => 1.0,
        DetectionStatus::Warning => 0.5,
        DetectionStatus::Normal | DetectionStatus::Buffering => 0.0,
    };

    Verdict {
        prediction: if status.is_alarming() { "anomaly" } else { "normal" }.to_string(),
        status,
        score,
        confidence: 0.0,
        anomaly_type: Some(anomaly_type.unwrap_or("threshold").to_string()),
        rul: None,
        model_version: None,
        origin: VerdictOrigin::Threshold,
    }
}
