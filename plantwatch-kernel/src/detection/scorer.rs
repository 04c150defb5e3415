/**
 * SCORER - Client du service de détection d'anomalies
 *
 * FONCTIONNEMENT :
 * - POST {url}/predict avec la fenêtre du capteur et sa dernière lecture
 * - Réponse validée : statut connu, score et confiance dans [0, 1]
 * - Toute erreur = "pas de verdict", le pont applique alors la règle de seuil
 */

use crate::models::{DetectionStatus, Verdict, VerdictOrigin};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("scorer unreachable: {0}")]
    Unreachable(String),
    #[error("scorer returned HTTP {0}")]
    Status(u16),
    #[error("invalid scorer response: {0}")]
    InvalidResponse(String),
}

/// Fenêtre soumise au scorer pour un capteur
#[derive(Debug, Clone, Serialize)]
pub struct ScoreRequest<'a> {
    pub machine_id: Uuid,
    pub sensor_id: Uuid,
    pub sensor: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub window: &'a [f64],
}

#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, request: &ScoreRequest<'_>) -> Result<Verdict, DetectionError>;
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default = "default_prediction")]
    prediction: String,
    status: DetectionStatus,
    score: f64,
    confidence: f64,
    #[serde(default)]
    anomaly_type: Option<String>,
    #[serde(default)]
    rul: Option<f64>,
    #[serde(default)]
    model_version: Option<String>,
}

fn default_prediction() -> String {
    "normal".to_string()
}

impl TryFrom<PredictResponse> for Verdict {
    type Error = DetectionError;

    fn try_from(r: PredictResponse) -> Result<Self, Self::Error> {
        if !(0.0..=1.0).contains(&r.score) {
            let msg = format!("score {} outside [0, 1]", r.score);
            return Err(DetectionError::InvalidResponse(msg));
        }
        if !(0.0..=1.0).contains(&r.confidence) {
            let msg = format!("confidence {} outside [0, 1]", r.confidence);
            return Err(DetectionError::InvalidResponse(msg));
        }
        if r.status == DetectionStatus::Buffering {
            let msg = "scorer answered with buffering status".to_string();
            return Err(DetectionError::InvalidResponse(msg));
        }
        Ok(Verdict {
            prediction: r.prediction,
            status: r.status,
            score: r.score,
            confidence: r.confidence,
            anomaly_type: r.anomaly_type,
            rul: r.rul,
            model_version: r.model_version,
            origin: VerdictOrigin::Model,
        })
    }
}

/// Scorer distant joint en HTTP/JSON
pub struct HttpScorer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpScorer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DetectionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectionError::Unreachable(e.to_string()))?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/predict", self.base_url)
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, request: &ScoreRequest<'_>) -> Result<Verdict, DetectionError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(|e| DetectionError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectionError::Status(status.as_u16()));
        }

        let body: PredictResponse = response
            .json()
            .await
            .map_err(|e| DetectionError::InvalidResponse(e.to_string()))?;
        Verdict::try_from(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<Verdict, DetectionError> {
        let body: PredictResponse = serde_json::from_value(value).unwrap();
        Verdict::try_from(body)
    }

    #[test]
    fn test_valid_response() {
        let v = parse(json!({
            "prediction": "anomaly", "status": "warning", "score": 0.82, "confidence": 0.9,
            "anomaly_type": "drift", "rul": 120.5, "model_version": "iforest-3"
        }))
        .unwrap();
        assert_eq!(v.status, DetectionStatus::Warning);
        assert_eq!(v.rul, Some(120.5));
        assert_eq!(v.origin, VerdictOrigin::Model);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let err =
            parse(json!({ "status": "normal", "score": 1.4, "confidence": 0.5 })).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidResponse(_)));
        let err =
            parse(json!({ "status": "normal", "score": 0.4, "confidence": -0.1 })).unwrap_err();
        assert!(matches!(err, DetectionError::InvalidResponse(_)));
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let scorer = HttpScorer::new("http://ai-service:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(scorer.endpoint(), "http://ai-service:8000/predict");
    }

    #[tokio::test]
    async fn test_unreachable_scorer() {
        // port 9 (discard) fermé en local : refus immédiat
        let scorer = HttpScorer::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let window = [1.0, 2.0];
        let req = ScoreRequest {
            machine_id: Uuid::new_v4(),
            sensor_id: Uuid::new_v4(),
            sensor: "temperature",
            timestamp: OffsetDateTime::now_utc(),
            window: &window,
        };
        assert!(matches!(scorer.score(&req).await, Err(DetectionError::Unreachable(_))));
    }
}
