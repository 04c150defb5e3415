/**
 * DETECTION BRIDGE - Fenêtre glissante → scorer → prédiction / alarme
 *
 * RÔLE :
 * Alimente la fenêtre de chaque capteur, interroge le scorer externe quand
 * assez de valeurs sont tamponnées, persiste la prédiction et lève une alarme
 * (plus notification) sur warning/critical.
 *
 * FONCTIONNEMENT :
 * - Moins de MIN_WINDOW valeurs : verdict `buffering`, aucune écriture
 * - Scorer injoignable ou réponse invalide : règle de seuil sur [min, max] du node
 * - Aucune erreur ne remonte : stockage et notification sont journalisés puis ignorés
 */

pub mod scorer;
pub mod threshold;
pub mod window;

use crate::models::{
    Alarm, DetectionStatus, NodeConfig, Prediction, Severity, Verdict, VerdictOrigin,
};
use crate::notify::{self, Notifier};
use crate::storage::Storage;
use dashmap::DashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

pub use scorer::{DetectionError, HttpScorer, ScoreRequest, Scorer};
pub use window::{SlidingWindow, WINDOW_CAPACITY};

/// Valeurs tamponnées requises avant le premier appel au scorer
pub const MIN_WINDOW: usize = 12;

/// Lecture d'un capteur déjà persistée, prête pour la détection
#[derive(Debug, Clone)]
pub struct Observation<'a> {
    pub machine_id: Uuid,
    pub sensor_id: Uuid,
    pub node: &'a NodeConfig,
    pub value: f64,
    pub timestamp: OffsetDateTime,
}

pub struct DetectionBridge {
    windows: DashMap<Uuid, SlidingWindow>,
    scorer: Arc<dyn Scorer>,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
}

impl DetectionBridge {
    pub fn new(
        scorer: Arc<dyn Scorer>,
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { windows: DashMap::new(), scorer, storage, notifier }
    }

    pub async fn observe(&self, obs: Observation<'_>) -> Verdict {
        // verrou DashMap relâché avant tout await
        let window = {
            let mut w = self.windows.entry(obs.sensor_id).or_default();
            w.push(obs.value);
            (w.len() >= MIN_WINDOW).then(|| w.to_vec())
        };
        let Some(window) = window else {
            return buffering_verdict();
        };

        let request = ScoreRequest {
            machine_id: obs.machine_id,
            sensor_id: obs.sensor_id,
            sensor: &obs.node.alias,
            timestamp: obs.timestamp,
            window: &window,
        };
        let verdict = match self.scorer.score(&request).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(
                    alias = %obs.node.alias,
                    error = %e,
                    "scorer failed, using threshold fallback"
                );
                threshold::evaluate(obs.value, obs.node.min, obs.node.max)
            }
        };

        let now = OffsetDateTime::now_utc();
        let prediction = Prediction {
            id: Uuid::new_v4(),
            sensor_id: obs.sensor_id,
            machine_id: obs.machine_id,
            sample_time: obs.timestamp,
            verdict: verdict.clone(),
            created_at: now,
        };
        let prediction_id = prediction.id;
        if let Err(e) = self.storage.insert_prediction(prediction).await {
            tracing::error!(alias = %obs.node.alias, error = %e, "failed to persist prediction");
        }

        if let Some(severity) = Severity::from_status(verdict.status) {
            let alarm = Alarm {
                id: Uuid::new_v4(),
                prediction_id,
                sensor_id: obs.sensor_id,
                machine_id: obs.machine_id,
                alias: obs.node.alias.clone(),
                severity,
                message: alarm_message(&obs, &verdict),
                sample_time: obs.timestamp,
                created_at: now,
            };
            tracing::warn!(
                alias = %alarm.alias,
                severity = ?severity,
                score = verdict.score,
                "alarm raised"
            );
            if let Err(e) = self.storage.insert_alarm(alarm.clone()).await {
                tracing::error!(alias = %obs.node.alias, error = %e, "failed to persist alarm");
            }
            notify::dispatch(self.notifier.clone(), alarm);
        }

        verdict
    }

    /// Nombre de valeurs tamponnées pour un capteur
    pub fn buffered(&self, sensor_id: Uuid) -> usize {
        self.windows.get(&sensor_id).map(|w| w.len()).unwrap_or(0)
    }
}

fn buffering_verdict() -> Verdict {
    Verdict {
        prediction: "buffering".to_string(),
        status: DetectionStatus::Buffering,
        score: 0.0,
        confidence: 0.0,
        anomaly_type: None,
        rul: None,
        model_version: None,
        origin: VerdictOrigin::Model,
    }
}

fn alarm_message(obs: &Observation<'_>, verdict: &Verdict) -> String {
    let unit = obs.node.unit.as_deref().unwrap_or("");
    let basis = match verdict.origin {
        VerdictOrigin::Model => "model",
        VerdictOrigin::Threshold => "threshold rule",
    };
    format!(
        "{} {:?} on {}: value {}{} (score {:.2}, {})",
        verdict.anomaly_type.as_deref().unwrap_or("anomaly"),
        verdict.status,
        obs.node.alias,
        obs.value,
        if unit.is_empty() { String::new() } else { format!(" {unit}") },
        verdict.score,
        basis,
    )
}
