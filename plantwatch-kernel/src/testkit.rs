//! Doublures de test : sessions scriptées, scorer figé, notificateur
//! enregistreur, stockage défaillant à la demande.

use crate::detection::{DetectionBridge, DetectionError, ScoreRequest, Scorer};
use crate::models::{
    Alarm, DetectionStatus, Machine, NodeConfig, NodeId, Prediction, SampleRecord, Sensor,
    SourceConfig, Verdict, VerdictOrigin,
};
use crate::normalizer::{RawQuality, RawReading};
use crate::notify::{NotificationError, Notifier};
use crate::pipeline::IngestPipeline;
use crate::router::IngestionRouter;
use crate::session::{Session, SessionError, SessionFactory};
use crate::storage::{MemoryStore, SensorSpec, Storage, StorageError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

pub fn node(id: u32, alias: &str) -> NodeConfig {
    NodeConfig {
        node_id: NodeId::numeric(2, id),
        alias: alias.to_string(),
        unit: None,
        category: None,
        min: None,
        max: None,
    }
}

pub fn source(name: &str, nodes: Vec<NodeConfig>) -> SourceConfig {
    SourceConfig::new(name, "opc.tcp://localhost:4840", nodes)
}

/// Attend qu'une condition devienne vraie, false si le délai expire
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn pipeline_over(storage: Arc<dyn Storage>, scorer: StubScorer) -> Arc<IngestPipeline> {
    let router = IngestionRouter::new(storage.clone());
    let notifier = Arc::new(RecordingNotifier::default());
    let bridge = DetectionBridge::new(Arc::new(scorer), storage, notifier);
    Arc::new(IngestPipeline::new(router, bridge))
}

pub fn pipeline_with(
    scorer: StubScorer,
) -> (Arc<IngestPipeline>, Arc<MemoryStore>, Arc<StubScorer>) {
    let store = Arc::new(MemoryStore::new());
    let scorer = Arc::new(scorer);
    let router = IngestionRouter::new(store.clone());
    let notifier = Arc::new(RecordingNotifier::default());
    let bridge = DetectionBridge::new(scorer.clone(), store.clone(), notifier);
    (Arc::new(IngestPipeline::new(router, bridge)), store, scorer)
}

// ============ SESSIONS SCRIPTÉES ============

#[derive(Default)]
struct Script {
    values: HashMap<String, Value>,
    failing: HashSet<String>,
    transport_loss: HashSet<String>,
    refuse_remaining: u32,
    hang: Option<Duration>,
}

#[derive(Default)]
struct Counters {
    open_attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    reads: AtomicUsize,
}

/// Fabrique de sessions pilotée par script, partagée avec les sessions ouvertes
#[derive(Default)]
pub struct ScriptedSessions {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
}

impl ScriptedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_value(&self, alias: &str, value: Value) {
        self.script.lock().values.insert(alias.to_string(), value);
    }

    pub fn fail_node(&self, alias: &str) {
        self.script.lock().failing.insert(alias.to_string());
    }

    pub fn lose_transport_on(&self, alias: &str) {
        self.script.lock().transport_loss.insert(alias.to_string());
    }

    pub fn refuse_opens(&self, count: u32) {
        self.script.lock().refuse_remaining = count;
    }

    pub fn hang_reads(&self, duration: Duration) {
        self.script.lock().hang = Some(duration);
    }

    pub fn open_attempts(&self) -> usize {
        self.counters.open_attempts.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionFactory for ScriptedSessions {
    async fn open(&self, source: &SourceConfig) -> Result<Box<dyn Session>, SessionError> {
        self.counters.open_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script.lock();
            if script.refuse_remaining > 0 {
                script.refuse_remaining -= 1;
                let msg = format!("{} refused the connection", source.endpoint_url);
                return Err(SessionError::Refused(msg));
            }
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            script: self.script.clone(),
            counters: self.counters.clone(),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
    counters: Arc<Counters>,
    closed: bool,
}

#[async_trait]
impl Session for ScriptedSession {
    fn describe(&self) -> String {
        "scripted, anonymous".to_string()
    }

    async fn read(
        &mut self,
        node: &NodeConfig,
        _namespace: u16,
    ) -> Result<RawReading, SessionError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let (hang, outcome) = {
            let script = self.script.lock();
            let outcome = if script.transport_loss.contains(&node.alias) {
                Err(SessionError::Transport("connection reset by peer".into()))
            } else if script.failing.contains(&node.alias) {
                Err(SessionError::Node {
                    node: node.node_id.to_string(),
                    reason: format!("BadNodeIdUnknown for {}", node.alias),
                })
            } else {
                Ok(script.values.get(&node.alias).cloned().unwrap_or_else(|| json!(50.0)))
            };
            (script.hang, outcome)
        };
        if let Some(duration) = hang {
            tokio::time::sleep(duration).await;
        }
        outcome.map(|value| RawReading::new(value).with_quality(RawQuality::Code(0)))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============ SCORER FIGÉ ============

pub struct StubScorer {
    verdict: Option<Verdict>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StubScorer {
    pub fn with_status(status: DetectionStatus, score: f64) -> Self {
        Self {
            verdict: Some(Verdict {
                prediction: if status.is_alarming() { "anomaly" } else { "normal" }.to_string(),
                status,
                score,
                confidence: 0.9,
                anomaly_type: status.is_alarming().then(|| "model_drift".to_string()),
                rul: Some(240.0),
                model_version: Some("stub-1".to_string()),
                origin: VerdictOrigin::Model,
            }),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn normal() -> Self {
        Self::with_status(DetectionStatus::Normal, 0.1)
    }

    pub fn unreachable() -> Self {
        Self { verdict: None, delay: None, calls: AtomicUsize::new(0) }
    }

    /// Chaque appel répond après `delay`
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scorer for StubScorer {
    async fn score(&self, _request: &ScoreRequest<'_>) -> Result<Verdict, DetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.verdict
            .clone()
            .ok_or_else(|| DetectionError::Unreachable("connection refused".into()))
    }
}

// ============ NOTIFICATEUR ENREGISTREUR ============

#[derive(Default)]
pub struct RecordingNotifier {
    alarms: Mutex<Vec<Alarm>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self { alarms: Mutex::new(Vec::new()), fail: true }
    }

    /// Tentatives de livraison, réussies ou non
    pub fn count(&self) -> usize {
        self.alarms.lock().len()
    }

    pub fn alarms(&self) -> Vec<Alarm> {
        self.alarms.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alarm: &Alarm) -> Result<(), NotificationError> {
        self.alarms.lock().push(alarm.clone());
        if self.fail {
            return Err(NotificationError::Delivery("webhook returned 503".into()));
        }
        Ok(())
    }
}

// ============ STOCKAGE DÉFAILLANT ============

/// MemoryStore dont insert_sample échoue pour certains alias
pub struct FlakyStorage {
    inner: MemoryStore,
    failing: HashSet<String>,
}

impl FlakyStorage {
    pub fn failing_on(aliases: &[&str]) -> Self {
        Self {
            inner: MemoryStore::new(),
            failing: aliases.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn get_or_create_machine(
        &self,
        tag: &str,
        metadata: Value,
    ) -> Result<Machine, StorageError> {
        self.inner.get_or_create_machine(tag, metadata).await
    }

    async fn get_or_create_sensor(
        &self,
        machine_id: Uuid,
        alias: &str,
        spec: SensorSpec<'_>,
    ) -> Result<Sensor, StorageError> {
        self.inner.get_or_create_sensor(machine_id, alias, spec).await
    }

    async fn insert_sample(&self, record: SampleRecord) -> Result<(), StorageError> {
        let alias = record.metadata["alias"].as_str().unwrap_or_default();
        if self.failing.contains(alias) {
            return Err(StorageError::Unavailable(format!("write rejected for {alias}")));
        }
        self.inner.insert_sample(record).await
    }

    async fn latest_timestamp(
        &self,
        sensor_id: Uuid,
    ) -> Result<Option<OffsetDateTime>, StorageError> {
        self.inner.latest_timestamp(sensor_id).await
    }

    async fn insert_prediction(&self, prediction: Prediction) -> Result<(), StorageError> {
        self.inner.insert_prediction(prediction).await
    }

    async fn insert_alarm(&self, alarm: Alarm) -> Result<(), StorageError> {
        self.inner.insert_alarm(alarm).await
    }
}
