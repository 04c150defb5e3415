/**
 * CONNECTOR WORKER - Boucle de polling d'une source active
 *
 * RÔLE :
 * Une tâche tokio par source : ouvre la session, lit chaque node à intervalle
 * fixe et pousse chaque lecture dans la chaîne d'ingestion.
 *
 * MACHINE À ÉTATS :
 * Idle → Connecting → Polling → (Disconnected → Connecting)* → Stopped
 * - Échec d'ouverture (timeout, refus, auth) : Disconnected, nouvel essai après un intervalle
 * - Échec d'un node : journalisé, le cycle continue
 * - Tous les nodes en échec ou perte de transport : Disconnected immédiatement
 * - Signal d'arrêt : lecture ou ingestion en cours abandonnée, session fermée, Stopped
 *
 * Les erreurs ne sortent jamais de la tâche : seul l'état partagé les expose.
 */

use crate::models::SourceConfig;
use crate::pipeline::{IngestOutcome, IngestPipeline};
use crate::session::{Session, SessionError, SessionFactory};
use crate::state::{ConnectionState, Shared};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{timeout, MissedTickBehavior};

/// Bilan d'un cycle de polling
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub read_ok: usize,
    pub read_failed: usize,
    pub routed: usize,
    pub duplicates: usize,
    pub storage_failed: usize,
    /// Session perdue en cours de cycle (reste du cycle abandonné)
    pub lost: bool,
    pub stopped: bool,
}

enum SessionEnd {
    Stopped,
    Disconnected,
}

pub struct ConnectorWorker {
    source: SourceConfig,
    sessions: Arc<dyn SessionFactory>,
    pipeline: Arc<IngestPipeline>,
    state: Shared<ConnectionState>,
    stop: watch::Receiver<bool>,
}

impl ConnectorWorker {
    pub fn new(
        source: SourceConfig,
        sessions: Arc<dyn SessionFactory>,
        pipeline: Arc<IngestPipeline>,
        state: Shared<ConnectionState>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self { source, sessions, pipeline, state, stop }
    }

    pub async fn run(mut self) {
        let source_id = self.source.id.clone();
        tracing::info!(
            source = %source_id,
            endpoint = %self.source.endpoint_url,
            nodes = self.source.nodes.len(),
            "worker started"
        );

        loop {
            if self.stop_requested() {
                break;
            }
            self.state.lock().mark_connecting();

            let opened = tokio::select! {
                biased;
                _ = wait_stop(&mut self.stop) => break,
                r = timeout(self.source.session_timeout(), self.sessions.open(&self.source)) => {
                    r.unwrap_or_else(|_| Err(SessionError::Timeout(self.source.session_timeout())))
                }
            };

            match opened {
                Ok(mut session) => {
                    tracing::info!(
                        source = %source_id,
                        session = %session.describe(),
                        "session established"
                    );
                    self.state.lock().mark_connected();
                    let end = self.poll_session(session.as_mut()).await;
                    session.close().await;
                    if matches!(end, SessionEnd::Stopped) {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(source = %source_id, error = %e, "session open failed");
                    self.state.lock().mark_disconnected(e.to_string());
                }
            }

            // pas de backoff dédié : l'intervalle de polling cadence les reconnexions
            tokio::select! {
                biased;
                _ = wait_stop(&mut self.stop) => break,
                _ = tokio::time::sleep(self.source.polling_interval()) => {}
            }
        }

        self.state.lock().mark_stopped();
        tracing::info!(source = %source_id, "worker stopped");
    }

    async fn poll_session(&mut self, session: &mut dyn Session) -> SessionEnd {
        let mut ticker = tokio::time::interval(self.source.polling_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = wait_stop(&mut self.stop) => return SessionEnd::Stopped,
                _ = ticker.tick() => {}
            }

            let report = self.poll_cycle(session).await;
            if report.stopped {
                return SessionEnd::Stopped;
            }

            if report.lost || report.read_ok == 0 {
                let reason = self
                    .state
                    .lock()
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "all node reads failed".to_string());
                tracing::warn!(
                    source = %self.source.id,
                    lost = report.lost,
                    failed = report.read_failed,
                    "source disconnected"
                );
                self.state.lock().mark_disconnected(reason);
                return SessionEnd::Disconnected;
            }

            self.state.lock().beat(OffsetDateTime::now_utc());
            tracing::debug!(
                source = %self.source.id,
                ok = report.read_ok,
                failed = report.read_failed,
                routed = report.routed,
                duplicates = report.duplicates,
                "poll cycle complete"
            );
        }
    }

    /// Lit séquentiellement chaque node ; l'ordre de lecture est l'ordre d'écriture
    pub async fn poll_cycle(&mut self, session: &mut dyn Session) -> CycleReport {
        let mut report = CycleReport::default();
        let origin = self.source.origin();
        let read_timeout = self.source.read_timeout();

        for node in &self.source.nodes {
            let read = tokio::select! {
                biased;
                _ = wait_stop(&mut self.stop) => {
                    report.stopped = true;
                    return report;
                }
                r = timeout(read_timeout, session.read(node, self.source.namespace_index)) => {
                    r.unwrap_or_else(|_| Err(SessionError::Timeout(read_timeout)))
                }
            };

            let raw = match read {
                Ok(raw) => raw,
                Err(e) => {
                    report.read_failed += 1;
                    tracing::warn!(
                        source = %self.source.id,
                        node = %node.node_id,
                        alias = %node.alias,
                        error = %e,
                        "node read failed"
                    );
                    self.state.lock().record_error(e.to_string());
                    if e.is_session_loss() {
                        report.lost = true;
                        return report;
                    }
                    continue;
                }
            };
            report.read_ok += 1;

            // le scorer peut être lent : l'arrêt reste prioritaire
            let ingested = tokio::select! {
                biased;
                _ = wait_stop(&mut self.stop) => {
                    report.stopped = true;
                    return report;
                }
                r = self.pipeline.ingest(&origin, node, &raw) => r,
            };

            match ingested {
                Ok(ingested) => match ingested.outcome {
                    IngestOutcome::Stored { .. } => report.routed += 1,
                    IngestOutcome::Duplicate => report.duplicates += 1,
                },
                Err(e) => {
                    report.storage_failed += 1;
                    tracing::error!(
                        source = %self.source.id,
                        alias = %node.alias,
                        error = %e,
                        "sample dropped, storage failure"
                    );
                    self.state.lock().record_error(e.to_string());
                }
            }
        }

        report
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Se résout quand l'arrêt est demandé ou que l'émetteur a disparu
async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{new_state, WorkerPhase};
    use crate::testkit::{
        node, pipeline_with, source, wait_until, FlakyStorage, ScriptedSessions, StubScorer,
    };
    use std::time::Duration;

    fn fast_source(nodes: usize) -> SourceConfig {
        let nodes = (0..nodes as u32).map(|i| node(1000 + i, &format!("sensor_{i}"))).collect();
        let mut src = source("plc", nodes);
        src.polling_interval_ms = 40;
        src.session_timeout_ms = 200;
        src.timestamp_source = crate::models::TimestampSource::Local;
        src
    }

    fn spawn(
        src: SourceConfig,
        sessions: Arc<ScriptedSessions>,
        pipeline: Arc<IngestPipeline>,
    ) -> (Shared<ConnectionState>, watch::Sender<bool>, tokio::task::JoinHandle<()>) {
        let state = new_state(ConnectionState::new(src.nodes.len()));
        let (tx, rx) = watch::channel(false);
        let worker = ConnectorWorker::new(src, sessions, pipeline, state.clone(), rx);
        (state, tx, tokio::spawn(worker.run()))
    }

    #[tokio::test]
    async fn test_cycle_routes_every_node() {
        let (pipeline, store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        let src = fast_source(4);
        let (_tx, rx) = watch::channel(false);
        let state = new_state(ConnectionState::new(4));
        let mut worker = ConnectorWorker::new(src.clone(), sessions.clone(), pipeline, state, rx);

        let mut session = sessions.open(&src).await.unwrap();
        let report = worker.poll_cycle(session.as_mut()).await;
        assert_eq!(report.read_ok, 4);
        assert_eq!(report.routed, 4);
        assert_eq!(store.sample_count(), 4);
    }

    #[tokio::test]
    async fn test_one_failing_node_does_not_abort_cycle() {
        let (pipeline, store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        sessions.fail_node("sensor_1");
        let src = fast_source(3);
        let (_tx, rx) = watch::channel(false);
        let state = new_state(ConnectionState::new(3));
        let mut worker =
            ConnectorWorker::new(src.clone(), sessions.clone(), pipeline, state.clone(), rx);

        let mut session = sessions.open(&src).await.unwrap();
        let report = worker.poll_cycle(session.as_mut()).await;
        assert_eq!(report.read_failed, 1);
        assert_eq!(report.routed, 2);
        assert!(!report.lost);
        assert_eq!(store.sample_count(), 2);
        assert!(state.lock().last_error.as_deref().unwrap_or("").contains("sensor_1"));
    }

    #[tokio::test]
    async fn test_transport_loss_abandons_cycle() {
        let (pipeline, store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        sessions.lose_transport_on("sensor_1");
        let src = fast_source(3);
        let (_tx, rx) = watch::channel(false);
        let state = new_state(ConnectionState::new(3));
        let mut worker = ConnectorWorker::new(src.clone(), sessions.clone(), pipeline, state, rx);

        let mut session = sessions.open(&src).await.unwrap();
        let report = worker.poll_cycle(session.as_mut()).await;
        assert!(report.lost);
        assert_eq!(report.read_ok, 1);
        assert_eq!(store.sample_count(), 1, "sensor_2 never read after the loss");
    }

    #[tokio::test]
    async fn test_storage_failure_isolated_per_node() {
        let storage = Arc::new(FlakyStorage::failing_on(&["sensor_0"]));
        let pipeline = crate::testkit::pipeline_over(storage.clone(), StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        let src = fast_source(3);
        let (_tx, rx) = watch::channel(false);
        let state = new_state(ConnectionState::new(3));
        let mut worker = ConnectorWorker::new(src.clone(), sessions.clone(), pipeline, state, rx);

        let mut session = sessions.open(&src).await.unwrap();
        let report = worker.poll_cycle(session.as_mut()).await;
        assert_eq!(report.storage_failed, 1);
        assert_eq!(report.routed, 2);
        assert_eq!(storage.inner().sample_count(), 2);
    }

    #[tokio::test]
    async fn test_run_heartbeat_and_stop() {
        let (pipeline, _store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        let (state, tx, handle) = spawn(fast_source(2), sessions.clone(), pipeline);

        let watched = state.clone();
        assert!(wait_until(Duration::from_secs(3), || watched.lock().cycles >= 2).await);
        {
            let st = state.lock();
            assert!(st.connected);
            assert_eq!(st.phase, WorkerPhase::Polling);
            assert!(st.heartbeat.is_some());
        }

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(state.lock().phase, WorkerPhase::Stopped);
        assert!(!state.lock().connected);
        assert_eq!(sessions.closed(), sessions.opened());
    }

    #[tokio::test]
    async fn test_open_failures_are_retried() {
        let (pipeline, _store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        sessions.refuse_opens(2);
        let (state, tx, handle) = spawn(fast_source(1), sessions.clone(), pipeline);

        let watched = state.clone();
        assert!(wait_until(Duration::from_secs(3), || watched.lock().cycles >= 1).await);
        assert_eq!(sessions.open_attempts(), 3);
        assert_eq!(state.lock().consecutive_failures, 0, "reset by the first good cycle");

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_all_reads_failing_disconnects() {
        let (pipeline, store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        sessions.fail_node("sensor_0");
        let (state, tx, handle) = spawn(fast_source(1), sessions.clone(), pipeline);

        let watched = state.clone();
        assert!(wait_until(Duration::from_secs(3), || watched.lock().disconnects >= 2).await);
        {
            // reconnecté ou non, les échecs restent visibles tant qu'aucun cycle ne réussit
            let st = state.lock();
            assert!(st.heartbeat.is_none());
            assert_eq!(st.cycles, 0);
            assert!(st.consecutive_failures >= 2);
            assert!(st.last_error.as_deref().unwrap_or("").contains("sensor_0"));
        }
        assert_eq!(store.sample_count(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(sessions.closed(), sessions.opened());
    }

    #[tokio::test]
    async fn test_scripted_values_are_routed() {
        let (pipeline, store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        sessions.set_value("sensor_0", serde_json::json!("71.5"));
        let src = fast_source(1);
        let (_tx, rx) = watch::channel(false);
        let state = new_state(ConnectionState::new(1));
        let mut worker = ConnectorWorker::new(src.clone(), sessions.clone(), pipeline, state, rx);

        let mut session = sessions.open(&src).await.unwrap();
        let report = worker.poll_cycle(session.as_mut()).await;
        assert_eq!(report.routed, 1);
        let sensor = store.sensors()[0].id;
        assert_eq!(store.samples_for(sensor)[0].value, Some(71.5));
    }

    #[tokio::test]
    async fn test_stop_cancels_slow_ingestion() {
        let (pipeline, store, scorer) =
            pipeline_with(StubScorer::normal().slow(Duration::from_secs(30)));
        let sessions = Arc::new(ScriptedSessions::new());
        let mut src = fast_source(1);
        src.polling_interval_ms = 1;
        let (state, tx, handle) = spawn(src, sessions.clone(), pipeline);

        // la 12e lecture remplit la fenêtre et bloque sur le scorer
        assert!(wait_until(Duration::from_secs(3), || scorer.calls() >= 1).await);
        let stored = store.sample_count();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(500), handle).await.unwrap().unwrap();

        assert_eq!(state.lock().phase, WorkerPhase::Stopped);
        assert_eq!(store.sample_count(), stored);
        assert!(store.predictions().is_empty());
        assert_eq!(sessions.closed(), sessions.opened());
    }

    #[tokio::test]
    async fn test_stop_cancels_hung_read() {
        let (pipeline, _store, _) = pipeline_with(StubScorer::normal());
        let sessions = Arc::new(ScriptedSessions::new());
        sessions.hang_reads(Duration::from_secs(30));
        let mut src = fast_source(1);
        src.read_timeout_ms = Some(20_000);
        let (state, tx, handle) = spawn(src, sessions.clone(), pipeline);

        let watched = sessions.clone();
        assert!(wait_until(Duration::from_secs(2), || watched.reads() >= 1).await);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert_eq!(state.lock().phase, WorkerPhase::Stopped);
    }
}
