/**
 * CONNECTOR MANAGER - Superviseur des workers et interface exposée
 *
 * RÔLE :
 * Démarre un worker par source active, l'arrête à la désactivation, le redémarre
 * quand sa configuration est remplacée. Porte les opérations consommées par la
 * couche API : test_source, activate_source, deactivate_source, status.
 *
 * FONCTIONNEMENT :
 * - reconcile() = passe d'ordonnancement : compare le snapshot actif du registre
 *   aux workers en cours
 * - Le scheduler relance reconcile() à chaque changement du registre (canal watch)
 * - Arrêt d'un worker : signal watch puis attente de la tâche hors verrou ; une
 *   désactivation acquittée garantit qu'aucun échantillon ne sera plus routé
 * - Un redémarrage (configuration remplacée) attend la fin de l'ancien worker
 */

use crate::models::{SourceConfig, Sample};
use crate::normalizer::normalize;
use crate::pipeline::IngestPipeline;
use crate::registry::{RegistryError, SourceRegistry};
use crate::session::{SessionError, SessionFactory};
use crate::state::{new_state, ConnectionState, Shared, WorkerPhase};
use crate::worker::ConnectorWorker;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Nodes lus au plus par un test de connexion
const TEST_PREVIEW_NODES: usize = 3;

/// Heartbeat plus vieux que ce multiple de l'intervalle : source "stale"
const STALE_INTERVALS: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub ok: bool,
    pub handshake_log: Vec<String>,
    pub sample_preview: Vec<Sample>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activation {
    pub id: String,
    pub node_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub id: String,
    pub name: String,
    pub endpoint_url: String,
    pub active: bool,
    pub node_count: usize,
    pub phase: Option<WorkerPhase>,
    pub connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub heartbeat: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub heartbeat: Option<OffsetDateTime>,
    pub node_count: usize,
    pub last_error: Option<String>,
    pub sources: Vec<SourceStatus>,
}

struct WorkerHandle {
    config: SourceConfig,
    state: Shared<ConnectionState>,
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

impl WorkerHandle {
    /// Signale l'arrêt ; le récepteur rendu passe à true une fois la tâche terminée
    fn stop(self) -> watch::Receiver<bool> {
        let _ = self.stop.send(true);
        self.done
    }
}

/// Table des workers : verrou court, jamais tenu pendant une attente
#[derive(Default)]
struct Workers {
    running: HashMap<String, WorkerHandle>,
    stopping: HashMap<String, watch::Receiver<bool>>,
}

pub struct ConnectorManager {
    registry: Arc<SourceRegistry>,
    sessions: Arc<dyn SessionFactory>,
    pipeline: Arc<IngestPipeline>,
    workers: Mutex<Workers>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectorManager {
    pub fn new(
        registry: Arc<SourceRegistry>,
        sessions: Arc<dyn SessionFactory>,
        pipeline: Arc<IngestPipeline>,
    ) -> Self {
        Self {
            registry,
            sessions,
            pipeline,
            workers: Mutex::new(Workers::default()),
            scheduler: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    /// Connexion ponctuelle connect-read-disconnect, sans toucher au registre
    pub async fn test_source(&self, config: &SourceConfig) -> Result<TestReport, RegistryError> {
        config.validate().map_err(RegistryError::Validation)?;

        let mut log = vec![format!("connecting to {}", config.endpoint_url)];
        let opened = tokio::time::timeout(config.session_timeout(), self.sessions.open(config))
            .await
            .unwrap_or_else(|_| Err(SessionError::Timeout(config.session_timeout())));

        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                log.push(format!("connection failed: {e}"));
                log.extend(connection_hints(&e, &config.endpoint_url));
                return Ok(TestReport {
                    ok: false,
                    handshake_log: log,
                    sample_preview: Vec::new(),
                    error: Some(e.to_string()),
                });
            }
        };
        log.push(format!("session established ({})", session.describe()));

        let mut preview = Vec::new();
        let mut first_error = None;
        for node in config.nodes.iter().take(TEST_PREVIEW_NODES) {
            let read = session.read(node, config.namespace_index);
            let read = tokio::time::timeout(config.read_timeout(), read)
                .await
                .unwrap_or_else(|_| Err(SessionError::Timeout(config.read_timeout())));
            match read {
                Ok(raw) => {
                    let sample = normalize(
                        node,
                        &raw,
                        config.timestamp_source,
                        config.unit_override_policy,
                    );
                    let shown =
                        sample.value.map(|v| v.to_string()).unwrap_or_else(|| "null".into());
                    log.push(format!(
                        "read {} ({}) = {} [{}]",
                        node.node_id,
                        node.alias,
                        shown,
                        sample.quality.as_str()
                    ));
                    preview.push(sample);
                }
                Err(e) => {
                    log.push(format!("read {} ({}) failed: {e}", node.node_id, node.alias));
                    first_error.get_or_insert_with(|| e.to_string());
                    if e.is_session_loss() {
                        break;
                    }
                }
            }
        }

        session.close().await;
        log.push("session closed".to_string());

        let ok = !preview.is_empty();
        Ok(TestReport {
            ok,
            handshake_log: log,
            sample_preview: preview,
            error: if ok { None } else { first_error },
        })
    }

    /// Enregistre (remplacement complet) puis active la source
    pub async fn activate_source(
        &self,
        mut config: SourceConfig,
    ) -> Result<Activation, RegistryError> {
        config.active = true;
        let activation = Activation { id: config.id.clone(), node_count: config.nodes.len() };
        self.registry.upsert(config)?;
        tracing::info!(source = %activation.id, nodes = activation.node_count, "source activated");
        self.reconcile().await;
        Ok(activation)
    }

    /// Retourne une fois le worker arrêté et sa session fermée
    pub async fn deactivate_source(&self, id: &str) -> Result<(), RegistryError> {
        self.registry.set_active(id, false)?;
        tracing::info!(source = %id, "source deactivated");
        self.reconcile().await;
        self.wait_stopped(id).await;
        Ok(())
    }

    pub async fn deregister_source(&self, id: &str) -> Result<SourceConfig, RegistryError> {
        let removed = self.registry.remove(id)?;
        tracing::info!(source = %id, "source deregistered");
        self.reconcile().await;
        self.wait_stopped(id).await;
        Ok(removed)
    }

    /// Passe d'ordonnancement : aligne les workers sur les sources actives,
    /// puis attend, hors verrou, la fin des workers qu'elle a arrêtés
    pub async fn reconcile(&self) {
        for (id, done) in self.schedule() {
            wait_done(done).await;
            tracing::debug!(source = %id, "worker joined");
        }
    }

    fn schedule(&self) -> Vec<(String, watch::Receiver<bool>)> {
        let active = self.registry.list_active();
        let mut workers = self.workers.lock();
        workers.stopping.retain(|_, done| !*done.borrow());

        let outdated: Vec<String> = workers
            .running
            .iter()
            .filter(|(id, handle)| {
                !active
                    .iter()
                    .any(|s| &s.id == *id && same_polling_config(s, &handle.config))
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut stopped = Vec::new();
        for id in outdated {
            if let Some(handle) = workers.running.remove(&id) {
                tracing::info!(source = %id, "stopping worker");
                let done = handle.stop();
                workers.stopping.insert(id.clone(), done.clone());
                stopped.push((id, done));
            }
        }

        for source in active {
            if !workers.running.contains_key(&source.id) {
                // un redémarrage attend la fin du worker précédent
                let previous = workers.stopping.get(&source.id).cloned();
                let id = source.id.clone();
                let handle = self.spawn_worker(source, previous);
                workers.running.insert(id, handle);
            }
        }
        stopped
    }

    /// Attend la fin d'un arrêt en cours, y compris lancé par un autre appel
    async fn wait_stopped(&self, id: &str) {
        let pending = self.workers.lock().stopping.get(id).cloned();
        if let Some(done) = pending {
            wait_done(done).await;
        }
    }

    fn spawn_worker(
        &self,
        source: SourceConfig,
        previous: Option<watch::Receiver<bool>>,
    ) -> WorkerHandle {
        let state = new_state(ConnectionState::new(source.nodes.len()));
        let (stop, stop_rx) = watch::channel(false);
        let (done_tx, done) = watch::channel(false);
        let worker = ConnectorWorker::new(
            source.clone(),
            self.sessions.clone(),
            self.pipeline.clone(),
            state.clone(),
            stop_rx,
        );
        let id = source.id.clone();
        tracing::info!(source = %id, "starting worker");
        tokio::spawn(async move {
            if let Some(previous) = previous {
                wait_done(previous).await;
            }
            if let Err(e) = tokio::spawn(worker.run()).await {
                tracing::error!(source = %id, error = %e, "worker task ended abnormally");
            }
            let _ = done_tx.send(true);
        });
        WorkerHandle { config: source, state, stop, done }
    }

    /// Relance reconcile() à chaque mutation du registre
    pub fn spawn_scheduler(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut changes = self.registry.subscribe();
        let task = tokio::spawn(async move {
            manager.reconcile().await;
            while changes.changed().await.is_ok() {
                manager.reconcile().await;
            }
        });
        if let Some(previous) = self.scheduler.lock().replace(task) {
            previous.abort();
        }
    }

    /// Copie des états sous verrou court ; ne bloque jamais sur un arrêt en cours
    pub fn status(&self) -> StatusSnapshot {
        let sources = self.registry.list_all();
        let states: HashMap<String, ConnectionState> = {
            let workers = self.workers.lock();
            workers
                .running
                .iter()
                .map(|(id, handle)| (id.clone(), handle.state.lock().clone()))
                .collect()
        };
        let now = OffsetDateTime::now_utc();

        let entries: Vec<SourceStatus> = sources
            .iter()
            .map(|source| {
                let state = states.get(&source.id);
                let heartbeat = state.and_then(|s| s.heartbeat);
                let stale_after = source.polling_interval() * STALE_INTERVALS;
                SourceStatus {
                    id: source.id.clone(),
                    name: source.name.clone(),
                    endpoint_url: source.endpoint_url.clone(),
                    active: source.active,
                    node_count: source.nodes.len(),
                    phase: state.map(|s| s.phase),
                    connected: state.is_some_and(|s| s.connected),
                    heartbeat,
                    last_error: state.and_then(|s| s.last_error.clone()),
                    consecutive_failures: state.map(|s| s.consecutive_failures).unwrap_or(0),
                    stale: source.active
                        && heartbeat.is_some_and(|hb| is_older_than(now, hb, stale_after)),
                }
            })
            .collect();

        let active = || entries.iter().filter(|s| s.active);
        StatusSnapshot {
            connected: active().any(|s| s.connected),
            heartbeat: active().filter_map(|s| s.heartbeat).max(),
            node_count: active().map(|s| s.node_count).sum(),
            last_error: active().find_map(|s| s.last_error.clone()),
            sources: entries,
        }
    }

    /// Arrête le scheduler puis chaque worker (sessions fermées)
    pub async fn shutdown(&self) {
        if let Some(task) = self.scheduler.lock().take() {
            task.abort();
        }
        let pending: Vec<watch::Receiver<bool>> = {
            let mut workers = self.workers.lock();
            let running: Vec<WorkerHandle> = workers.running.drain().map(|(_, h)| h).collect();
            let mut pending: Vec<_> = workers.stopping.drain().map(|(_, done)| done).collect();
            pending.extend(running.into_iter().map(WorkerHandle::stop));
            pending
        };
        let count = pending.len();
        for done in pending {
            wait_done(done).await;
        }
        tracing::info!(workers = count, "connector manager stopped");
    }
}

/// Se résout quand la tâche du worker est terminée
async fn wait_done(mut done: watch::Receiver<bool>) {
    let _ = done.wait_for(|finished| *finished).await;
}

/// Même configuration de polling (horodatages d'édition et drapeau actif ignorés)
fn same_polling_config(a: &SourceConfig, b: &SourceConfig) -> bool {
    let mut a = a.clone();
    a.updated_at = b.updated_at;
    a.created_at = b.created_at;
    a.active = b.active;
    a == *b
}

fn is_older_than(now: OffsetDateTime, then: OffsetDateTime, limit: Duration) -> bool {
    (now - then).whole_milliseconds() > limit.as_millis() as i128
}

fn connection_hints(error: &SessionError, endpoint: &str) -> Vec<String> {
    let mut hints = Vec::new();
    match error {
        SessionError::Refused(msg) | SessionError::Transport(msg) => {
            let lowered = msg.to_ascii_lowercase();
            if lowered.contains("resolve") || lowered.contains("dns") || lowered.contains("name") {
                hints.push(format!(
                    "hint: check that the host in {endpoint} resolves from this machine"
                ));
            }
            hints.push(
                "hint: verify the server is running and the port is reachable (default 4840)"
                    .into(),
            );
        }
        SessionError::Timeout(_) => {
            hints.push(
                "hint: the server did not answer in time, check firewalls and the session timeout"
                    .into(),
            );
        }
        SessionError::AuthRejected(_) => {
            hints.push(
                "hint: check the username and password, or switch to anonymous security mode"
                    .into(),
            );
        }
        SessionError::Node { .. } => {}
    }
    hints
}
