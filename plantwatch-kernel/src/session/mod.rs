/**
 * SESSIONS PROTOCOLAIRES - Couture entre le worker et le client industriel
 *
 * RÔLE :
 * Le worker ne connaît que ces deux traits : une fabrique qui ouvre une
 * session vers l'endpoint d'une source, et la session qui lit un node à la fois.
 *
 * FONCTIONNEMENT :
 * - Les deadlines (ouverture, lecture) sont posées par l'appelant via tokio::time::timeout
 * - SessionError distingue la perte de session (transport) de l'échec d'un seul node
 * - Implémentation OPC UA réelle derrière la feature cargo "opcua"
 * - La fermeture est bornée : une requête abandonnée ne retient pas le démontage
 */

use crate::models::{NodeConfig, SourceConfig};
use crate::normalizer::RawReading;
use async_trait::async_trait;
use std::time::Duration;
use tokio::task::JoinHandle;

#[cfg(feature = "opcua")]
pub mod opcua;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("read failed for node {node}: {reason}")]
    Node { node: String, reason: String },
}

impl SessionError {
    /// La session est morte : le reste du cycle doit être abandonné
    pub fn is_session_loss(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, source: &SourceConfig) -> Result<Box<dyn Session>, SessionError>;
}

#[async_trait]
pub trait Session: Send {
    /// Résumé lisible de la session établie (politique de sécurité, identité)
    fn describe(&self) -> String;

    /// Lit la valeur courante d'un node ; `namespace` = portée de la source
    async fn read(
        &mut self,
        node: &NodeConfig,
        namespace: u16,
    ) -> Result<RawReading, SessionError>;

    async fn close(&mut self);
}

/// Fabrique sans client protocolaire : toute ouverture échoue proprement
pub struct UnsupportedSessions;

#[async_trait]
impl SessionFactory for UnsupportedSessions {
    async fn open(&self, source: &SourceConfig) -> Result<Box<dyn Session>, SessionError> {
        Err(SessionError::Refused(format!(
            "no protocol client compiled in for {} (build with --features opcua)",
            source.endpoint_url
        )))
    }
}

/// Attend une tâche de fermeture au plus `limit` ; au-delà elle finit détachée.
/// Retourne true si la fermeture s'est terminée à temps.
pub async fn close_within<T>(limit: Duration, task: JoinHandle<T>) -> bool {
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "session close task failed");
            true
        }
        Err(_) => {
            tracing::warn!(limit = ?limit, "session close still pending, detached");
            false
        }
    }
}
