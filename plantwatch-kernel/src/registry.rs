/**
 * SOURCE REGISTRY - Catalogue en mémoire des sources de télémétrie
 *
 * RÔLE :
 * Détient les SourceConfig enregistrées et leur drapeau d'activation.
 * Dépendance feuille du worker, du superviseur et de l'interface de statut.
 *
 * FONCTIONNEMENT :
 * - Écritures sérialisées par un RwLock, remplacement complet (jamais de patch)
 * - Lectures = copie de l'état sous verrou court (snapshot stable par tick)
 * - Chaque mutation incrémente une version publiée sur un canal watch,
 *   ce qui réveille la passe d'ordonnancement du superviseur
 */

use crate::models::SourceConfig;
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid source configuration: {0}")]
    Validation(String),
    #[error("source not found: {0}")]
    NotFound(String),
}

pub struct SourceRegistry {
    /// Ordre d'enregistrement conservé pour des snapshots stables
    sources: RwLock<Vec<SourceConfig>>,
    version: watch::Sender<u64>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            sources: RwLock::new(Vec::new()),
            version,
        }
    }

    /// Enregistre ou remplace entièrement la source portant le même id
    pub fn upsert(&self, mut source: SourceConfig) -> Result<(), RegistryError> {
        source.validate().map_err(RegistryError::Validation)?;
        source.updated_at = OffsetDateTime::now_utc();

        {
            let mut sources = self.sources.write();
            match sources.iter_mut().find(|s| s.id == source.id) {
                Some(existing) => {
                    source.created_at = existing.created_at;
                    *existing = source;
                }
                None => sources.push(source),
            }
        }

        self.bump();
        Ok(())
    }

    /// Bascule l'éligibilité au polling ; id inconnu = NotFound sans effet
    pub fn set_active(&self, id: &str, active: bool) -> Result<(), RegistryError> {
        {
            let mut sources = self.sources.write();
            let source = sources
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            if source.active == active {
                return Ok(());
            }
            source.active = active;
            source.updated_at = OffsetDateTime::now_utc();
        }

        self.bump();
        Ok(())
    }

    /// Désenregistrement explicite
    pub fn remove(&self, id: &str) -> Result<SourceConfig, RegistryError> {
        let removed = {
            let mut sources = self.sources.write();
            let idx = sources
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            sources.remove(idx)
        };

        self.bump();
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<SourceConfig> {
        self.sources.read().iter().find(|s| s.id == id).cloned()
    }

    pub fn list_all(&self) -> Vec<SourceConfig> {
        self.sources.read().clone()
    }

    /// Snapshot des sources actives, insensible aux mutations ultérieures
    pub fn list_active(&self) -> Vec<SourceConfig> {
        self.sources.read().iter().filter(|s| s.active).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    /// Notifié à chaque mutation (upsert, activation, suppression)
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
