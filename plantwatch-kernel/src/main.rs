/**
 * PLANTWATCH KERNEL - Point d'entrée du connecteur
 *
 * RÔLE : Bootstrap : config, stockage, scorer, notifications, superviseur des
 * sources, relais MQTT et publication de santé. Arrêt propre sur Ctrl-C
 * (workers stoppés, sessions fermées, snapshot écrit).
 */

use anyhow::{Context, Result};
use plantwatch_kernel::config::load_config;
use plantwatch_kernel::detection::{DetectionBridge, HttpScorer};
use plantwatch_kernel::health::HealthTracker;
use plantwatch_kernel::manager::ConnectorManager;
use plantwatch_kernel::notify::{FanoutNotifier, MqttNotifier, WebhookNotifier, DEFAULT_ALARM_TOPIC};
use plantwatch_kernel::pipeline::IngestPipeline;
use plantwatch_kernel::registry::SourceRegistry;
use plantwatch_kernel::relay;
use plantwatch_kernel::router::IngestionRouter;
use plantwatch_kernel::session::SessionFactory;
use plantwatch_kernel::storage::MemoryStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("plantwatch_kernel=info")),
        )
        .init();

    let cfg = load_config().await.context("failed to load configuration")?;

    // stockage + snapshot
    tokio::fs::create_dir_all(&cfg.storage.data_dir)
        .await
        .with_context(|| format!("failed to create data dir {}", cfg.storage.data_dir.display()))?;
    let store = Arc::new(
        MemoryStore::load(cfg.storage.snapshot_path())
            .await
            .context("failed to load store snapshot")?
            .with_retention(cfg.storage.sample_retention),
    );

    // client MQTT partagé (relais, alarmes, santé)
    let mqtt = cfg.mqtt.as_ref().map(|m| (m.clone(), relay::create_mqtt_client(m)));

    let mut notifier = FanoutNotifier::new();
    if let Some(url) = &cfg.notifications.webhook_url {
        let webhook = WebhookNotifier::new(url.clone()).context("invalid webhook notifier")?;
        notifier = notifier.with(Arc::new(webhook));
    }
    if let Some((_, (client, _))) = &mqtt {
        let topic = cfg
            .notifications
            .mqtt_topic
            .clone()
            .unwrap_or_else(|| DEFAULT_ALARM_TOPIC.to_string());
        notifier = notifier.with(Arc::new(MqttNotifier::new(client.clone(), topic)));
    }
    tracing::info!(channels = notifier.len(), "alarm notifications configured");

    let scorer = HttpScorer::new(&cfg.scorer.url, cfg.scorer.timeout())
        .context("failed to build scorer client")?;
    tracing::info!(endpoint = %scorer.endpoint(), "detection scorer configured");

    let pipeline = Arc::new(IngestPipeline::new(
        IngestionRouter::new(store.clone()),
        DetectionBridge::new(Arc::new(scorer), store.clone(), Arc::new(notifier)),
    ));

    let registry = Arc::new(SourceRegistry::new());
    let manager = Arc::new(ConnectorManager::new(
        registry.clone(),
        session_factory(),
        pipeline.clone(),
    ));
    manager.spawn_scheduler();

    for source in cfg.sources {
        let (name, active) = (source.name.clone(), source.active);
        registry
            .upsert(source)
            .with_context(|| format!("invalid source '{name}' in configuration"))?;
        tracing::info!(source = %name, active, "source registered from configuration");
    }

    let health = HealthTracker::new();
    let mut background = Vec::new();
    if let Some((mqtt_cfg, (client, eventloop))) = mqtt {
        background.push(health.spawn_health_publisher(client.clone(), manager.clone()));
        background.push(relay::spawn_relay_listener(
            client,
            eventloop,
            mqtt_cfg.topics,
            pipeline.clone(),
            health.clone(),
        ));
        tracing::info!(host = %mqtt_cfg.host, port = mqtt_cfg.port, "mqtt relay started");
    }

    // snapshot périodique
    let flush_store = store.clone();
    let flush_every = cfg.storage.flush_interval();
    background.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(flush_every);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = flush_store.flush().await {
                tracing::error!(error = %e, "store snapshot failed");
            }
        }
    }));

    tracing::info!(sources = registry.len(), "plantwatch kernel running");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    manager.shutdown().await;
    for task in background {
        task.abort();
    }
    store.flush().await.context("failed to write store snapshot")?;
    tracing::info!("plantwatch kernel stopped");
    Ok(())
}

#[cfg(feature = "opcua")]
fn session_factory() -> Arc<dyn SessionFactory> {
    Arc::new(plantwatch_kernel::session::opcua::OpcUaSessions)
}

#[cfg(not(feature = "opcua"))]
fn session_factory() -> Arc<dyn SessionFactory> {
    tracing::warn!("built without the opcua feature, sources cannot connect");
    Arc::new(plantwatch_kernel::session::UnsupportedSessions)
}
