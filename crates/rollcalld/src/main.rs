use anyhow::{Context, Result};
use rollcall_core::store::StoreSettings;
use rollcall_core::{
    ArcFaceEmbedder, EmbeddingStore, LinearScanResolver, RateLimiter, Recognizer, RecognizerSettings,
    ScrfdDetector, SessionLedger, SqliteRecordStore,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;

const BUS_NAME: &str = "org.rollcall.Recognition1";
const OBJECT_PATH: &str = "/org/rollcall/Recognition1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load().context("invalid configuration")?;
    tracing::info!(
        model = %config.model_name,
        metric = %config.distance_metric,
        threshold = config.confidence_threshold,
        fps_limit = config.fps_limit,
        db = %config.db_path.display(),
        "configuration loaded"
    );

    // Model loading and the initial cache fill are blocking; keep them off the runtime.
    let recognizer = tokio::task::spawn_blocking(move || build_recognizer(&config))
        .await
        .context("startup task panicked")??;
    let recognizer = Arc::new(recognizer);

    let service = dbus_interface::RollcallService::new(recognizer);
    let _connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to acquire D-Bus name {BUS_NAME}"))?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}

fn build_recognizer(config: &config::Config) -> Result<Recognizer> {
    let records = SqliteRecordStore::open(&config.db_path)
        .with_context(|| format!("failed to open embedding database {}", config.db_path.display()))?;

    let store = Arc::new(EmbeddingStore::new(
        Box::new(records),
        StoreSettings {
            dimension: config.embedding_dim,
            model_name: config.model_name.clone(),
            metric: config.distance_metric,
        },
    ));
    if config.cache_preload {
        let loaded = store.load_all().context("failed to preload embeddings")?;
        tracing::info!(count = loaded, "embedding cache preloaded");
    }

    let ledger = SessionLedger::open(config.sessions_dir.clone())
        .with_context(|| format!("failed to open sessions directory {}", config.sessions_dir.display()))?;

    let detector = ScrfdDetector::load(&config.scrfd_model_path(), config.min_detection_confidence)
        .context("failed to load face detector")?;
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path(), &config.model_name, config.embedding_dim)
        .context("failed to load embedding model")?;

    Ok(Recognizer::new(
        Box::new(detector),
        Box::new(embedder),
        Box::new(LinearScanResolver::new(config.distance_metric)),
        store,
        Arc::new(ledger),
        Arc::new(RateLimiter::new(config.fps_limit)),
        RecognizerSettings {
            threshold: config.confidence_threshold,
            min_detection_confidence: config.min_detection_confidence,
            crop_padding: config.crop_padding,
        },
    ))
}
