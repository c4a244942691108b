use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, num::NonZeroUsize, path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tracing_subscriber::EnvFilter;
use tripbasket_media::{
    cache_controller::{CacheConfig, CacheController, HttpNetwork, MemoryCacheStorage},
    config::AppConfig,
    db,
    routes,
    services::{
        document_service::DocumentService, optimizer_service::OptimizerService,
        signing::UrlSigner, storage_service::StorageService,
    },
    state::AppState,
};
use url::Url;

/// Pending finalize events before uploads start dropping them.
const FINALIZE_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        addr = %cfg.addr(),
        storage_dir = %cfg.storage_dir,
        database_url = %cfg.database_url,
        default_bucket = %cfg.default_bucket,
        web_origin = ?cfg.web_origin,
        "Starting tripbasket-media"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let signer = UrlSigner::new(&cfg.public_base_url, cfg.signing_secret.clone())
        .with_context(|| format!("invalid public base url {}", cfg.public_base_url))?;
    let (events_tx, events_rx) = mpsc::channel(FINALIZE_QUEUE);
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone(), signer)
        .with_finalize_events(events_tx);
    storage
        .ensure_bucket(&cfg.default_bucket)
        .await
        .with_context(|| format!("could not prepare bucket {}", cfg.default_bucket))?;
    let documents = DocumentService::new(db.clone());

    let optimizer = Arc::new(OptimizerService::new(
        Arc::new(storage.clone()),
        Arc::new(documents.clone()),
        cfg.optimizer.clone(),
        cfg.default_bucket.clone(),
        cfg.bulk_prefix.clone(),
    ));
    optimizer.clone().spawn_finalize_listener(events_rx);

    let edge = match &cfg.web_origin {
        Some(origin) => start_edge(origin, &cfg.cache_version, cfg.cache_max_entries).await?,
        None => None,
    };

    // --- Build router ---
    let state = AppState {
        storage,
        documents,
        optimizer,
        edge,
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Install and activate the edge cache for `origin`. A failed install or
/// activation leaves the service running without it.
async fn start_edge(
    origin: &str,
    version: &str,
    max_entries: NonZeroUsize,
) -> Result<Option<CacheController>> {
    let origin = Url::parse(origin).with_context(|| format!("invalid web origin {origin}"))?;
    let controller = CacheController::new(
        CacheConfig::tripbasket(origin, version),
        Arc::new(MemoryCacheStorage::with_capacity(max_entries)),
        Arc::new(HttpNetwork::default()),
    );

    if let Err(err) = controller.install().await {
        tracing::warn!("edge cache disabled, install failed: {}", err);
        return Ok(None);
    }
    if let Err(err) = controller.activate().await {
        tracing::warn!("edge cache disabled, activation failed: {}", err);
        return Ok(None);
    }
    Ok(Some(controller))
}
