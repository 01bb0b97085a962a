use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod extractor;
mod service;

use config::{BusKind, Config};
use dbus_interface::{GalleryService, BUS_NAME, OBJECT_PATH};
use extractor::CommandExtractor;
use facevote_store::GalleryStore;
use service::{EnrollmentService, VerificationService};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facevoted starting");

    let cfg = Config::from_env().context("loading configuration")?;
    tracing::info!(
        db = %cfg.db_path.display(),
        threshold = cfg.match_threshold,
        dimension = cfg.descriptor_dim,
        enroll_images = cfg.enroll_images,
        bus = ?cfg.bus,
        "configuration loaded"
    );

    let command = cfg
        .extractor_cmd
        .as_deref()
        .context("FACEVOTE_EXTRACTOR_CMD is not set; no descriptor extractor to run")?;
    let extractor = CommandExtractor::new(command, cfg.descriptor_dim, cfg.extract_timeout())?;

    let engine = engine::spawn_engine(
        Arc::new(extractor),
        cfg.extract_workers,
        cfg.extract_queue,
        cfg.extract_timeout(),
    )
    .context("starting extraction workers")?;

    let store = GalleryStore::open(&cfg.db_path, cfg.descriptor_dim)
        .await
        .with_context(|| format!("opening gallery at {}", cfg.db_path.display()))?;
    tracing::info!(enrolled = store.count().await?, "gallery opened");

    let service = GalleryService::new(
        EnrollmentService::new(engine.clone(), store.clone(), cfg.enroll_images),
        VerificationService::new(engine, store.clone(), cfg.match_threshold),
        store,
        cfg.extract_workers,
    );

    let builder = match cfg.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "facevoted ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facevoted shutting down");

    Ok(())
}
