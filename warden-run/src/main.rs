//! `warden-run`: launch the tracking engine from a TOML config file.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_config_data::parse_config_file;
use warden_core::{
    tasks, AppearanceEmbedder, CameraPipeline, CameraWorker, GalleryStore, GlobalResolver,
    JsonGalleryStore, OnnxAppearanceEmbedder, OnnxPersonDetector, PersonDetector,
};
use warden_types::CamId;

#[derive(Debug, Parser)]
#[command(author, version, about = "multi-camera people tracking engine")]
struct WardenRunCliArgs {
    /// Path to the warden TOML configuration file.
    config_file: std::path::PathBuf,
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let evt_fmt = fmt::format()
        .with_timer(fmt::time::Uptime::default())
        .compact();
    tracing_subscriber::registry()
        .with(fmt::layer().event_format(evt_fmt))
        .with(EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let args = WardenRunCliArgs::parse();
    let cfg = parse_config_file(&args.config_file)
        .with_context(|| format!("reading config {}", args.config_file.display()))?;

    if cfg.cameras.is_empty() {
        bail!("config lists no cameras");
    }
    let mut seen_ids = BTreeSet::new();
    for camera in &cfg.cameras {
        if !seen_ids.insert(camera.id) {
            bail!("duplicate camera id {} in config", camera.id);
        }
    }

    // Persistence is best-effort: a missing store means memory-only
    // operation, not a refusal to start.
    let store: Option<Arc<dyn GalleryStore>> = match &cfg.engine.gallery_path {
        Some(path) => match JsonGalleryStore::open(path) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("gallery store {} unavailable ({e}); running in memory", path.display());
                None
            }
        },
        None => None,
    };

    let detector: Arc<dyn PersonDetector> = Arc::new(
        OnnxPersonDetector::new(&cfg.engine.detector_model, cfg.tracking.detector_min_conf)
            .with_context(|| {
                format!("loading detector model {}", cfg.engine.detector_model.display())
            })?,
    );
    let embedder: Option<Arc<dyn AppearanceEmbedder>> = match &cfg.engine.embedder_model {
        Some(path) => Some(Arc::new(
            OnnxAppearanceEmbedder::new(path)
                .with_context(|| format!("loading embedder model {}", path.display()))?,
        )),
        None => {
            warn!("no embedder model configured; cross-camera matching is spatial-only");
            None
        }
    };

    let resolver = GlobalResolver::new(cfg.resolver.clone(), store);
    let cancel = CancellationToken::new();

    let model_server = tokio::spawn(warden_core::new_model_server(
        resolver.clone(),
        cfg.engine.model_server_addr,
        cancel.clone(),
    ));

    let mut background = Vec::new();
    background.push(tokio::spawn(tasks::eviction_task(
        resolver.clone(),
        Duration::from_secs_f64(cfg.resolver.cleanup_interval_sec),
        cancel.clone(),
    )));
    background.push(tokio::spawn(tasks::gallery_sync_task(
        resolver.clone(),
        Duration::from_secs_f64(cfg.resolver.db_sync_interval_sec),
        cancel.clone(),
    )));

    let mut workers = Vec::new();
    for camera in &cfg.cameras {
        let cam_id = CamId(camera.id);
        let factory = warden_core::rtsp::RtspSourceFactory::new(cam_id, &camera.rtsp_url)
            .with_context(|| format!("camera {} ({})", camera.id, camera.name))?;
        let pipeline = CameraPipeline::new(
            cam_id,
            detector.clone(),
            embedder.clone(),
            resolver.clone(),
            cfg.tracking.clone(),
            cfg.secondary.clone(),
            cfg.embedder.clone(),
        );
        let worker = CameraWorker::new(factory, pipeline, camera.params.clone());
        info!("starting camera {} ({})", camera.id, camera.name);
        workers.push(tokio::spawn(worker.run(cancel.clone())));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    cancel.cancel();

    // Workers flush their bindings on the way out; wait for them before the
    // final gallery write.
    for worker in workers {
        let _ = worker.await;
    }
    for task in background {
        let _ = task.await;
    }
    match model_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("model server exited with error: {e}"),
        Err(e) => warn!("model server task failed: {e}"),
    }

    tasks::flush_to_store(&resolver);
    info!("done");
    Ok(())
}
