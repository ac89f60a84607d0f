use anyhow::{Context, Result};
use attendance_core::{EmbeddingCache, EuclideanMatcher, MotionLiveness, OnnxExtractor};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod enrollment;
mod http;
mod photos;
mod pipeline;
mod recorder;
mod store;
#[cfg(test)]
mod testing;

use config::Config;
use engine::EngineConfig;
use enrollment::Enrollment;
use http::AppState;
use photos::{FsPhotoStore, PhotoStore};
use pipeline::Pipeline;
use recorder::AttendanceRecorder;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendanced starting");

    let config = Config::load().context("failed to load configuration")?;

    let extractor = OnnxExtractor::from_model_dir(&config.model_dir, config.verify_models)
        .with_context(|| {
            format!("failed to load face models from {}", config.model_dir.display())
        })?;

    let store = Store::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    tracing::info!(path = %config.db_path.display(), "database opened");

    let fs_photos =
        FsPhotoStore::open(&config.photo_dir).context("failed to open photo directory")?;
    tracing::info!(dir = %fs_photos.root().display(), "photo store ready");
    let photos: Arc<dyn PhotoStore> = Arc::new(fs_photos);

    let engine = engine::spawn_engine(
        EngineConfig {
            workers: config.workers,
            queue_depth: config.queue_depth,
            timeout: Duration::from_secs(config.extraction_timeout_secs),
        },
        Arc::new(extractor),
        Arc::new(MotionLiveness::new(
            config.pixel_diff_threshold,
            config.motion_pixel_threshold,
        )),
        Arc::new(EmbeddingCache::new()),
        Arc::clone(&photos),
    )?;

    let state = Arc::new(AppState {
        pipeline: Pipeline::new(
            engine.clone(),
            store.clone(),
            Arc::new(EuclideanMatcher),
            config.match_threshold,
        ),
        enrollment: Enrollment::new(store.clone(), Arc::clone(&photos), engine.clone()),
        recorder: AttendanceRecorder::new(store.clone()),
        engine,
        store,
        photos,
        config,
    });

    let listener = tokio::net::TcpListener::bind(&state.config.bind)
        .await
        .with_context(|| format!("failed to bind {}", state.config.bind))?;
    tracing::info!(addr = %state.config.bind, "attendanced ready");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("attendanced shutting down");
    Ok(())
}
