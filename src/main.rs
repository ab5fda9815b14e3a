//! NPU Inference Service
//!
//! Image classification over HTTP, accelerated by the Teflon TensorFlow Lite
//! delegate on the RK3588 NPU.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use npu_infer::api::rest::{AppState, create_rest_router};
use npu_infer::config::Config;
use npu_infer::engine::TfLiteBackend;
use npu_infer::service::RuntimeContext;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Starting NPU Inference Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = Config::load(&Config::default_path()).unwrap_or_else(|e| {
        info!("Using default config ({})", e);
        Config::default()
    });
    config.apply_env();

    info!("Configuration loaded:");
    info!("  Model: {}", config.model.path.display());
    info!("  TFLite runtime: {}", config.model.runtime_library.display());
    if let Some(library) = &config.delegate.library {
        info!("  Teflon delegate (pinned): {}", library.display());
    }

    let backend = TfLiteBackend::new(&config.model.runtime_library)
        .with_num_threads(config.model.num_threads)
        .with_delegate_options(config.delegate.options.clone());

    // Resolve the delegate and load the model before listening
    let context = tokio::task::spawn_blocking({
        let config = config.clone();
        move || RuntimeContext::initialize(backend, &config)
    })
    .await?;

    let app_state = Arc::new(AppState {
        context: Arc::new(context),
    });
    let router = create_rest_router(app_state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("REST API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, cleaning up...");
        })
        .await?;

    info!("Goodbye!");
    Ok(())
}
