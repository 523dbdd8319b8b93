//! Poll a directory and upload new files to the configured endpoint.
use axum::routing::get;
use envconfig::Envconfig;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use upload_common::{
    health::HealthRegistry,
    metrics::{serve, setup_metrics_recorder, setup_metrics_router},
};
use upload_worker::config::Config;
use upload_worker::error::WorkerError;
use upload_worker::reconcile::Reconciler;
use upload_worker::scanner::DirectoryScanner;
use upload_worker::upload::{UploadClient, UploadMetadata};
use upload_worker::worker::PollScheduler;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    setup_tracing();

    let config = Config::init_from_env()?;
    config.validate()?;

    let upload_url = config.upload_url()?;
    let lock = config.lock_oracle()?;
    let scanner = DirectoryScanner::new(
        config.watch_dir.clone(),
        config.file_matcher()?,
        lock.clone(),
    );
    let uploader = UploadClient::new(
        upload_url.clone(),
        UploadMetadata::new(config.api_key.as_str()),
        config.request_timeout()?,
    )
    .map_err(WorkerError::HttpClientError)?;
    let reconciler = Reconciler::new(config.retry_policy.policy(), config.retry_cap()?);

    let recorder_handle = setup_metrics_recorder()?;
    let liveness = HealthRegistry::new("liveness");
    let scheduler_liveness = liveness
        .register("poll-scheduler".to_string(), config.liveness_deadline())
        .await;

    let mut scheduler = PollScheduler::new(
        scanner,
        lock,
        uploader,
        reconciler,
        config.poll_interval.0,
        scheduler_liveness,
    )
    .with_stability_check(config.stability_check);

    let cancel = CancellationToken::new();

    let mut sigterm = signal(SignalKind::terminate()).map_err(WorkerError::SignalError)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(WorkerError::SignalError)?;
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_cancel.cancel();
    });

    let router = setup_metrics_router(recorder_handle).route(
        "/_liveness",
        get(move || std::future::ready(liveness.get_status())),
    );
    let bind = config.bind();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = serve(router, &bind, shutdown).await {
            error!("failed to serve metrics and liveness on {}: {}", bind, e);
        }
    });

    info!(
        directory = %config.watch_dir.display(),
        pattern = config.file_pattern.as_str(),
        url = %upload_url,
        "uploader configured"
    );

    scheduler.run(cancel).await;

    Ok(())
}
