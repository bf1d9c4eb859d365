use anyhow::Result;
use std::sync::Arc;
use threat_detection::{
    DetectionConfig, DetectionService, Dispatcher, LogPublisher, MemoryRepository, MemoryStream,
    SignatureCatalog,
};
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = DetectionConfig::load()?;
    info!(target: "threat-detection", ?cfg, "configuration loaded");

    // In-memory adapters stand in until the production store and bus
    // consumer are wired by the surrounding platform.
    let repository = Arc::new(MemoryRepository::new());
    let publisher = Arc::new(LogPublisher);
    let catalog = Arc::new(SignatureCatalog::empty());
    let service = Arc::new(DetectionService::new(
        catalog,
        cfg.anomaly.clone(),
        repository,
        publisher,
        cfg.retry.clone(),
    ));
    service.refresh_catalog().await?;

    let stream = Arc::new(MemoryStream::new());
    let dispatcher = Arc::new(Dispatcher::new(service.clone(), cfg.dispatcher.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move { dispatcher.run(stream, shutdown_rx).await })
    };
    info!(target: "threat-detection", "detection pipeline running");

    tokio::signal::ctrl_c().await?;
    info!(target: "threat-detection", "shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = pipeline.await;
    service.flush_baselines().await?;
    info!(target: "threat-detection", "threat detection service stopped");
    Ok(())
}

fn init_tracing() {
    let json = std::env::var("DETECT_JSON_LOG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env());
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
