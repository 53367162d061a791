use anyhow::Context;
use hodei_common::tracing::init_tracing;
use hodei_common::SafeDisplay;
use hodei_orchestrator::bootstrap::Services;
use hodei_orchestrator::comms::{serve_worker_streams, StreamServerParams, WorkerChannel};
use hodei_orchestrator::config::make_config_loader;
use hodei_wire::message::OrchestratorMessage;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Some(config) = make_config_loader().load_or_dump_config() else {
        return Ok(());
    };
    init_tracing(&config.tracing);
    info!("starting hodei orchestrator");
    info!("\n{}", config.to_safe_string());

    let services = Services::new(&config).await.map_err(anyhow::Error::msg)?;

    let listener = TcpListener::bind(config.listener.addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listener.addr()))?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve_worker_streams(
        listener,
        services.worker_manager.clone(),
        StreamServerParams {
            registration_timeout: config.worker.registration_timeout,
            heartbeat_interval: config.worker.heartbeat_interval,
        },
        shutdown.clone(),
    ));

    shutdown_signal().await;
    info!("shutdown requested, draining");
    shutdown.cancel();

    // tell workers, then give in-flight executions the configured grace
    services
        .worker_manager
        .broadcast(OrchestratorMessage::shutdown("orchestrator shutting down"))
        .await;
    for summary in services.engine.active_executions() {
        let _ = services
            .engine
            .cancel(&summary.execution_id, "orchestrator shutting down", false)
            .await;
    }
    let deadline = tokio::time::Instant::now() + config.execution.cancel_grace;
    while tokio::time::Instant::now() < deadline
        && !services.engine.active_executions().is_empty()
    {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    server.abort();
    services.dispatcher.abort();
    services.heartbeat_watchdog.abort();
    info!("orchestrator stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
