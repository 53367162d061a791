use crate::comms::manager::WorkerManager;
use crate::comms::session::{run_session, SessionParams};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone)]
pub struct StreamServerParams {
    pub registration_timeout: Duration,
    pub heartbeat_interval: Duration,
}

/// Accept loop of the worker stream listener. Each accepted connection gets
/// its own session task; the loop itself never blocks on a session.
pub async fn serve_worker_streams(
    listener: TcpListener,
    manager: Arc<WorkerManager>,
    params: StreamServerParams,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "worker stream listener started"),
        Err(_) => info!("worker stream listener started"),
    }
    let session_params = SessionParams {
        registration_timeout: params.registration_timeout,
        heartbeat_interval: params.heartbeat_interval,
    };
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(run_session(
                        stream,
                        peer,
                        manager.clone(),
                        session_params.clone(),
                    ));
                }
                Err(err) => {
                    warn!(%err, "failed to accept worker connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!("worker stream listener stopped");
}
