use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::rest::create_router;
use crate::controller::lab_manager::LabOrchestrator;

/// Serve the lab API until `shutdown` fires, then tear down every lab.
pub async fn run_rest_server(
    orchestrator: Arc<LabOrchestrator>,
    bind_addr: &str,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(
        r#"
 _       _
| | __ _| |__   ___ _ ____   __
| |/ _` | '_ \ / _ \ '_ \ \ / /
| | (_| | |_) |  __/ | | \ V /
|_|\__,_|_.__/ \___|_| |_|\_/

Starting lab environment API...
PID: {}
"#,
        std::process::id()
    );

    info!("Building REST API routes...");
    let app = create_router(orchestrator.clone());

    info!("Binding to: {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    info!("REST API Endpoint: http://{}/api/v0", bind_addr);
    info!("Ready to accept requests...");

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;

    orchestrator.shutdown().await;
    server_result?;
    Ok(())
}
