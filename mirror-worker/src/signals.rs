use std::future::{pending, Future};
use std::io;

use tokio::signal::unix::{Signal, SignalKind};
use tracing::{error, info};

/// Resolve on SIGINT or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires, so it cannot
/// shut the worker down on its own.
pub async fn wait_for_shutdown_signal() {
    wait_for_any(
        tokio::signal::ctrl_c(),
        tokio::signal::unix::signal(SignalKind::terminate()),
    )
    .await
}

async fn wait_for_any<F>(ctrl_c: F, sigterm: io::Result<Signal>)
where
    F: Future<Output = io::Result<()>>,
{
    let ctrl_c = async {
        match ctrl_c.await {
            Ok(()) => info!("received SIGINT"),
            Err(e) => {
                error!("failed to listen for SIGINT: {}", e);
                pending::<()>().await
            }
        }
    };
    let sigterm = async {
        match sigterm {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm => {}
    }
}
