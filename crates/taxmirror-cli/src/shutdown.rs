//! SIGINT/SIGTERM handling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

/// Returns a token cancelled on the first interrupt. Work stops at the next
/// period or family boundary; a second interrupt exits immediately.
pub(crate) fn install_signal_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    let handler_token = token.clone();
    tokio::spawn(async move {
        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }

            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                tracing::info!("shutdown requested, finishing the current unit of work");
                handler_token.cancel();
            } else {
                tracing::warn!("forced exit");
                std::process::exit(130);
            }
        }
    });

    Ok(token)
}
