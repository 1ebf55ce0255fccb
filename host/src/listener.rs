//! The accept loop shared by the monitor and credential listeners.

use std::future::Future;

use cardkeeper_network::{Connection, Listener};

use crate::context::DaemonContext;

/// Accept connections until shutdown, handing each one to `handle`.
///
/// Accept failures are logged and retried after the configured backoff.
pub(crate) async fn accept_loop<F, Fut>(
    ctx: &DaemonContext,
    mut listener: Box<dyn Listener>,
    role: &'static str,
    mut handle: F,
) where
    F: FnMut(Connection) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut shutdown = ctx.shutdown.subscribe();
    let backoff = ctx.config.timeouts.accept_backoff();
    tracing::info!(role, port = listener.local_port(), "listening");

    while !ctx.shutdown.is_triggered() {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok(conn) => handle(conn).await,
            Err(e) => {
                tracing::warn!(role, error = %e, "accept failed");
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }
    tracing::info!(role, "listener stopped");
}
