//! Bring-up and tear-down of the whole daemon.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::boot::spawn_boot;
use crate::context::DaemonContext;
use crate::credentials::run_credential_broker;
use crate::monitor::run_monitor_listener;
use crate::shutdown::{shutdown_all, ShutdownSummary};
use crate::state_watcher::spawn_state_watcher;
use crate::HostError;

/// A started daemon: both listeners running and every card's watcher and
/// boot attempt launched.
pub struct Daemon {
    ctx: Arc<DaemonContext>,
    listeners: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Bind both listeners, then start a state watcher and a boot attempt
    /// for every card.
    pub async fn start(ctx: Arc<DaemonContext>) -> Result<Self, HostError> {
        let ports = &ctx.config.ports;
        let monitor = ctx.transport.listen(ports.monitor).await?;
        let credential = ctx.transport.listen(ports.credential).await?;
        let listeners = vec![
            tokio::spawn(run_monitor_listener(Arc::clone(&ctx), monitor)),
            tokio::spawn(run_credential_broker(Arc::clone(&ctx), credential)),
        ];

        for node in ctx.registry.iter() {
            spawn_state_watcher(&ctx, node);
            spawn_boot(&ctx, node);
        }
        tracing::info!(cards = ctx.registry.len(), "daemon started");
        Ok(Self { ctx, listeners })
    }

    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.ctx
    }

    /// Resolves once every boot attempt launched so far has finished.
    pub async fn wait_started(&self) {
        self.ctx.starting.wait_zero().await;
        tracing::info!("card bring-up complete");
    }

    /// Stop every card, then the listeners.
    pub async fn shutdown(self) -> ShutdownSummary {
        let summary = shutdown_all(&self.ctx).await;
        for listener in self.listeners {
            listener.abort();
        }
        summary
    }
}
