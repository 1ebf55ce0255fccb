//! Termination handling.
//!
//! [`ShutdownController`] turns OS signals into a broadcast that the
//! listener loops select on. [`shutdown_all`] then stops every card: each
//! card that is not already settled gets a helper task that cancels its
//! workers and drives it to a reset.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::time::Instant;

use cardkeeper_types::{NodeState, RuntimeMode, StateCommand};

use crate::context::DaemonContext;
use crate::registry::Node;
use crate::workers::{Countdown, WorkerKind};

/// Coordinates graceful shutdown across the daemon's listeners.
///
/// Listeners call [`subscribe`](Self::subscribe) and `select!` on the
/// receiver alongside their accept loop.
pub struct ShutdownController {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Wait for SIGTERM, SIGINT or SIGQUIT, then trigger shutdown.
    ///
    /// Fails only if a handler cannot be installed.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut rx = self.subscribe();
        if self.is_triggered() {
            return Ok(());
        }

        tokio::select! {
            _ = term.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = int.recv() => tracing::info!("received SIGINT, shutting down"),
            _ = quit.recv() => tracing::info!("received SIGQUIT, shutting down"),
            _ = rx.recv() => return Ok(()),
        }

        self.shutdown();
        Ok(())
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

const CARD_WORKERS: [WorkerKind; 4] = [
    WorkerKind::Boot,
    WorkerKind::Monitor,
    WorkerKind::State,
    WorkerKind::Crash,
];

#[derive(Debug, Default)]
pub struct ShutdownSummary {
    /// Cards that needed a shutdown helper.
    pub helpers: usize,
    /// Cards whose helper was still running when the total wait expired.
    pub wedged: Vec<String>,
}

/// Stop every card and wait, bounded by `timeouts.total_shutdown_secs`,
/// until each helper has finished.
pub async fn shutdown_all(ctx: &Arc<DaemonContext>) -> ShutdownSummary {
    ctx.shutdown.shutdown();

    let helpers = Countdown::new();
    let mut summary = ShutdownSummary::default();
    for node in ctx.registry.iter() {
        let needs_helper = match ctx.attrs.read_state(&node.name).await {
            Ok(state) => !state.is_settled(),
            Err(e) => {
                tracing::warn!(node = %node.name, error = %e, "state unreadable - stopping workers anyway");
                true
            }
        };
        if !needs_helper {
            node.stop.stop();
            node.workers.cancel(&CARD_WORKERS);
            continue;
        }
        let done = helpers.enter();
        let (c, n) = (Arc::clone(ctx), Arc::clone(node));
        let spawned = node.workers.spawn(WorkerKind::Stop, async move {
            let _done = done;
            shut_down_node(&c, &n).await;
        });
        if spawned.is_some() {
            summary.helpers += 1;
        } else {
            tracing::warn!(node = %node.name, "shutdown already in progress");
        }
    }

    let total = ctx.config.timeouts.total_shutdown();
    if tokio::time::timeout(total, helpers.wait_zero()).await.is_err() {
        summary.wedged = ctx
            .registry
            .iter()
            .filter(|n| n.workers.is_running(WorkerKind::Stop))
            .map(|n| n.name.clone())
            .collect();
        tracing::error!(
            wedged = ?summary.wedged,
            waited = %cardkeeper_utils::format_duration(total),
            "cards did not finish shutting down"
        );
    } else {
        tracing::info!(helpers = summary.helpers, "all cards stopped");
    }
    summary
}

/// The per-card shutdown helper.
///
/// Cancels the card's workers, then shuts a Linux card down gracefully and
/// follows up with a reset once it has stopped. Anything else is reset at
/// once.
pub async fn shut_down_node(ctx: &DaemonContext, node: &Node) {
    node.stop.stop();
    node.workers.cancel(&CARD_WORKERS);

    let name = node.name.as_str();
    let state = match ctx.attrs.read_state(name).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(node = %name, error = %e, "failed to read state - cannot shut down");
            return;
        }
    };

    let timeout = node.config.shutdown_timeout();
    if timeout.is_zero() || state != NodeState::Online {
        send(ctx, node, StateCommand::ResetForce).await;
        return;
    }
    match ctx.attrs.read_mode(name).await {
        Ok(RuntimeMode::Linux) => shut_down_linux(ctx, node, timeout).await,
        Ok(RuntimeMode::Other(mode)) => {
            tracing::info!(node = %name, %mode, "not running linux - forcing reset");
            send(ctx, node, StateCommand::ResetForce).await;
        }
        Err(e) => {
            tracing::warn!(node = %name, error = %e, "cannot read mode - forcing reset");
            send(ctx, node, StateCommand::ResetForce).await;
        }
    }
}

async fn shut_down_linux(ctx: &DaemonContext, node: &Node, timeout: Duration) {
    let name = node.name.as_str();
    if !send(ctx, node, StateCommand::Shutdown).await {
        send(ctx, node, StateCommand::ResetForce).await;
        return;
    }

    let poll = ctx.config.timeouts.state_poll();
    let deadline = Instant::now() + timeout;
    loop {
        tokio::time::sleep(poll).await;
        match ctx.attrs.read_state(name).await {
            Ok(NodeState::Shutdown) | Ok(NodeState::Ready) => {
                send(ctx, node, StateCommand::Reset).await;
                return;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(node = %name, error = %e, "failed to read state - try again"),
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                node = %name,
                waited = %cardkeeper_utils::format_duration(timeout),
                "shutdown timed out - forcing reset"
            );
            send(ctx, node, StateCommand::ResetForce).await;
            return;
        }
    }
}

async fn send(ctx: &DaemonContext, node: &Node, command: StateCommand) -> bool {
    match ctx.attrs.write_command(&node.name, &command).await {
        Ok(()) => {
            tracing::info!(node = %node.name, %command, "state command issued");
            true
        }
        Err(e) => {
            tracing::error!(node = %node.name, %command, error = %e, "state command failed");
            false
        }
    }
}
