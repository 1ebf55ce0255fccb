//! Per-node state watcher.
//!
//! Waits for change notifications on the node's `state` attribute, logs
//! every transition, starts crash capture when the card is lost and dumps
//! the card's buffered diagnostic log when it starts resetting.

use std::sync::Arc;

use cardkeeper_sysfs::WaitOutcome;
use cardkeeper_types::NodeState;

use crate::context::DaemonContext;
use crate::crash_dump;
use crate::registry::Node;
use crate::workers::WorkerKind;

/// Start the node's watcher unless one is already registered.
pub fn spawn_state_watcher(ctx: &Arc<DaemonContext>, node: &Arc<Node>) -> bool {
    let fut = run_state_watcher(Arc::clone(ctx), Arc::clone(node));
    node.workers.spawn(WorkerKind::State, fut).is_some()
}

pub async fn run_state_watcher(ctx: Arc<DaemonContext>, node: Arc<Node>) {
    let poll = ctx.config.timeouts.state_poll();
    loop {
        let outcome = tokio::select! {
            biased;
            _ = node.stop.stopped() => return,
            r = ctx.attrs.wait_change(&node.name, "state", poll) => r,
        };
        match outcome {
            Ok(WaitOutcome::Interrupted) => continue,
            Ok(WaitOutcome::Changed) | Ok(WaitOutcome::TimedOut) => {}
            Err(e) => {
                tracing::error!(node = %node.name, error = %e, "state poll failed - watcher exiting");
                return;
            }
        }

        let state = match ctx.attrs.read_state(&node.name).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(node = %node.name, error = %e, "failed to read state - watcher exiting");
                return;
            }
        };
        let previous = node.observe_state(state);
        if previous == state {
            continue;
        }
        tracing::info!(node = %node.name, from = %previous, to = %state, "state change");

        match state {
            NodeState::Lost => {
                if !crash_dump::spawn_crash_capture(&ctx, &node) {
                    tracing::warn!(node = %node.name, "crash capture already running");
                }
            }
            NodeState::Resetting => capture_diagnostic_log(&ctx, &node).await,
            _ => {}
        }
    }
}

/// Log the card's previous-boot diagnostic buffer, if the driver kept one.
async fn capture_diagnostic_log(ctx: &DaemonContext, node: &Node) {
    let path = ctx
        .config
        .crash_dump
        .oops_dir
        .join(format!("{}_prev", node.name));
    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(e) => {
            tracing::info!(node = %node.name, path = %path.display(), error = %e, "no diagnostic log");
            return;
        }
    };
    if contents.is_empty() {
        return;
    }
    tracing::info!(node = %node.name, "resetting card found oops:");
    for line in String::from_utf8_lossy(&contents).lines() {
        tracing::info!(node = %node.name, "{line}");
    }
}
