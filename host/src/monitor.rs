//! The monitor channel.
//!
//! A card agent connects to the host's monitor port and sends
//! `MONITOR_START`. The host connects back to the agent's reply port and
//! both sides cross-check that the two connections join the same pair of
//! endpoints: the agent reports over the outbound connection which port its
//! inbound connection uses, and the host echoes its outbound local port
//! over the inbound one. After that the inbound connection carries
//! acknowledgements and stop notices to a [`run_monitor_worker`] task, and
//! the outbound connection becomes the node's broadcast channel.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use cardkeeper_network::{is_peer_disconnect, Connection, Listener};
use cardkeeper_protocol::{
    read_opcode, read_u16, read_u32, write_opcode, write_u16, Opcode, ProtocolError,
};
use cardkeeper_types::{FabricAddr, NodeId};

use crate::context::DaemonContext;
use crate::listener::accept_loop;
use crate::registry::Node;
use crate::workers::WorkerKind;
use crate::HandshakeError;

/// Accept monitor connections until shutdown. Each handshake runs in its own
/// task so an unreachable card never holds up the others.
pub async fn run_monitor_listener(ctx: Arc<DaemonContext>, listener: Box<dyn Listener>) {
    accept_loop(&ctx, listener, "monitor", |conn| {
        tokio::spawn(handle_monitor_connection(Arc::clone(&ctx), conn));
        std::future::ready(())
    })
    .await;
}

pub async fn handle_monitor_connection(ctx: Arc<DaemonContext>, inbound: Connection) {
    let peer = inbound.peer();
    match accept_monitor(&ctx, inbound).await {
        Ok(node) => tracing::info!(node = %node.name, "monitor connection established"),
        Err(e) => tracing::warn!(%peer, error = %e, "monitor handshake failed"),
    }
}

/// Run the handshake on a freshly accepted connection.
///
/// On any failure both connections are dropped, no worker is started and
/// the node's broadcast channel is left untouched.
pub async fn accept_monitor(
    ctx: &Arc<DaemonContext>,
    mut inbound: Connection,
) -> Result<Arc<Node>, HandshakeError> {
    let peer = inbound.peer();
    let op = read_opcode(&mut inbound).await?;
    if op != Opcode::MonitorStart {
        return Err(HandshakeError::UnexpectedOpcode(op));
    }
    let node = NodeId::from_fabric_node(peer.node)
        .and_then(|id| ctx.registry.by_id(id))
        .cloned()
        .ok_or(HandshakeError::UnknownNode(peer.node))?;

    let mut outbound = connect_back(ctx, &node).await?;

    let reported = read_u16(&mut outbound).await?;
    if reported != peer.port || outbound.peer().node != peer.node {
        return Err(HandshakeError::Mismatch {
            reported,
            observed: peer.port,
        });
    }
    write_u16(&mut inbound, outbound.local_port()).await?;

    if node.stop.is_stopped() {
        return Err(HandshakeError::Stopped);
    }

    // The new channel is in place before its worker can run, so a worker
    // that ends at once still finds and closes it.
    let channel_port = outbound.local_port();
    let mut broadcast = node.broadcast().lock().await;
    let stale = broadcast.take();
    let channel = broadcast.insert(outbound);
    let worker = run_monitor_worker(Arc::clone(ctx), Arc::clone(&node), inbound, channel_port);
    let (_, replaced) = node.workers.replace(WorkerKind::Monitor, worker);
    if replaced {
        tracing::info!(node = %node.name, "replacing previous monitor connection");
    }
    let acked = write_opcode(channel, Opcode::MonitorStartAck).await;
    if acked.is_err() {
        broadcast.take();
        node.workers.cancel(&[WorkerKind::Monitor]);
    }
    drop(broadcast);

    if replaced || stale.is_some() {
        drop(stale);
        ctx.jobs.node_gone(node.id).await;
    }
    acked?;
    Ok(node)
}

/// Connect to the card's reply port, retrying until it answers or the node
/// is stopped.
async fn connect_back(ctx: &DaemonContext, node: &Node) -> Result<Connection, HandshakeError> {
    let target = FabricAddr::new(node.id.fabric_node(), ctx.config.ports.monitor_reply);
    let interval = ctx.config.timeouts.reconnect_interval();
    let mut failures = 0u64;
    loop {
        let attempt = tokio::select! {
            biased;
            _ = node.stop.stopped() => return Err(HandshakeError::Stopped),
            r = ctx.transport.connect(target) => r,
        };
        match attempt {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    tracing::info!(node = %node.name, %target, error = %e, "failed to connect to card monitor - retrying");
                } else {
                    tracing::debug!(node = %node.name, failures, error = %e, "connect back failed");
                }
            }
        }
        if !node.stop.sleep(interval).await {
            return Err(HandshakeError::Stopped);
        }
    }
}

/// Service one card's monitor connection until the agent stops or the
/// connection fails.
///
/// `channel_port` is the local port of the broadcast channel opened by the
/// same handshake; on exit only that channel is closed.
pub async fn run_monitor_worker(
    ctx: Arc<DaemonContext>,
    node: Arc<Node>,
    mut inbound: Connection,
    channel_port: u16,
) {
    let name = node.name.as_str();
    loop {
        match read_opcode(&mut inbound).await {
            Ok(Opcode::ReqCredentialAck) | Ok(Opcode::ReqCredentialNack) => {
                let job = match read_u32(&mut inbound).await {
                    Ok(job) => job,
                    Err(e) => {
                        report_failure(name, &e);
                        break;
                    }
                };
                if ctx.jobs.complete(job, node.id).await {
                    tracing::debug!(node = %name, job, "credential job completed");
                }
            }
            Ok(Opcode::MonitorStopping) => {
                let _ = read_u16(&mut inbound).await;
                tracing::info!(node = %name, "card agent exiting");
                break;
            }
            Ok(op) => tracing::warn!(node = %name, ?op, "unexpected opcode on monitor channel"),
            Err(ProtocolError::UnknownOpcode(op)) => {
                tracing::warn!(node = %name, op, "unknown opcode on monitor channel")
            }
            Err(e) => {
                report_failure(name, &e);
                break;
            }
        }
    }

    let _ = inbound.shutdown().await;
    close_channel(&ctx, &node, channel_port).await;
}

fn report_failure(name: &str, err: &ProtocolError) {
    if err.io_error().is_some_and(is_peer_disconnect) {
        tracing::warn!(node = %name, error = %err, "card agent disconnected");
    } else {
        tracing::error!(node = %name, error = %err, "monitor channel failed");
    }
}

/// Drop the node's broadcast channel if it is still ours, and release every
/// credential job waiting on it.
async fn close_channel(ctx: &DaemonContext, node: &Node, channel_port: u16) {
    let taken = {
        let mut broadcast = node.broadcast().lock().await;
        match broadcast.as_ref() {
            Some(conn) if conn.local_port() == channel_port => broadcast.take(),
            _ => None,
        }
    };
    let Some(mut channel) = taken else {
        return;
    };
    let _ = channel.shutdown().await;
    let completed = ctx.jobs.node_gone(node.id).await;
    if completed > 0 {
        tracing::info!(node = %node.name, completed, "credential jobs released by channel loss");
    }
}
