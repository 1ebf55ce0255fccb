//! The credential broker.
//!
//! A card-side user asks for its cookie to be distributed by connecting to
//! the credential port and sending its uid. The broker resolves the user,
//! loads or creates the cookie, sends it to every card with a live
//! broadcast channel and answers the requester once all of them have
//! acknowledged. Requests are served one at a time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use cardkeeper_network::{is_peer_disconnect, Connection, Listener};
use cardkeeper_protocol::{
    read_u64, write_status, CredStatus, CredentialRequest, MAX_NAME_LEN,
};
use cardkeeper_types::Cookie;

use crate::context::DaemonContext;
use crate::cookie::get_cookie;
use crate::jobs::CredentialJob;
use crate::listener::accept_loop;
use crate::users::{self, UserEntry};

pub async fn run_credential_broker(ctx: Arc<DaemonContext>, listener: Box<dyn Listener>) {
    let ctx: &DaemonContext = &ctx;
    accept_loop(ctx, listener, "credential", move |conn| serve_request(ctx, conn)).await;
}

/// How a broadcast ended from the requester's point of view.
#[derive(Debug, PartialEq, Eq)]
pub enum Broadcast {
    /// The job waits for this many cards.
    Queued { job_id: u32, cards: usize },
    /// No card was reachable; the requester was answered at once.
    NoCards,
    /// The job table is full; the requester was refused.
    Refused,
}

/// Serve one request to completion or until its job is queued.
pub async fn serve_request(ctx: &DaemonContext, mut requester: Connection) {
    let peer = requester.peer();
    let uid = match read_u64(&mut requester).await {
        Ok(uid) => uid,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "failed to read credential request");
            return;
        }
    };

    let user = match resolve(ctx, uid).await {
        Some(user) => user,
        None => {
            reply(requester, CredStatus::FailUnknownUid).await;
            return;
        }
    };

    let cookie_file = PathBuf::from(&ctx.config.credentials.cookie_file);
    let cookie = match get_cookie(user.clone(), cookie_file).await {
        Ok(cookie) => cookie,
        Err(e) => {
            tracing::error!(user = %user.name, error = %e, "cannot obtain cookie");
            reply(requester, CredStatus::FailReadCookie).await;
            return;
        }
    };

    let outcome = broadcast(ctx, requester, &user.name, cookie).await;
    tracing::info!(user = %user.name, uid, ?outcome, "credential request");
}

async fn resolve(ctx: &DaemonContext, uid: u64) -> Option<UserEntry> {
    let passwd = &ctx.config.credentials.passwd_file;
    match users::lookup_uid(passwd, uid).await {
        Ok(Some(user)) if user.name.len() <= MAX_NAME_LEN => Some(user),
        Ok(Some(user)) => {
            tracing::warn!(uid, len = user.name.len(), "user name too long");
            None
        }
        Ok(None) => {
            tracing::warn!(uid, "credential request for unknown uid");
            None
        }
        Err(e) => {
            tracing::error!(path = %passwd.display(), error = %e, "cannot read user database");
            None
        }
    }
}

/// Send the cookie to every card with a live broadcast channel.
///
/// The job table stays locked for the whole fan-out so no acknowledgement
/// can arrive before its job is recorded. Each card's channel is locked on
/// its own, one after another.
pub async fn broadcast(
    ctx: &DaemonContext,
    requester: Connection,
    username: &str,
    cookie: Cookie,
) -> Broadcast {
    let mut jobs = ctx.jobs.lock().await;
    if jobs.is_full() {
        drop(jobs);
        tracing::warn!(user = %username, "too many credential jobs in flight");
        reply(requester, CredStatus::FailMalloc).await;
        return Broadcast::Refused;
    }

    let request = CredentialRequest {
        job_id: jobs.allocate_id(),
        username: username.to_string(),
        cookie,
    };
    let mut pending = HashSet::new();
    for node in ctx.registry.iter() {
        let mut channel = node.broadcast().lock().await;
        let Some(conn) = channel.as_mut() else {
            continue;
        };
        match request.write_to(conn).await {
            Ok(()) => {
                pending.insert(node.id);
            }
            Err(e) if e.io_error().is_some_and(is_peer_disconnect) => {
                tracing::debug!(node = %node.name, "broadcast channel gone - skipping");
            }
            Err(e) => {
                tracing::warn!(node = %node.name, error = %e, "failed to send credential");
            }
        }
    }

    if pending.is_empty() {
        drop(jobs);
        reply(requester, CredStatus::Success).await;
        return Broadcast::NoCards;
    }

    let cards = pending.len();
    jobs.insert(CredentialJob {
        id: request.job_id,
        requester,
        pending,
        created: Instant::now(),
    });
    Broadcast::Queued {
        job_id: request.job_id,
        cards,
    }
}

async fn reply(mut requester: Connection, status: CredStatus) {
    if let Err(e) = write_status(&mut requester, status).await {
        tracing::debug!(peer = %requester.peer(), ?status, error = %e, "failed to answer requester");
    }
    let _ = requester.shutdown().await;
}
