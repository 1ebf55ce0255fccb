//! The boot worker: one linear, bounded attempt to boot a card.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::Instant;

use cardkeeper_types::{NodeState, StateCommand};

use crate::cmdline;
use crate::config::{BaseKind, CardConfig, RootKind};
use crate::context::DaemonContext;
use crate::registry::Node;
use crate::workers::WorkerKind;
use crate::BootError;

/// How an attempt that did not fail ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootOutcome {
    /// The card is not marked for automatic boot.
    NotAutoBoot,
    Booted { image: PathBuf, root: PathBuf },
}

/// Start a boot attempt for `node` unless one is already running.
///
/// The attempt holds a place in the daemon's start countdown until it
/// exits, so startup can tell when bring-up is complete.
pub fn spawn_boot(ctx: &Arc<DaemonContext>, node: &Arc<Node>) -> bool {
    if node.stop.is_stopped() {
        return false;
    }
    let starting = ctx.starting.enter();
    let worker = BootWorker::new(Arc::clone(ctx), Arc::clone(node));
    let fut = async move {
        let _starting = starting;
        let _ = worker.run().await;
    };
    node.workers.spawn(WorkerKind::Boot, fut).is_some()
}

pub struct BootWorker {
    ctx: Arc<DaemonContext>,
    node: Arc<Node>,
}

impl BootWorker {
    pub fn new(ctx: Arc<DaemonContext>, node: Arc<Node>) -> Self {
        Self { ctx, node }
    }

    /// Run one attempt, logging how it ended.
    pub async fn run(&self) -> Result<BootOutcome, BootError> {
        let result = self.attempt().await;
        let name = &self.node.name;
        match &result {
            Ok(BootOutcome::NotAutoBoot) => {
                tracing::info!(node = %name, "not set to autoboot")
            }
            Ok(BootOutcome::Booted { image, root }) => tracing::info!(
                node = %name,
                image = %image.display(),
                initrd = %root.display(),
                "booting"
            ),
            Err(BootError::Stopped) => tracing::debug!(node = %name, "boot cancelled"),
            Err(e) => tracing::warn!(node = %name, error = %e, "boot aborted"),
        }
        result
    }

    pub async fn attempt(&self) -> Result<BootOutcome, BootError> {
        let card = &self.node.config;
        let name = self.node.name.as_str();

        check_file_sources(card)?;
        let image = card
            .boot
            .os_image
            .clone()
            .ok_or(BootError::NotConfigured("os_image"))?;
        self.ctx.validator.validate(&image).await?;

        let cmdline = cmdline::compose(card).map_err(BootError::Cmdline)?;
        self.ctx
            .attrs
            .write(name, "cmdline", &cmdline)
            .await
            .map_err(|e| BootError::Cmdline(format!("failed to write command line: {e}")))?;
        tracing::info!(node = %name, %cmdline, "command line");

        self.set_log_buf_info().await;

        if !card.boot.on_start {
            return Ok(BootOutcome::NotAutoBoot);
        }

        let root = self.prepare_root().await?;

        let timeouts = &self.ctx.config.timeouts;
        let state = self.ctx.attrs.read_state(name).await?;
        let state = self
            .wait_while(NodeState::Shutdown, state, timeouts.shutdown_wait())
            .await?;
        let state = self
            .wait_while(NodeState::Resetting, state, timeouts.reset_wait())
            .await?;
        if state != NodeState::Ready {
            return Err(BootError::NotReady(state));
        }

        let command = StateCommand::boot_linux(
            image.display().to_string(),
            root.display().to_string(),
        );
        self.ctx.attrs.write_command(name, &command).await?;
        Ok(BootOutcome::Booted { image, root })
    }

    /// Poll while the card stays in `state`, giving up after `ceiling`.
    async fn wait_while(
        &self,
        state: NodeState,
        mut current: NodeState,
        ceiling: Duration,
    ) -> Result<NodeState, BootError> {
        let name = self.node.name.as_str();
        let poll = self.ctx.config.timeouts.state_poll();
        let deadline = Instant::now() + ceiling;
        while current == state {
            if Instant::now() >= deadline {
                return Err(BootError::WaitTimedOut(state));
            }
            tracing::info!(node = %name, "waiting for {state} to complete");
            if !self.node.stop.sleep(poll).await {
                return Err(BootError::Stopped);
            }
            match self.ctx.attrs.read_state(name).await {
                Ok(s) => current = s,
                Err(e) => {
                    tracing::warn!(node = %name, error = %e, "failed to read state - try again")
                }
            }
        }
        Ok(current)
    }

    /// Pick the root filesystem source, regenerating the ramdisk if needed.
    async fn prepare_root(&self) -> Result<PathBuf, BootError> {
        let card = &self.node.config;
        match card.root.kind {
            RootKind::Ramfs => {
                let target = card
                    .root
                    .target
                    .clone()
                    .ok_or(BootError::NotConfigured("root target"))?;
                self.generate_ramdisk(&target).await;
                Ok(target)
            }
            RootKind::StaticRamfs => card
                .root
                .target
                .clone()
                .ok_or(BootError::NotConfigured("root target")),
            RootKind::Nfs | RootKind::SplitNfs | RootKind::Pfs => card
                .files
                .base_image
                .clone()
                .ok_or(BootError::NotConfigured("base_image")),
        }
    }

    async fn generate_ramdisk(&self, target: &Path) {
        let name = self.node.name.as_str();
        if target.exists() {
            if let Err(e) = tokio::fs::remove_file(target).await {
                tracing::warn!(node = %name, target = %target.display(), error = %e, "cannot remove old ramdisk");
            }
        }
        tracing::info!(node = %name, target = %target.display(), "generate");
        let Some(generator) = &self.node.config.root.generator else {
            tracing::warn!(node = %name, "no ramdisk generator configured");
            return;
        };
        match Command::new(generator).arg(name).arg(target).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(node = %name, %status, "ramdisk generator failed"),
            Err(e) => tracing::warn!(node = %name, error = %e, "cannot run ramdisk generator"),
        }
    }

    /// Publish the card kernel's log buffer location from its System.map.
    async fn set_log_buf_info(&self) {
        let name = self.node.name.as_str();
        let Some(map_path) = &self.node.config.boot.system_map else {
            tracing::info!(node = %name, "system map not configured");
            return;
        };
        let map = match tokio::fs::read(map_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::info!(node = %name, error = %e, "opening System.map failed");
                return;
            }
        };

        let mut published = Vec::with_capacity(2);
        for (symbol, entry) in [("__log_buf", "log_buf_addr"), ("log_buf_len", "log_buf_len")] {
            let Some(addr) = symbol_address(&map, symbol) else {
                tracing::info!(node = %name, "{symbol} not found");
                return;
            };
            if let Err(e) = self.ctx.attrs.write(name, entry, addr).await {
                tracing::info!(node = %name, error = %e, "failed to set {entry}");
                return;
            }
            published.push(addr.to_string());
        }
        tracing::info!(node = %name, addr = %published[0], len = %published[1], "debug log buffer");
    }
}

fn check_file_sources(card: &CardConfig) -> Result<(), BootError> {
    if let Some(base) = &card.files.base_image {
        if !base.exists() {
            let what = match card.files.base_kind {
                BaseKind::Cpio => "base image",
                BaseKind::Dir => "base directory",
            };
            return Err(BootError::NotFound {
                what,
                path: base.clone(),
            });
        }
    }
    for (what, dir) in [
        ("common_dir", &card.files.common_dir),
        ("node_dir", &card.files.node_dir),
    ] {
        let dir = dir.as_ref().ok_or(BootError::NotConfigured(what))?;
        if !dir.exists() {
            return Err(BootError::NotFound {
                what,
                path: dir.clone(),
            });
        }
    }
    Ok(())
}

/// Address column of `symbol` in a System.map (`<addr> <type> <symbol>`).
fn symbol_address<'a>(map: &'a str, symbol: &str) -> Option<&'a str> {
    map.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let addr = fields.next()?;
        let _kind = fields.next()?;
        (fields.next()? == symbol).then_some(addr)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_symbol_addresses() {
        let map = "ffffffff81000000 T _text\n\
                   ffffffff81c3d2a0 b __log_buf\n\
                   ffffffff81a0f6c8 d log_buf_len\n";
        assert_eq!(symbol_address(map, "__log_buf"), Some("ffffffff81c3d2a0"));
        assert_eq!(symbol_address(map, "log_buf_len"), Some("ffffffff81a0f6c8"));
        assert_eq!(symbol_address(map, "log_buf"), None);
    }

    #[test]
    fn file_sources_required() {
        let dir = tempfile::tempdir().unwrap();
        let mut card = CardConfig::new("mic0");
        assert!(matches!(
            check_file_sources(&card),
            Err(BootError::NotConfigured("common_dir"))
        ));
        card.files.common_dir = Some(dir.path().to_path_buf());
        card.files.node_dir = Some(dir.path().join("missing"));
        assert!(matches!(
            check_file_sources(&card),
            Err(BootError::NotFound { what: "node_dir", .. })
        ));
        card.files.node_dir = Some(dir.path().to_path_buf());
        assert!(check_file_sources(&card).is_ok());
        card.files.base_image = Some(dir.path().join("base.cpio.gz"));
        assert!(matches!(
            check_file_sources(&card),
            Err(BootError::NotFound { what: "base image", .. })
        ));
    }
}
