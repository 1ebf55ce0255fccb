//! Crash capture for lost cards.
//!
//! When a card is lost its memory is exposed as a raw image. If the dump
//! directory is within quota and the volume has room, the image is copied
//! out chunk by chunk and handed to a compressor that runs while the card
//! is reset. The reset happens whether or not anything was captured.

use std::ffi::CString;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Datelike, Local, Timelike};
use memmap2::MmapOptions;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use cardkeeper_types::{NodeState, StateCommand};

use crate::boot;
use crate::context::DaemonContext;
use crate::registry::Node;
use crate::workers::WorkerKind;
use crate::CrashDumpError;

/// Start crash capture for `node` unless one is already running.
pub fn spawn_crash_capture(ctx: &Arc<DaemonContext>, node: &Arc<Node>) -> bool {
    let capture = CrashDumpCapture::new(Arc::clone(ctx), Arc::clone(node));
    let fut = async move {
        capture.run().await;
    };
    node.workers.spawn(WorkerKind::Crash, fut).is_some()
}

/// Where one capture reads from and writes to.
#[derive(Clone, Debug)]
pub struct DumpPlan {
    pub node: String,
    pub dump_dir: PathBuf,
    pub source: PathBuf,
    /// Zero disables capture.
    pub limit_bytes: u64,
    pub min_free_bytes: u64,
    pub chunk_bytes: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Dump {
    pub path: PathBuf,
    pub bytes: u64,
}

/// How the post-capture reset ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResetOutcome {
    Ready,
    Failed,
    /// Something else already brought the card back up.
    Recovered,
    TimedOut,
    Stopped,
    /// The reset could not be issued or its result cannot be read.
    Unknown,
}

/// Raises the copy's cancel flag when the capture future is dropped, so an
/// aborted worker does not leave the blocking copy running.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct CrashDumpCapture {
    ctx: Arc<DaemonContext>,
    node: Arc<Node>,
}

impl CrashDumpCapture {
    pub fn new(ctx: Arc<DaemonContext>, node: Arc<Node>) -> Self {
        Self { ctx, node }
    }

    pub fn plan(&self) -> DumpPlan {
        let config = &self.ctx.config.crash_dump;
        DumpPlan {
            node: self.node.name.clone(),
            dump_dir: self.node.config.misc.crash_dump_dir.clone(),
            source: config.vmcore_dir.join(&self.node.name),
            limit_bytes: self.node.config.crash_dump_limit_bytes(),
            min_free_bytes: config.min_free_bytes,
            chunk_bytes: config.chunk_bytes,
        }
    }

    pub async fn run(&self) -> ResetOutcome {
        let name = self.node.name.as_str();
        let plan = self.plan();
        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));
        let captured = tokio::task::spawn_blocking(move || capture(&plan, &cancel))
            .await
            .map_err(|e| CrashDumpError::Join(e.to_string()))
            .and_then(|r| r);

        let mut compressor = None;
        match captured {
            Ok(Some(dump)) => {
                tracing::info!(node = %name, path = %dump.path.display(), bytes = dump.bytes, "raw dump complete");
                compressor = self.start_compressor(&dump.path);
            }
            Ok(None) => tracing::warn!(node = %name, "crash dump disabled"),
            Err(e) => tracing::warn!(node = %name, error = %e, "crash dump aborted"),
        }

        let outcome = self.reset().await;

        if let Some((child, path)) = compressor {
            self.finish_compressor(child, &path).await;
        }

        if outcome == ResetOutcome::Ready && self.auto_reboot().await {
            if boot::spawn_boot(&self.ctx, &self.node) {
                tracing::info!(node = %name, "auto reboot");
            } else {
                tracing::warn!(node = %name, "auto reboot skipped - boot already running");
            }
        }
        outcome
    }

    fn start_compressor(&self, path: &Path) -> Option<(Child, PathBuf)> {
        let gzip = &self.ctx.config.tools.gzip;
        match Command::new(gzip).arg(path).stdin(std::process::Stdio::null()).spawn() {
            Ok(child) => {
                tracing::info!(node = %self.node.name, "compression started");
                Some((child, path.to_path_buf()))
            }
            Err(e) => {
                tracing::warn!(node = %self.node.name, tool = %gzip.display(), error = %e, "cannot start compressor");
                None
            }
        }
    }

    async fn finish_compressor(&self, mut child: Child, path: &Path) {
        let mut compressed = path.as_os_str().to_owned();
        compressed.push(&self.ctx.config.tools.compressed_suffix);
        let compressed = PathBuf::from(compressed);
        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::info!(node = %self.node.name, path = %compressed.display(), "crash dump saved");
                return;
            }
            Ok(status) => tracing::warn!(node = %self.node.name, %status, "compressor failed"),
            Err(e) => tracing::warn!(node = %self.node.name, error = %e, "cannot wait for compressor"),
        }
        if let Err(e) = tokio::fs::remove_file(&compressed).await {
            tracing::debug!(path = %compressed.display(), error = %e, "no compressed artifact to remove");
        }
    }

    /// Force a reset and wait, bounded, until it settles.
    async fn reset(&self) -> ResetOutcome {
        let name = self.node.name.as_str();
        let attrs = &self.ctx.attrs;
        if let Err(e) = attrs.write_command(name, &StateCommand::ResetForce).await {
            tracing::error!(node = %name, error = %e, "failed to set state - cannot reset");
            return ResetOutcome::Unknown;
        }
        let mut state = match attrs.read_state(name).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(node = %name, error = %e, "failed to read state - state of reset unknown");
                return ResetOutcome::Unknown;
            }
        };

        let timeouts = &self.ctx.config.timeouts;
        let deadline = Instant::now() + timeouts.crash_reset_wait();
        loop {
            match state {
                NodeState::Ready => return ResetOutcome::Ready,
                NodeState::ResetFailed => {
                    tracing::error!(node = %name, "failed to reset card - not rebooting");
                    return ResetOutcome::Failed;
                }
                NodeState::Online | NodeState::Booting => {
                    tracing::info!(node = %name, "card already rebooted by someone else");
                    return ResetOutcome::Recovered;
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                tracing::error!(node = %name, %state, "timed out waiting for reset");
                return ResetOutcome::TimedOut;
            }
            tracing::info!(node = %name, "waiting for reset");
            if !self.node.stop.sleep(timeouts.crash_poll()).await {
                return ResetOutcome::Stopped;
            }
            match attrs.read_state(name).await {
                Ok(s) => state = s,
                Err(e) => {
                    tracing::warn!(node = %name, error = %e, "failed to read state - try again")
                }
            }
        }
    }

    async fn auto_reboot(&self) -> bool {
        let path = &self.ctx.config.auto_reboot_attribute;
        match self.ctx.attrs.read_global(path).await {
            Ok(value) => {
                let enabled = value.trim().parse::<i64>().is_ok_and(|v| v != 0);
                tracing::info!(node = %self.node.name, enabled, "auto reboot setting");
                enabled
            }
            Err(e) => {
                tracing::info!(node = %self.node.name, error = %e, "cannot read auto reboot setting");
                false
            }
        }
    }
}

/// Copy the raw image out if quota and free space allow.
///
/// Returns `None` when capture is disabled. Any error, cancellation
/// included, leaves no new dump file behind.
pub fn capture(plan: &DumpPlan, cancel: &AtomicBool) -> Result<Option<Dump>, CrashDumpError> {
    if plan.limit_bytes == 0 {
        return Ok(None);
    }
    check_quota(&plan.dump_dir, plan.limit_bytes)?;

    let node_dir = plan.dump_dir.join(&plan.node);
    if let Err(e) = DirBuilder::new().mode(0o755).create(&node_dir) {
        if e.kind() != io::ErrorKind::AlreadyExists {
            return Err(CrashDumpError::io("create directory", &node_dir)(e));
        }
    }
    let available = free_space(&node_dir).map_err(CrashDumpError::io("statvfs", &node_dir))?;
    if available < plan.min_free_bytes {
        return Err(CrashDumpError::InsufficientSpace {
            available,
            required: plan.min_free_bytes,
        });
    }

    let mut source = File::open(&plan.source).map_err(CrashDumpError::io("open", &plan.source))?;
    let path = node_dir.join(dump_file_name(&Local::now()));
    let bytes = copy_chunked(&mut source, &path, plan.chunk_bytes, cancel)?;
    Ok(Some(Dump { path, bytes }))
}

fn check_quota(dir: &Path, limit: u64) -> Result<(), CrashDumpError> {
    let usage = match fs::symlink_metadata(dir) {
        Ok(_) => dir_usage(dir).map_err(CrashDumpError::io("measure", dir))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)
                .map_err(CrashDumpError::io("create directory", dir))?;
            0
        }
        Err(e) => return Err(CrashDumpError::io("stat", dir)(e)),
    };
    if usage > limit {
        return Err(CrashDumpError::QuotaExceeded {
            dir: dir.to_path_buf(),
            usage,
            limit,
        });
    }
    Ok(())
}

/// Total size of the regular files under `dir`. Symlinks are not followed.
fn dir_usage(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_usage(&entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

fn free_space(path: &Path) -> io::Result<u64> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: statvfs fills the zeroed struct; the path is NUL-terminated.
    let stat = unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(io::Error::last_os_error());
        }
        stat
    };
    Ok((stat.f_bsize as u64).saturating_mul(stat.f_bfree as u64))
}

/// `vmcore-<Y>-<M>-<D>-<h>:<m>:<s>`, fields unpadded.
pub fn dump_file_name<T: Datelike + Timelike>(at: &T) -> String {
    format!(
        "vmcore-{}-{}-{}-{}:{}:{}",
        at.year(),
        at.month(),
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    )
}

fn copy_chunked(
    source: &mut File,
    path: &Path,
    chunk: u64,
    cancel: &AtomicBool,
) -> Result<u64, CrashDumpError> {
    let dest = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CrashDumpError::io("create", path))?;
    let result = fill(&dest, source, chunk, cancel, path);
    if result.is_err() {
        let _ = fs::remove_file(path);
    }
    result
}

/// Extend the file by one chunk, map it, read into the mapping and trim to
/// what was read. Stops after the first short chunk, or before the next
/// chunk once `cancel` is raised.
fn fill(
    dest: &File,
    source: &mut File,
    chunk: u64,
    cancel: &AtomicBool,
    path: &Path,
) -> Result<u64, CrashDumpError> {
    let io_err = CrashDumpError::io("copy to", path);
    // SAFETY: sysconf has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if chunk == 0 || page <= 0 || chunk % page as u64 != 0 {
        return Err(io_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk size {chunk} is not a multiple of the page size"),
        )));
    }
    let len = usize::try_from(chunk)
        .map_err(|_| io_err(io::Error::from(io::ErrorKind::InvalidInput)))?;

    let mut total = 0u64;
    let step = |total: u64, source: &mut File| -> io::Result<u64> {
        dest.set_len(total + chunk)?;
        // SAFETY: the region was just allocated by set_len and this file is
        // private to the capture; the map is dropped before the next resize.
        let mut map = unsafe { MmapOptions::new().offset(total).len(len).map_mut(dest)? };
        let read = read_full(source, &mut map[..])?;
        drop(map);
        dest.set_len(total + read as u64)?;
        Ok(read as u64)
    };
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(CrashDumpError::Cancelled);
        }
        let read = step(total, source).map_err(CrashDumpError::io("copy to", path))?;
        total += read;
        if read < chunk {
            return Ok(total);
        }
    }
}

fn read_full(source: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
