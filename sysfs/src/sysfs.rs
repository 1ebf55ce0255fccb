//! Attributes backed by the driver's sysfs class directory.

use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::{AttributeError, NodeAttributes, WaitOutcome};

/// `<class_dir>/<node>/<entry>` files, e.g. `/sys/class/mic/mic0/state`.
#[derive(Clone, Debug)]
pub struct SysfsAttributes {
    class_dir: PathBuf,
}

impl SysfsAttributes {
    pub fn new(class_dir: impl Into<PathBuf>) -> Self {
        Self {
            class_dir: class_dir.into(),
        }
    }

    fn path(&self, node: &str, entry: &str) -> PathBuf {
        self.class_dir.join(node).join(entry)
    }
}

fn trim_value(raw: &str) -> String {
    raw.trim_end().to_string()
}

/// Arm a sysfs notification by reading the file, then poll for
/// `POLLPRI | POLLERR`.
fn poll_change(path: &Path, timeout: Duration) -> io::Result<WaitOutcome> {
    let mut file = std::fs::File::open(path)?;
    let mut scratch = [0u8; 4096];
    let _ = file.read(&mut scratch)?;

    let mut fds = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLPRI | libc::POLLERR,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: `fds` is a valid pollfd for an fd owned by `file`, which
    // outlives the call.
    let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
    match ret {
        0 => Ok(WaitOutcome::TimedOut),
        n if n > 0 => Ok(WaitOutcome::Changed),
        _ => {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(WaitOutcome::Interrupted)
            } else {
                Err(err)
            }
        }
    }
}

#[async_trait]
impl NodeAttributes for SysfsAttributes {
    async fn read(&self, node: &str, entry: &str) -> Result<String, AttributeError> {
        let path = self.path(node, entry);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(trim_value(&raw)),
            Err(source) => Err(AttributeError::Read { path, source }),
        }
    }

    async fn write(&self, node: &str, entry: &str, value: &str) -> Result<(), AttributeError> {
        use tokio::io::AsyncWriteExt;

        let path = self.path(node, entry);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.write_all(value.as_bytes()).await?;
            file.flush().await
        }
        .await;
        result.map_err(|source| AttributeError::Write { path, source })
    }

    async fn wait_change(
        &self,
        node: &str,
        entry: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, AttributeError> {
        let path = self.path(node, entry);
        let probe = path.clone();
        tokio::task::spawn_blocking(move || poll_change(&probe, timeout))
            .await
            .map_err(|e| AttributeError::Join(e.to_string()))?
            .map_err(|source| AttributeError::Wait { path, source })
    }

    async fn enumerate(&self) -> Result<Vec<String>, AttributeError> {
        let enumerate_err = |source| AttributeError::Enumerate {
            path: self.class_dir.clone(),
            source,
        };
        let mut dir = tokio::fs::read_dir(&self.class_dir)
            .await
            .map_err(enumerate_err)?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(enumerate_err)? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_global(&self, path: &Path) -> Result<String, AttributeError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Ok(trim_value(&raw)),
            Err(source) => Err(AttributeError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardkeeper_types::{NodeState, StateCommand};

    fn fixture() -> (tempfile::TempDir, SysfsAttributes) {
        let dir = tempfile::tempdir().unwrap();
        for (node, state) in [("mic0", "ready\n"), ("mic1", "online\n")] {
            std::fs::create_dir(dir.path().join(node)).unwrap();
            std::fs::write(dir.path().join(node).join("state"), state).unwrap();
        }
        let attrs = SysfsAttributes::new(dir.path());
        (dir, attrs)
    }

    #[tokio::test]
    async fn reads_trimmed_state() {
        let (_dir, attrs) = fixture();
        assert_eq!(attrs.read("mic0", "state").await.unwrap(), "ready");
        assert_eq!(attrs.read_state("mic1").await.unwrap(), NodeState::Online);
    }

    #[tokio::test]
    async fn missing_attribute_is_read_error() {
        let (_dir, attrs) = fixture();
        let err = attrs.read("mic0", "mode").await.unwrap_err();
        assert!(matches!(err, AttributeError::Read { .. }));
    }

    #[tokio::test]
    async fn command_is_written_verbatim() {
        let (dir, attrs) = fixture();
        attrs
            .write_command("mic0", &StateCommand::ResetForce)
            .await
            .unwrap();
        let written = std::fs::read_to_string(dir.path().join("mic0/state")).unwrap();
        assert!(written.starts_with("reset:force"));
    }

    #[tokio::test]
    async fn enumerates_sorted_node_names() {
        let (_dir, attrs) = fixture();
        assert_eq!(attrs.enumerate().await.unwrap(), vec!["mic0", "mic1"]);
    }

    #[tokio::test]
    async fn plain_file_wait_times_out() {
        let (_dir, attrs) = fixture();
        let outcome = attrs
            .wait_change("mic0", "state", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[tokio::test]
    async fn reads_global_attribute() {
        let (dir, attrs) = fixture();
        let path = dir.path().join("auto_reboot");
        std::fs::write(&path, "1\n").unwrap();
        assert_eq!(attrs.read_global(&path).await.unwrap(), "1");
    }
}
