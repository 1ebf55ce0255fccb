//! Nullable node attributes: an in-memory attribute table.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use cardkeeper_sysfs::{AttributeError, NodeAttributes, WaitOutcome};

type Key = (String, String);

/// One write observed by the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedWrite {
    pub node: String,
    pub entry: String,
    pub value: String,
}

/// A rule applied after a matching write: the entry takes a new value.
struct Transition {
    node: String,
    entry: String,
    prefix: String,
    next: String,
}

#[derive(Default)]
struct Table {
    nodes: Vec<String>,
    values: HashMap<Key, String>,
    globals: HashMap<PathBuf, String>,
    failing_reads: HashSet<Key>,
    transitions: Vec<Transition>,
    writes: Vec<RecordedWrite>,
}

/// In-memory attributes with change notification.
///
/// Every `set` or scripted transition bumps a version counter that wakes
/// all `wait_change` callers; callers re-read and compare, so spurious
/// wakeups are harmless.
pub struct NullAttributes {
    table: Mutex<Table>,
    version: watch::Sender<u64>,
}

impl NullAttributes {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            table: Mutex::new(Table::default()),
            version,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Register a node with an initial state.
    pub fn add_node(&self, node: &str, state: &str) {
        let mut table = self.lock();
        table.nodes.push(node.to_string());
        table
            .values
            .insert((node.to_string(), "state".into()), state.to_string());
    }

    /// Set an attribute value and wake waiters.
    pub fn set(&self, node: &str, entry: &str, value: &str) {
        self.lock()
            .values
            .insert((node.to_string(), entry.to_string()), value.to_string());
        self.notify();
    }

    pub fn set_global(&self, path: impl Into<PathBuf>, value: &str) {
        self.lock().globals.insert(path.into(), value.to_string());
    }

    /// Make reads of this attribute fail until `heal_reads` is called.
    pub fn fail_reads(&self, node: &str, entry: &str) {
        self.lock()
            .failing_reads
            .insert((node.to_string(), entry.to_string()));
    }

    pub fn heal_reads(&self, node: &str, entry: &str) {
        self.lock()
            .failing_reads
            .remove(&(node.to_string(), entry.to_string()));
    }

    /// After a write to `node/entry` starting with `prefix`, the entry reads
    /// back as `next`.
    pub fn on_write(&self, node: &str, entry: &str, prefix: &str, next: &str) {
        self.lock().transitions.push(Transition {
            node: node.to_string(),
            entry: entry.to_string(),
            prefix: prefix.to_string(),
            next: next.to_string(),
        });
    }

    pub fn value(&self, node: &str, entry: &str) -> Option<String> {
        self.lock()
            .values
            .get(&(node.to_string(), entry.to_string()))
            .cloned()
    }

    /// Every write so far, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    /// Values written to one node's attribute, in order.
    pub fn writes_to(&self, node: &str, entry: &str) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .filter(|w| w.node == node && w.entry == entry)
            .map(|w| w.value.clone())
            .collect()
    }
}

impl Default for NullAttributes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeAttributes for NullAttributes {
    async fn read(&self, node: &str, entry: &str) -> Result<String, AttributeError> {
        let key = (node.to_string(), entry.to_string());
        let path = PathBuf::from(node).join(entry);
        let table = self.lock();
        if table.failing_reads.contains(&key) {
            return Err(AttributeError::Read {
                path,
                source: io::Error::from(io::ErrorKind::PermissionDenied),
            });
        }
        table
            .values
            .get(&key)
            .map(|v| v.trim_end().to_string())
            .ok_or(AttributeError::Read {
                path,
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }

    async fn write(&self, node: &str, entry: &str, value: &str) -> Result<(), AttributeError> {
        {
            let mut table = self.lock();
            table.writes.push(RecordedWrite {
                node: node.to_string(),
                entry: entry.to_string(),
                value: value.to_string(),
            });
            let next = table
                .transitions
                .iter()
                .find(|t| t.node == node && t.entry == entry && value.starts_with(&t.prefix))
                .map(|t| t.next.clone());
            let stored = next.unwrap_or_else(|| value.to_string());
            table
                .values
                .insert((node.to_string(), entry.to_string()), stored);
        }
        self.notify();
        Ok(())
    }

    async fn wait_change(
        &self,
        _node: &str,
        _entry: &str,
        timeout: Duration,
    ) -> Result<WaitOutcome, AttributeError> {
        let mut rx = self.version.subscribe();
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => Ok(WaitOutcome::Changed),
            Ok(Err(_)) | Err(_) => Ok(WaitOutcome::TimedOut),
        }
    }

    async fn enumerate(&self) -> Result<Vec<String>, AttributeError> {
        Ok(self.lock().nodes.clone())
    }

    async fn read_global(&self, path: &Path) -> Result<String, AttributeError> {
        self.lock()
            .globals
            .get(path)
            .map(|v| v.trim_end().to_string())
            .ok_or(AttributeError::Read {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }
}
