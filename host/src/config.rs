//! Daemon and per-card configuration with TOML file support.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cardkeeper_protocol::{DEFAULT_CREDENTIAL_PORT, DEFAULT_MONITOR_PORT, DEFAULT_MONITOR_REPLY_PORT};
use cardkeeper_types::NodeId;

use crate::ConfigError;

/// Configuration for the host daemon.
///
/// Loaded from a TOML file via [`DaemonConfig::from_toml_file`] or built
/// programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Append-only log file. Logs go to stderr when unset.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Single-instance lock file.
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Written once bring-up completes.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,

    /// Scratch space for boot image validation.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Driver class directory holding one attribute directory per card.
    #[serde(default = "default_sysfs_dir")]
    pub sysfs_dir: PathBuf,

    /// Global attribute enabling re-boot after crash capture.
    #[serde(default = "default_auto_reboot_attribute")]
    pub auto_reboot_attribute: PathBuf,

    #[serde(default)]
    pub ports: PortConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub tools: ToolConfig,

    #[serde(default)]
    pub credentials: CredentialConfig,

    #[serde(default)]
    pub crash_dump: CrashDumpConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default, rename = "card")]
    pub cards: Vec<CardConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    pub monitor: u16,
    pub monitor_reply: u16,
    pub credential: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Ceiling on BootWorker's wait for a card to leave "shutdown".
    pub shutdown_wait_secs: u64,
    /// Ceiling on BootWorker's wait for a card to leave "resetting".
    pub reset_wait_secs: u64,
    /// Ceiling on crash capture's wait for the forced reset.
    pub crash_reset_wait_secs: u64,
    /// Ceiling on the whole termination path.
    pub total_shutdown_secs: u64,
    pub accept_backoff_ms: u64,
    pub reconnect_interval_ms: u64,
    pub state_poll_ms: u64,
    pub crash_poll_ms: u64,
}

impl TimeoutConfig {
    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }

    pub fn reset_wait(&self) -> Duration {
        Duration::from_secs(self.reset_wait_secs)
    }

    pub fn crash_reset_wait(&self) -> Duration {
        Duration::from_secs(self.crash_reset_wait_secs)
    }

    pub fn total_shutdown(&self) -> Duration {
        Duration::from_secs(self.total_shutdown_secs)
    }

    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn state_poll(&self) -> Duration {
        Duration::from_millis(self.state_poll_ms)
    }

    pub fn crash_poll(&self) -> Duration {
        Duration::from_millis(self.crash_poll_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Used both to inflate the kernel payload and to compress crash dumps.
    pub gzip: PathBuf,
    /// Suffix the compressor appends to its output.
    pub compressed_suffix: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    pub passwd_file: PathBuf,
    /// Cookie file name, relative to each user's home directory.
    pub cookie_file: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CrashDumpConfig {
    /// Directory of raw card memory images, one file per card.
    pub vmcore_dir: PathBuf,
    /// Directory of buffered diagnostic logs, `<name>_prev` per card.
    pub oops_dir: PathBuf,
    pub chunk_bytes: u64,
    pub min_free_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub bind_address: IpAddr,
}

/// Configuration of one card.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CardConfig {
    pub name: String,

    /// Card number. Derived from the trailing digits of `name` when unset.
    #[serde(default)]
    pub id: Option<u16>,

    /// Fabric address used by the TCP transport.
    #[serde(default)]
    pub address: Option<IpAddr>,

    #[serde(default)]
    pub boot: BootConfig,

    #[serde(default)]
    pub root: RootConfig,

    #[serde(default)]
    pub files: FileConfig,

    #[serde(default)]
    pub network: CardNetworkConfig,

    #[serde(default)]
    pub misc: MiscConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootConfig {
    pub on_start: bool,
    pub os_image: Option<PathBuf>,
    pub system_map: Option<PathBuf>,
    pub verbose: bool,
    pub console: Option<String>,
    pub extra_cmdline: Option<String>,
    pub power_management: Option<String>,
    pub cgroup_memory: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootKind {
    /// Ramdisk regenerated before every boot.
    #[default]
    Ramfs,
    StaticRamfs,
    Nfs,
    SplitNfs,
    Pfs,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RootConfig {
    pub kind: RootKind,
    pub target: Option<PathBuf>,
    /// Invoked as `<generator> <card name> <target>` for `ramfs`.
    pub generator: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseKind {
    #[default]
    Cpio,
    Dir,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub base_image: Option<PathBuf>,
    pub base_kind: BaseKind,
    pub common_dir: Option<PathBuf>,
    pub node_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CardNetworkConfig {
    pub ip: Option<String>,
    pub prefix: Option<u8>,
    pub mtu: Option<u32>,
    pub mac: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MiscConfig {
    /// Zero forces an immediate reset at daemon shutdown.
    pub shutdown_timeout_secs: u64,
    pub crash_dump_dir: PathBuf,
    /// Zero disables crash capture.
    pub crash_dump_limit_gb: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/var/lock/cardkeeper.lock")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/tmp")
}

fn default_sysfs_dir() -> PathBuf {
    PathBuf::from("/sys/class/mic")
}

fn default_auto_reboot_attribute() -> PathBuf {
    PathBuf::from("/sys/devices/virtual/mic/scif/watchdog_auto_reboot")
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            monitor: DEFAULT_MONITOR_PORT,
            monitor_reply: DEFAULT_MONITOR_REPLY_PORT,
            credential: DEFAULT_CREDENTIAL_PORT,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            shutdown_wait_secs: 180,
            reset_wait_secs: 180,
            crash_reset_wait_secs: 600,
            total_shutdown_secs: 300,
            accept_backoff_ms: 1000,
            reconnect_interval_ms: 1000,
            state_poll_ms: 1000,
            crash_poll_ms: 2000,
        }
    }
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            gzip: PathBuf::from("/bin/gzip"),
            compressed_suffix: ".gz".to_string(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            passwd_file: PathBuf::from("/etc/passwd"),
            cookie_file: ".cardcookie".to_string(),
        }
    }
}

impl Default for CrashDumpConfig {
    fn default() -> Self {
        Self {
            vmcore_dir: PathBuf::from("/proc/mic_vmcore"),
            oops_dir: PathBuf::from("/proc/mic_ramoops"),
            chunk_bytes: 1 << 30,
            min_free_bytes: 32 << 30,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: 300,
            crash_dump_dir: PathBuf::from("/var/crash/mic"),
            crash_dump_limit_gb: 16,
        }
    }
}

// ── Impl ───────────────────────────────────────────────────────────────

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for card in &self.cards {
            if !names.insert(card.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate card {}", card.name)));
            }
            let id = card.node_id()?;
            if !ids.insert(id) {
                return Err(ConfigError::Invalid(format!("duplicate card id {id}")));
            }
        }
        let mut components = Path::new(&self.credentials.cookie_file).components();
        let plain = matches!(components.next(), Some(Component::Normal(_)))
            && components.next().is_none();
        if !plain {
            return Err(ConfigError::Invalid(format!(
                "cookie_file must be a plain file name, got '{}'",
                self.credentials.cookie_file
            )));
        }
        if self.crash_dump.chunk_bytes == 0 {
            return Err(ConfigError::Invalid("crash_dump.chunk_bytes must be non-zero".into()));
        }
        Ok(())
    }

    pub fn card(&self, name: &str) -> Option<&CardConfig> {
        self.cards.iter().find(|c| c.name == name)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_file: None,
            log_level: default_log_level(),
            log_format: default_log_format(),
            lock_file: default_lock_file(),
            pid_file: None,
            state_dir: default_state_dir(),
            sysfs_dir: default_sysfs_dir(),
            auto_reboot_attribute: default_auto_reboot_attribute(),
            ports: PortConfig::default(),
            timeouts: TimeoutConfig::default(),
            tools: ToolConfig::default(),
            credentials: CredentialConfig::default(),
            crash_dump: CrashDumpConfig::default(),
            transport: TransportConfig::default(),
            cards: Vec::new(),
        }
    }
}

impl CardConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn node_id(&self) -> Result<NodeId, ConfigError> {
        match self.id {
            Some(id) => NodeId::new(id),
            None => NodeId::from_name(&self.name),
        }
        .map_err(|e| ConfigError::Invalid(format!("card {}: {e}", self.name)))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.misc.shutdown_timeout_secs)
    }

    pub fn crash_dump_limit_bytes(&self) -> u64 {
        self.misc.crash_dump_limit_gb.saturating_mul(1 << 30)
    }
}
