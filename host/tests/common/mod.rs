#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use cardkeeper_host::config::RootKind;
use cardkeeper_host::{
    BootError, BootImageValidator, CardConfig, DaemonConfig, DaemonContext, Node, NodeRegistry,
};
use cardkeeper_network::{Connection, Transport};
use cardkeeper_nullables::{NullAttributes, NullFabric};
use cardkeeper_protocol::{
    write_opcode, write_u16, Opcode, DEFAULT_MONITOR_PORT, DEFAULT_MONITOR_REPLY_PORT,
};
use cardkeeper_sysfs::NodeAttributes;
use cardkeeper_types::{FabricAddr, NodeId, HOST_FABRIC_NODE};

/// Accepts every image.
pub struct AcceptAll;

#[async_trait]
impl BootImageValidator for AcceptAll {
    async fn validate(&self, _image: &Path) -> Result<(), BootError> {
        Ok(())
    }
}

pub struct Harness {
    pub ctx: Arc<DaemonContext>,
    pub attrs: Arc<NullAttributes>,
    pub fabric: NullFabric,
    pub dir: TempDir,
}

pub fn card(dir: &Path, name: &str) -> CardConfig {
    let mut card = CardConfig::new(name);
    card.files.common_dir = Some(dir.to_path_buf());
    card.files.node_dir = Some(dir.to_path_buf());
    card.boot.os_image = Some(dir.join("bzImage"));
    card.root.kind = RootKind::StaticRamfs;
    card.root.target = Some(dir.join(format!("{name}.image.gz")));
    card.misc.crash_dump_dir = dir.join("crash");
    card.misc.crash_dump_limit_gb = 0;
    card
}

fn config(dir: &Path, cards: Vec<CardConfig>) -> DaemonConfig {
    let mut config = DaemonConfig {
        cards,
        ..DaemonConfig::default()
    };
    let t = &mut config.timeouts;
    t.shutdown_wait_secs = 5;
    t.reset_wait_secs = 5;
    t.crash_reset_wait_secs = 5;
    t.total_shutdown_secs = 30;
    t.accept_backoff_ms = 10;
    t.reconnect_interval_ms = 10;
    t.state_poll_ms = 10;
    t.crash_poll_ms = 10;
    config.credentials.passwd_file = dir.join("passwd");
    config.crash_dump.vmcore_dir = dir.join("vmcore");
    config.crash_dump.oops_dir = dir.join("oops");
    config.auto_reboot_attribute = dir.join("auto_reboot");
    config.state_dir = dir.to_path_buf();
    config
}

impl Harness {
    /// A context over `(name, initial state)` cards with fast timeouts.
    pub async fn new(cards: &[(&str, &str)]) -> Self {
        Self::with(cards, |_| {}).await
    }

    pub async fn with(cards: &[(&str, &str)], tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(
            dir.path(),
            cards.iter().map(|(name, _)| card(dir.path(), name)).collect(),
        );
        tweak(&mut config);

        let attrs = Arc::new(NullAttributes::new());
        for (name, state) in cards {
            attrs.add_node(name, state);
        }
        let fabric = NullFabric::new();
        let dyn_attrs: Arc<dyn NodeAttributes> = attrs.clone();
        let transport: Arc<dyn Transport> = Arc::new(fabric.endpoint(HOST_FABRIC_NODE));
        let registry = NodeRegistry::discover(&config, dyn_attrs.as_ref())
            .await
            .unwrap();
        let ctx = DaemonContext::new(config, registry, dyn_attrs, transport, Arc::new(AcceptAll));
        Self {
            ctx,
            attrs,
            fabric,
            dir,
        }
    }

    pub fn node(&self, name: &str) -> Arc<Node> {
        Arc::clone(self.ctx.registry.by_name(name).unwrap())
    }

    /// State commands written to one card, in order.
    pub fn state_writes(&self, name: &str) -> Vec<String> {
        self.attrs.writes_to(name, "state")
    }
}

/// Drive the card side of the monitor handshake up to the port report.
///
/// Returns the agent's connection to the host and the host's connection
/// back to the agent. `skew` is added to the port the agent reports.
pub async fn agent_handshake(fabric: &NullFabric, node: NodeId, skew: u16) -> (Connection, Connection) {
    let card = fabric.endpoint(node.fabric_node());
    let mut reply = card.listen(DEFAULT_MONITOR_REPLY_PORT).await.unwrap();
    let mut to_host = card
        .connect(FabricAddr::new(HOST_FABRIC_NODE, DEFAULT_MONITOR_PORT))
        .await
        .unwrap();
    write_opcode(&mut to_host, Opcode::MonitorStart).await.unwrap();
    let mut from_host = reply.accept().await.unwrap();
    write_u16(&mut from_host, to_host.local_port().wrapping_add(skew))
        .await
        .unwrap();
    (to_host, from_host)
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

pub fn current_ids() -> (u32, u32) {
    // SAFETY: getuid/getgid cannot fail.
    unsafe { (libc::getuid(), libc::getgid()) }
}
