mod common;

use std::time::Duration;

use cardkeeper_host::{BootError, BootOutcome, BootWorker, Daemon, WorkerKind};
use cardkeeper_types::NodeState;

use common::Harness;

#[tokio::test]
async fn only_the_autoboot_card_is_booted() {
    let h = Harness::with(&[("mic0", "ready"), ("mic1", "ready"), ("mic2", "ready")], |c| {
        c.cards[1].boot.on_start = true;
    })
    .await;

    let daemon = Daemon::start(h.ctx.clone()).await.unwrap();
    daemon.wait_started().await;

    let boots: Vec<_> = h
        .attrs
        .writes()
        .into_iter()
        .filter(|w| w.entry == "state" && w.value.starts_with("boot:"))
        .collect();
    assert_eq!(boots.len(), 1);
    assert_eq!(boots[0].node, "mic1");
    let image = h.dir.path().join("bzImage");
    let root = h.dir.path().join("mic1.image.gz");
    assert_eq!(
        boots[0].value,
        format!("boot:linux:{}:{}", image.display(), root.display())
    );

    // Every card had its command line composed.
    for name in ["mic0", "mic1", "mic2"] {
        assert_eq!(h.attrs.writes_to(name, "cmdline").len(), 1);
    }
    daemon.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stuck_in_shutdown_times_out_without_state_writes() {
    let h = Harness::with(&[("mic0", "shutdown")], |c| {
        c.cards[0].boot.on_start = true;
        c.timeouts.shutdown_wait_secs = 3;
    })
    .await;

    let worker = BootWorker::new(h.ctx.clone(), h.node("mic0"));
    let result = worker.attempt().await;
    assert!(matches!(
        result,
        Err(BootError::WaitTimedOut(NodeState::Shutdown))
    ));
    assert!(h.state_writes("mic0").is_empty());
}

#[tokio::test(start_paused = true)]
async fn waits_out_a_reset_then_boots() {
    let h = Harness::with(&[("mic0", "resetting")], |c| {
        c.cards[0].boot.on_start = true;
    })
    .await;

    let attrs = h.attrs.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        attrs.set("mic0", "state", "ready");
    });

    let outcome = BootWorker::new(h.ctx.clone(), h.node("mic0"))
        .attempt()
        .await
        .unwrap();
    assert!(matches!(outcome, BootOutcome::Booted { .. }));
    assert_eq!(h.state_writes("mic0").len(), 1);
}

#[tokio::test]
async fn online_card_is_not_booted() {
    let h = Harness::with(&[("mic0", "online")], |c| {
        c.cards[0].boot.on_start = true;
    })
    .await;

    let result = BootWorker::new(h.ctx.clone(), h.node("mic0")).attempt().await;
    assert!(matches!(result, Err(BootError::NotReady(NodeState::Online))));
    assert!(h.state_writes("mic0").is_empty());
}

#[tokio::test]
async fn card_without_autoboot_stops_after_cmdline() {
    let h = Harness::new(&[("mic0", "ready")]).await;
    let outcome = BootWorker::new(h.ctx.clone(), h.node("mic0"))
        .attempt()
        .await
        .unwrap();
    assert_eq!(outcome, BootOutcome::NotAutoBoot);
    assert_eq!(h.attrs.writes_to("mic0", "cmdline"), vec!["quiet root=ramfs cgroup_disable=memory"]);
    assert!(h.state_writes("mic0").is_empty());
}

#[tokio::test]
async fn nfs_root_boots_from_base_image() {
    let h = Harness::with(&[("mic0", "ready")], |c| {
        let card = &mut c.cards[0];
        card.boot.on_start = true;
        card.root.kind = cardkeeper_host::config::RootKind::Nfs;
        card.root.target = Some("host:/export/mic0".into());
        card.network.ip = Some("172.31.1.1".into());
    })
    .await;
    let base = h.dir.path().join("base.cpio.gz");
    std::fs::write(&base, b"cpio").unwrap();
    // The card config is fixed at discovery; rebuild a worker over a patched node.
    let mut config = h.node("mic0").config.clone();
    config.files.base_image = Some(base.clone());
    let node = cardkeeper_host::Node::new(h.node("mic0").id, config, NodeState::Ready);

    let outcome = BootWorker::new(h.ctx.clone(), node).attempt().await.unwrap();
    assert_eq!(
        outcome,
        BootOutcome::Booted {
            image: h.dir.path().join("bzImage"),
            root: base,
        }
    );
    let cmdline = h.attrs.writes_to("mic0", "cmdline");
    assert!(cmdline[0].contains("root=nfs:host:/export/mic0 ip=172.31.1.1 netmask=255.255.255.0"));
}

#[tokio::test]
async fn second_boot_is_refused_while_one_runs() {
    let h = Harness::with(&[("mic0", "shutdown")], |c| {
        c.cards[0].boot.on_start = true;
    })
    .await;
    let node = h.node("mic0");

    assert!(cardkeeper_host::spawn_boot(&h.ctx, &node));
    assert!(!cardkeeper_host::spawn_boot(&h.ctx, &node));
    assert!(node.workers.is_running(WorkerKind::Boot));
    assert_eq!(h.ctx.starting.pending(), 1);

    node.workers.cancel(&[WorkerKind::Boot]);
    common::eventually(|| h.ctx.starting.pending() == 0).await;
    assert!(!node.workers.is_running(WorkerKind::Boot));
}
