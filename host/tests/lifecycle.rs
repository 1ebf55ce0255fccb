mod common;

use std::fs;

use cardkeeper_host::crash_dump::{spawn_crash_capture, CrashDumpCapture, ResetOutcome};
use cardkeeper_host::state_watcher::spawn_state_watcher;
use cardkeeper_host::WorkerKind;
use cardkeeper_types::NodeState;

use common::{eventually, Harness};

#[tokio::test]
async fn watcher_tracks_transitions() {
    let h = Harness::new(&[("mic0", "ready")]).await;
    let node = h.node("mic0");
    assert!(spawn_state_watcher(&h.ctx, &node));
    assert!(!spawn_state_watcher(&h.ctx, &node));

    h.attrs.set("mic0", "state", "booting");
    let n = node.clone();
    eventually(move || n.last_state() == NodeState::Booting).await;
    h.attrs.set("mic0", "state", "online");
    let n = node.clone();
    eventually(move || n.last_state() == NodeState::Online).await;
}

#[tokio::test]
async fn watcher_exits_when_state_unreadable() {
    let h = Harness::new(&[("mic0", "ready")]).await;
    let node = h.node("mic0");
    spawn_state_watcher(&h.ctx, &node);
    h.attrs.fail_reads("mic0", "state");

    let n = node.clone();
    eventually(move || !n.workers.is_running(WorkerKind::State)).await;
}

#[tokio::test]
async fn lost_card_is_reset_and_rebooted() {
    let h = Harness::with(&[("mic0", "online")], |c| {
        c.cards[0].boot.on_start = true;
    })
    .await;
    h.attrs.on_write("mic0", "state", "reset:force", "ready");
    h.attrs.set_global(h.dir.path().join("auto_reboot"), "1\n");
    let node = h.node("mic0");
    spawn_state_watcher(&h.ctx, &node);

    h.attrs.set("mic0", "state", "lost");
    eventually(|| h.state_writes("mic0").len() == 2).await;
    let writes = h.state_writes("mic0");
    assert_eq!(writes[0], "reset:force");
    assert!(writes[1].starts_with("boot:linux:"));
}

#[tokio::test]
async fn no_reboot_without_auto_reboot() {
    let h = Harness::with(&[("mic0", "lost")], |c| {
        c.cards[0].boot.on_start = true;
    })
    .await;
    h.attrs.on_write("mic0", "state", "reset:force", "ready");
    h.attrs.set_global(h.dir.path().join("auto_reboot"), "0");

    let outcome = CrashDumpCapture::new(h.ctx.clone(), h.node("mic0")).run().await;
    assert_eq!(outcome, ResetOutcome::Ready);
    assert_eq!(h.state_writes("mic0"), vec!["reset:force"]);
    assert!(!h.node("mic0").workers.is_running(WorkerKind::Boot));
}

#[tokio::test]
async fn someone_else_recovered_the_card() {
    let h = Harness::new(&[("mic0", "lost")]).await;
    h.attrs.on_write("mic0", "state", "reset:force", "booting");

    let outcome = CrashDumpCapture::new(h.ctx.clone(), h.node("mic0")).run().await;
    assert_eq!(outcome, ResetOutcome::Recovered);
}

#[tokio::test]
async fn failed_reset_is_reported() {
    let h = Harness::new(&[("mic0", "lost")]).await;
    h.attrs.on_write("mic0", "state", "reset:force", "reset failed");

    let outcome = CrashDumpCapture::new(h.ctx.clone(), h.node("mic0")).run().await;
    assert_eq!(outcome, ResetOutcome::Failed);
}

#[tokio::test]
async fn capture_writes_dump_before_reset() {
    let h = Harness::with(&[("mic0", "lost")], |c| {
        c.cards[0].misc.crash_dump_limit_gb = 1;
        c.crash_dump.min_free_bytes = 0;
        c.crash_dump.chunk_bytes = 64 * 1024;
        c.tools.gzip = "/bin/true".into();
    })
    .await;
    fs::create_dir_all(h.dir.path().join("vmcore")).unwrap();
    fs::write(h.dir.path().join("vmcore").join("mic0"), vec![5u8; 100_000]).unwrap();
    h.attrs.on_write("mic0", "state", "reset:force", "ready");

    let node = h.node("mic0");
    assert!(spawn_crash_capture(&h.ctx, &node));
    let n = node.clone();
    eventually(move || !n.workers.is_running(WorkerKind::Crash)).await;

    let dumps: Vec<_> = fs::read_dir(h.dir.path().join("crash").join("mic0"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(dumps.len(), 1);
    assert_eq!(fs::metadata(&dumps[0]).unwrap().len(), 100_000);
    assert_eq!(h.state_writes("mic0"), vec!["reset:force"]);
}
