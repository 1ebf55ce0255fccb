mod common;

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use cardkeeper_host::cookie::get_cookie;
use cardkeeper_host::credentials::run_credential_broker;
use cardkeeper_host::monitor::run_monitor_listener;
use cardkeeper_host::users::UserEntry;
use cardkeeper_network::{Connection, Transport};
use cardkeeper_protocol::{
    read_opcode, read_u16, read_u32, write_opcode, write_u32, CredStatus, CredentialRequest,
    Opcode,
};
use cardkeeper_types::{FabricAddr, HOST_FABRIC_NODE};

use common::{agent_handshake, current_ids, Harness};

fn tester(home: &std::path::Path) -> UserEntry {
    let (uid, gid) = current_ids();
    UserEntry {
        name: "tester".into(),
        uid,
        gid,
        home: home.to_path_buf(),
    }
}

#[tokio::test]
async fn cookie_survives_reads_and_heals_symlink() {
    let home = tempfile::tempdir().unwrap();
    let user = tester(home.path());
    let file = std::path::PathBuf::from(".cardcookie");

    let first = get_cookie(user.clone(), file.clone()).await.unwrap();
    let again = get_cookie(user.clone(), file.clone()).await.unwrap();
    assert_eq!(first, again);

    let path = home.path().join(&file);
    let decoy = home.path().join("decoy");
    fs::write(&decoy, first.as_bytes()).unwrap();
    fs::remove_file(&path).unwrap();
    std::os::unix::fs::symlink(&decoy, &path).unwrap();

    let healed = get_cookie(user, file).await.unwrap();
    assert_ne!(healed, first);
    let meta = fs::symlink_metadata(&path).unwrap();
    assert!(meta.file_type().is_file());
    assert_eq!(meta.nlink(), 1);
    assert_eq!(fs::read(&path).unwrap(), healed.as_bytes());
}

async fn start_listeners(h: &Harness) {
    let ports = &h.ctx.config.ports;
    let monitor = h.ctx.transport.listen(ports.monitor).await.unwrap();
    let credential = h.ctx.transport.listen(ports.credential).await.unwrap();
    tokio::spawn(run_monitor_listener(Arc::clone(&h.ctx), monitor));
    tokio::spawn(run_credential_broker(Arc::clone(&h.ctx), credential));
}

fn write_passwd(h: &Harness) {
    let (uid, gid) = current_ids();
    fs::write(
        h.dir.path().join("passwd"),
        format!(
            "tester:x:{uid}:{gid}::{}:/bin/sh\n",
            h.dir.path().display()
        ),
    )
    .unwrap();
}

async fn request(h: &Harness, uid: u64) -> Connection {
    let mut conn = h
        .fabric
        .endpoint(1)
        .connect(FabricAddr::new(HOST_FABRIC_NODE, h.ctx.config.ports.credential))
        .await
        .unwrap();
    conn.write_all(&uid.to_ne_bytes()).await.unwrap();
    conn.flush().await.unwrap();
    conn
}

async fn monitored(h: &Harness, name: &str) -> (Connection, Connection) {
    let (mut to_host, mut from_host) = agent_handshake(&h.fabric, h.node(name).id, 0).await;
    read_u16(&mut to_host).await.unwrap();
    assert_eq!(
        read_opcode(&mut from_host).await.unwrap(),
        Opcode::MonitorStartAck
    );
    (to_host, from_host)
}

#[tokio::test]
async fn ack_and_lost_card_both_complete_the_job() {
    let h = Harness::new(&[("mic0", "online"), ("mic1", "online")]).await;
    write_passwd(&h);
    start_listeners(&h).await;
    let (mut to_host0, mut from_host0) = monitored(&h, "mic0").await;
    let (to_host1, mut from_host1) = monitored(&h, "mic1").await;

    let (uid, _) = current_ids();
    let mut requester = request(&h, u64::from(uid)).await;

    let mut jobs = Vec::new();
    for from_host in [&mut from_host0, &mut from_host1] {
        assert_eq!(
            read_opcode(&mut *from_host).await.unwrap(),
            Opcode::ReqCredential
        );
        let req = CredentialRequest::read_body(&mut *from_host).await.unwrap();
        assert_eq!(req.username, "tester");
        let stored = fs::read(h.dir.path().join(".cardcookie")).unwrap();
        assert_eq!(stored, req.cookie.as_bytes());
        jobs.push(req.job_id);
    }
    assert_eq!(jobs[0], jobs[1]);

    write_opcode(&mut to_host0, Opcode::ReqCredentialAck).await.unwrap();
    write_u32(&mut to_host0, jobs[0]).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(100), read_u32(&mut requester))
            .await
            .is_err(),
        "replied before every card answered"
    );

    drop(to_host1);
    let status = read_u32(&mut requester).await.unwrap();
    assert_eq!(status, CredStatus::Success.as_u32());
    assert_eq!(h.ctx.jobs.pending_jobs().await, 0);
}

#[tokio::test]
async fn nack_counts_as_an_answer() {
    let h = Harness::new(&[("mic0", "online")]).await;
    write_passwd(&h);
    start_listeners(&h).await;
    let (mut to_host, mut from_host) = monitored(&h, "mic0").await;

    let (uid, _) = current_ids();
    let mut requester = request(&h, u64::from(uid)).await;
    read_opcode(&mut from_host).await.unwrap();
    let req = CredentialRequest::read_body(&mut from_host).await.unwrap();

    write_opcode(&mut to_host, Opcode::ReqCredentialNack).await.unwrap();
    write_u32(&mut to_host, req.job_id).await.unwrap();
    assert_eq!(
        read_u32(&mut requester).await.unwrap(),
        CredStatus::Success.as_u32()
    );
}

#[tokio::test]
async fn no_reachable_cards_replies_at_once() {
    let h = Harness::new(&[("mic0", "online")]).await;
    write_passwd(&h);
    start_listeners(&h).await;

    let (uid, _) = current_ids();
    let mut requester = request(&h, u64::from(uid)).await;
    assert_eq!(
        read_u32(&mut requester).await.unwrap(),
        CredStatus::Success.as_u32()
    );
    assert!(h.dir.path().join(".cardcookie").exists());
}

#[tokio::test]
async fn unknown_uid_is_refused() {
    let h = Harness::new(&[("mic0", "online")]).await;
    write_passwd(&h);
    start_listeners(&h).await;

    let mut requester = request(&h, 4_000_000_000).await;
    assert_eq!(
        read_u32(&mut requester).await.unwrap(),
        CredStatus::FailUnknownUid.as_u32()
    );
}
