#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use maplit::btreeset;
use serde_json::json;
use warden_core::SpawnOptions;
use warden_core::checkpoint;
use warden_core::migrate;
use warden_core::restore;
use warden_core::supervisor;
use warden_protocol::error::SandboxErr;
use warden_protocol::protocol::Instr;

const KEY: [u8; 32] = [7u8; 32];
const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

fn opts() -> SpawnOptions {
    SpawnOptions {
        policy: Some(warden_policy::CompiledPolicy::single(
            warden_policy::SandboxRules::new().allow_fs("/tmp").allow_import("math"),
        )),
        cpu_ms: Some(500),
        mem_bytes: Some(1 << 20),
        allowed_imports: Some(btreeset! {"strings".to_string()}),
        numa_node: None,
    }
}

#[tokio::test]
async fn checkpoint_restore_round_trips_the_config() {
    let sb = supervisor::spawn("ckpt-rt", opts()).await.unwrap();
    let original = sb.snapshot();

    let blob = checkpoint(sb, &KEY).await.unwrap();
    let restored = restore(&blob, &KEY).await.unwrap();
    assert_eq!(restored.snapshot(), original);

    // The restored sandbox is live and usable.
    restored.exec_one(Instr::post(json!("back"))).await.unwrap();
    assert_eq!(restored.recv(RECV_TIMEOUT).await.unwrap(), json!("back"));
    restored.close().await.unwrap();
}

#[tokio::test]
async fn checkpoint_closes_the_sandbox() {
    let sb = supervisor::spawn("ckpt-close", SpawnOptions::default()).await.unwrap();
    let alive_probe = supervisor::list_active();
    assert!(alive_probe.contains_key("ckpt-close"));

    let _blob = checkpoint(sb, &KEY).await.unwrap();
    assert!(!supervisor::list_active().contains_key("ckpt-close"));
}

#[tokio::test]
async fn short_keys_are_rejected() {
    let sb = supervisor::spawn("ckpt-key", SpawnOptions::default()).await.unwrap();
    let err = checkpoint(sb, &[1u8; 16]).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::InvalidSnapshot(_))));

    let err = restore(&[0u8; 64], &[1u8; 31]).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::InvalidSnapshot(_))));
}

#[tokio::test]
async fn tampered_blobs_fail_to_open() {
    let sb = supervisor::spawn("ckpt-tamper", SpawnOptions::default()).await.unwrap();
    let mut blob = checkpoint(sb, &KEY).await.unwrap();
    let last = blob.len() - 1;
    blob[last] ^= 0x80;

    let err = restore(&blob, &KEY).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::InvalidSnapshot(_))));
}

#[tokio::test]
async fn wrong_key_fails_to_open() {
    let sb = supervisor::spawn("ckpt-wrongkey", SpawnOptions::default()).await.unwrap();
    let blob = checkpoint(sb, &KEY).await.unwrap();

    let err = restore(&blob, &[9u8; 32]).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::InvalidSnapshot(_))));
}

#[tokio::test]
async fn truncated_blobs_are_invalid() {
    let err = restore(&[0u8; 8], &KEY).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::InvalidSnapshot(_))));
}

#[tokio::test]
async fn migrate_round_trips_locally() {
    let sb = supervisor::spawn("ckpt-migrate", opts()).await.unwrap();
    let original = sb.snapshot();

    let moved = migrate(sb, "peer-host:7000", &KEY).await.unwrap();
    assert_eq!(moved.snapshot(), original);
    moved.close().await.unwrap();
}
