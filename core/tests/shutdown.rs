#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use serde_json::json;
use warden_core::SpawnOptions;
use warden_core::Supervisor;
use warden_core::capability::Capability;
use warden_core::supervisor;
use warden_protocol::protocol::Instr;

const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(2));

#[tokio::test]
async fn shutdown_requires_the_canonical_capability() {
    let sup = Supervisor::new();
    let sb = sup.spawn("authz", SpawnOptions::default()).await.unwrap();

    // A name-identical but non-canonical token must be rejected.
    let forged = Capability::new("root");
    let err = sup.shutdown(&forged).await.unwrap_err();
    assert!(err.is_policy_auth());

    // The supervisor stays usable after the rejection.
    sb.exec_one(Instr::post(json!("still here"))).await.unwrap();
    assert_eq!(sb.recv(RECV_TIMEOUT).await.unwrap(), json!("still here"));

    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_workers_and_is_idempotent() {
    let sup = Supervisor::with_warm_pool(2);
    let sb = sup.spawn("drain", SpawnOptions::default()).await.unwrap();
    let root = sup.root_capability();

    sup.shutdown(&root).await.unwrap();
    assert!(!sb.is_alive());
    assert!(sup.list_active().is_empty());

    // Double-shutdown is a no-op.
    sup.shutdown(&root).await.unwrap();

    // New spawns are refused on a drained instance.
    assert!(sup.spawn("late", SpawnOptions::default()).await.is_err());
    let _ = sb.close().await;
}

#[tokio::test]
async fn global_shutdown_rebinds_the_public_alias() {
    let before = supervisor::current();
    let root = supervisor::root_capability();
    supervisor::shutdown(&root).await.unwrap();

    let after = supervisor::current();
    assert!(!std::ptr::eq(before.as_ref(), after.as_ref()));

    // The fresh instance mints a fresh canonical capability; the old one no
    // longer authorizes privileged operations.
    let err = supervisor::shutdown(&root).await.unwrap_err();
    assert!(err.is_policy_auth());

    // The rebound alias spawns normally.
    let sb = supervisor::spawn("reborn", SpawnOptions::default()).await.unwrap();
    sb.exec_one(Instr::post(json!(1))).await.unwrap();
    assert_eq!(sb.recv(RECV_TIMEOUT).await.unwrap(), json!(1));
    sb.close().await.unwrap();
}
