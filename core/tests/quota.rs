#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;
use std::time::Instant;

use warden_core::SpawnOptions;
use warden_core::Supervisor;
use warden_protocol::error::SandboxErr;
use warden_protocol::protocol::Instr;
use warden_protocol::protocol::QuotaEvent;

const RECV_TIMEOUT: Option<Duration> = Some(Duration::from_secs(1));

#[tokio::test]
async fn busy_loop_trips_the_cpu_quota_within_a_second() {
    let sup = Supervisor::new();
    let sb = sup
        .spawn(
            "cpu",
            SpawnOptions {
                cpu_ms: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let started = Instant::now();
    sb.exec_one(Instr::Spin { iters: None }).await.unwrap();
    let err = sb.recv(RECV_TIMEOUT).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::CpuExceeded)));
    assert!(started.elapsed() < Duration::from_secs(1));

    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}

#[tokio::test]
async fn oversized_allocation_trips_the_memory_quota() {
    let sup = Supervisor::new();
    let sb = sup
        .spawn(
            "mem",
            SpawnOptions {
                mem_bytes: Some(1_048_576),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    sb.exec_one(Instr::Alloc {
        bytes: 2 * 1_048_576,
    })
    .await
    .unwrap();
    let err = sb.recv(RECV_TIMEOUT).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::MemoryExceeded)));

    let stats = sb.stats();
    assert!(stats.peak_mem_bytes >= 2 * 1_048_576);
    assert_eq!(stats.errors, 1);

    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}

#[tokio::test]
async fn allocations_under_quota_accumulate() {
    let sup = Supervisor::new();
    let sb = sup
        .spawn(
            "mem-ok",
            SpawnOptions {
                mem_bytes: Some(1_048_576),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    sb.exec_one(Instr::Alloc { bytes: 1024 }).await.unwrap();
    sb.recv(RECV_TIMEOUT).await.unwrap();
    let stats = sb.stats();
    assert!(stats.peak_mem_bytes >= 1024);
    assert_eq!(stats.errors, 0);

    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}

#[tokio::test]
async fn watchdog_terminates_cpu_offenders() {
    let sup = Supervisor::new();
    let sb = sup
        .spawn(
            "wdcpu",
            SpawnOptions {
                cpu_ms: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    sup.quota_events()
        .send(QuotaEvent {
            name: "wdcpu".to_string(),
            cpu_ms: 20,
            rss_bytes: 0,
        })
        .await
        .unwrap();

    let err = sb.recv(RECV_TIMEOUT).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::CpuExceeded)));

    // The watchdog also stops the worker.
    for _ in 0..100 {
        if !sb.is_alive() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!sb.is_alive());

    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}

#[tokio::test]
async fn watchdog_terminates_memory_offenders() {
    let sup = Supervisor::new();
    let sb = sup
        .spawn(
            "wdmem",
            SpawnOptions {
                mem_bytes: Some(1_048_576),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    sup.quota_events()
        .send(QuotaEvent {
            name: "wdmem".to_string(),
            cpu_ms: 0,
            rss_bytes: 2 * 1_048_576,
        })
        .await
        .unwrap();

    let err = sb.recv(RECV_TIMEOUT).await.unwrap_err();
    assert!(matches!(err.violation(), Some(SandboxErr::MemoryExceeded)));

    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}

#[tokio::test]
async fn watchdog_ignores_events_below_quota_and_unknown_names() {
    let sup = Supervisor::new();
    let sb = sup
        .spawn(
            "wdquiet",
            SpawnOptions {
                cpu_ms: Some(100),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    sup.quota_events()
        .send(QuotaEvent {
            name: "wdquiet".to_string(),
            cpu_ms: 10,
            rss_bytes: 0,
        })
        .await
        .unwrap();
    sup.quota_events()
        .send(QuotaEvent {
            name: "no-such-sandbox".to_string(),
            cpu_ms: 10_000,
            rss_bytes: 0,
        })
        .await
        .unwrap();

    let err = sb.recv(Some(Duration::from_millis(100))).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(sb.is_alive());

    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}

#[tokio::test]
async fn mid_op_stats_include_in_flight_wall_time() {
    let sup = Supervisor::new();
    let sb = sup.spawn("midop", SpawnOptions::default()).await.unwrap();

    sb.exec_one(Instr::Sleep { ms: 200 }).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = sb.stats();
    assert!(stats.cpu_ms >= 50.0, "expected in-flight charge, got {}", stats.cpu_ms);

    sb.recv(RECV_TIMEOUT).await.unwrap();
    sb.close().await.unwrap();
    sup.shutdown(&sup.root_capability()).await.unwrap();
}
