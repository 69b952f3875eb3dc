//! Integration tests for rusq
//! Drives the assembled server end-to-end over a file-backed SQLite
//! database: writes flow through the engine into the log, the poller
//! turns them into events, and watchers, leases and compaction interact
//! the way an etcd frontend would observe.

use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use rusq::backend::{Backend, Event};
use rusq::revlog::poll::PollConfig;
use rusq::server::{RusqServer, ServerConfig};
use rusq::watch::Watch;
use rusq::Error;

/// Spin up an in-process server over a fresh SQLite file, with a fast
/// poll loop so watch assertions do not crawl.
async fn start_test_server(tempdir: &TempDir) -> RusqServer {
    let config = ServerConfig {
        datastore_endpoint: format!("sqlite://{}/rusq.db", tempdir.path().display()),
        poll: PollConfig {
            interval: Duration::from_millis(100),
            ..PollConfig::default()
        },
        ..ServerConfig::default()
    };

    RusqServer::new(config).await.expect("failed to start server")
}

/// Receive one event or fail loudly.
async fn recv_event(watch: &mut Watch) -> Event {
    timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch stream ended unexpectedly")
}

#[tokio::test]
async fn test_create_update_delete_round_trip() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let r1 = kv.create("/a", b"1", 0).await.expect("create failed");
    let (r2, _) = kv.update("/a", b"2", r1, 0).await.expect("update failed");
    assert!(r2 > r1);

    let (_, at_r1) = kv.get("/a", r1).await.unwrap();
    assert_eq!(at_r1.unwrap().value, b"1");
    let (_, at_r2) = kv.get("/a", r2).await.unwrap();
    assert_eq!(at_r2.unwrap().value, b"2");

    let (r3, _) = kv.delete("/a", r2).await.expect("delete failed");
    assert!(r3 > r2);
    let (_, gone) = kv.get("/a", 0).await.unwrap();
    assert!(gone.is_none(), "deleted key must be absent at the head");

    server.stop().await;
}

#[tokio::test]
async fn test_cas_race_has_exactly_one_winner() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let base = kv.create("/x", b"0", 0).await.unwrap();

    let a = {
        let kv = kv.clone();
        tokio::spawn(async move { kv.update("/x", b"a", base, 0).await })
    };
    let b = {
        let kv = kv.clone();
        tokio::spawn(async move { kv.update("/x", b"b", base, 0).await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(
        [&a, &b].iter().filter(|r| r.is_ok()).count(),
        1,
        "exactly one racer may win"
    );
    let (winner_value, loser) = if a.is_ok() { (b"a", b) } else { (b"b", a) };
    assert_eq!(loser.unwrap_err(), Error::KeyExists);

    let (_, current) = kv.get("/x", 0).await.unwrap();
    let current = current.unwrap();
    assert_eq!(current.value, winner_value);
    assert_eq!(current.mod_revision, base + 1);

    server.stop().await;
}

#[tokio::test]
async fn test_watch_delivers_ordered_put_events() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let mut watch = kv.watch("/k/", 0).await.unwrap();

    let r1 = kv.create("/k/a", b"1", 0).await.unwrap();
    let r2 = kv.create("/k/b", b"2", 0).await.unwrap();

    let first = recv_event(&mut watch).await;
    assert!(first.create && !first.delete);
    assert_eq!(first.kv.key, "/k/a");
    assert_eq!(first.revision(), r1);

    let second = recv_event(&mut watch).await;
    assert_eq!(second.kv.key, "/k/b");
    assert_eq!(second.revision(), r2);
    assert!(second.revision() > first.revision());

    server.stop().await;
}

#[tokio::test]
async fn test_watch_catch_up_precedes_live_events() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let r1 = kv.create("/k/a", b"1", 0).await.unwrap();
    let r2 = kv.create("/k/b", b"2", 0).await.unwrap();
    let r3 = kv.create("/k/c", b"3", 0).await.unwrap();

    // Let the poller advance the live head past r3 before attaching.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut watch = kv.watch("/k/", r1).await.unwrap();

    // Historical tail (r1, r3], in order.
    assert_eq!(recv_event(&mut watch).await.revision(), r2);
    assert_eq!(recv_event(&mut watch).await.revision(), r3);

    // Live events continue the sequence.
    let r4 = kv.create("/k/d", b"4", 0).await.unwrap();
    assert_eq!(recv_event(&mut watch).await.revision(), r4);

    server.stop().await;
}

#[tokio::test]
async fn test_watch_sequences_are_monotone_without_gaps() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let mut watch = kv.watch("/seq/", 0).await.unwrap();

    let mut expected = Vec::new();
    for i in 0..20 {
        expected.push(
            kv.create(&format!("/seq/{i:02}"), b"v", 0).await.unwrap(),
        );
    }

    let mut seen = Vec::new();
    for _ in 0..expected.len() {
        seen.push(recv_event(&mut watch).await.revision());
    }
    assert_eq!(seen, expected, "events must arrive in id order, complete");

    server.stop().await;
}

#[tokio::test]
async fn test_compaction_boundary() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let r1 = kv.create("/c", b"v1", 0).await.unwrap();
    let (r2, _) = kv.update("/c", b"v2", r1, 0).await.unwrap();
    let (r3, _) = kv.update("/c", b"v3", r2, 0).await.unwrap();

    kv.compact(r2).await.expect("compaction failed");
    assert_eq!(kv.compact_revision().await.unwrap(), r2);

    assert_eq!(kv.get("/c", r1).await.unwrap_err(), Error::Compacted);
    let (_, v3) = kv.get("/c", r3).await.unwrap();
    assert_eq!(v3.unwrap().value, b"v3");

    server.stop().await;
}

#[tokio::test]
async fn test_lease_expiry_deletes_key_and_notifies_watchers() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let mut watch = kv.watch("/leased", 0).await.unwrap();

    let lease = server.lease_manager().grant(1);
    kv.create("/leased", b"v", lease.id).await.unwrap();

    // PUT first, then the cascade's DELETE once the lease dies.
    let put = recv_event(&mut watch).await;
    assert!(!put.delete);
    assert_eq!(put.kv.lease, lease.id);

    let deleted = recv_event(&mut watch).await;
    assert!(deleted.delete, "expected a DELETE event, got {deleted:?}");
    assert_eq!(deleted.kv.key, "/leased");

    let (_, gone) = kv.get("/leased", 0).await.unwrap();
    assert!(gone.is_none(), "leased key must be absent after expiry");
    assert_eq!(
        server.lease_manager().keep_alive(lease.id).unwrap_err(),
        Error::LeaseNotFound(lease.id)
    );

    server.stop().await;
}

#[tokio::test]
async fn test_lease_keep_alive_defers_expiry() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let lease = server.lease_manager().grant(2);
    kv.create("/kept", b"v", lease.id).await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(900)).await;
        server.lease_manager().keep_alive(lease.id).unwrap();
    }

    let (_, still_there) = kv.get("/kept", 0).await.unwrap();
    assert!(still_there.is_some(), "kept-alive lease must not expire");

    server.stop().await;
}

#[tokio::test]
async fn test_lease_revoke_cascades_deletion() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let lease = server.lease_manager().grant(300);
    kv.create("/revoked/a", b"1", lease.id).await.unwrap();
    kv.create("/revoked/b", b"2", lease.id).await.unwrap();

    // Wait for the lease index to observe both PUTs.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (_, _, keys) = server.lease_manager().time_to_live(lease.id).unwrap();
        if keys.len() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "lease index never caught up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut keys = server.lease_manager().revoke(lease.id).unwrap();
    keys.sort();
    assert_eq!(keys, vec!["/revoked/a", "/revoked/b"]);

    // The engine-side deletion is the caller's job on revoke.
    for key in keys {
        kv.delete(&key, 0).await.unwrap();
    }
    let (_, n) = kv.count("/revoked/").await.unwrap();
    assert_eq!(n, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_slow_watcher_is_cut_off_without_hurting_peers() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    // One watcher never consumes; the other drains continuously.
    let mut slow = kv.watch("/flood/", 0).await.unwrap();
    let mut healthy = kv.watch("/flood/", 0).await.unwrap();

    const FLOOD: usize = 600;
    let drained = tokio::spawn(async move {
        let mut revisions = Vec::new();
        while revisions.len() < FLOOD {
            match timeout(Duration::from_secs(10), healthy.recv()).await {
                Ok(Some(ev)) => revisions.push(ev.revision()),
                _ => break,
            }
        }
        revisions
    });

    for i in 0..FLOOD {
        kv.create(&format!("/flood/{i:04}"), b"v", 0).await.unwrap();
    }

    // The healthy watcher sees the whole flood, in order.
    let revisions = drained.await.unwrap();
    assert_eq!(revisions.len(), FLOOD);
    assert!(
        revisions.windows(2).all(|w| w[0] < w[1]),
        "healthy watcher must stay monotone"
    );

    // The paused watcher drains what its queue held, then the cut.
    let mut received = 0;
    while let Ok(Some(_)) = timeout(Duration::from_secs(5), slow.recv()).await {
        received += 1;
    }
    assert!(received < FLOOD, "slow watcher cannot have seen the flood");
    assert_eq!(slow.close_reason(), Some(Error::SlowWatcher));

    server.stop().await;
}

#[tokio::test]
async fn test_count_and_list_track_live_state() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    for i in 0..10 {
        kv.create(&format!("/items/{i:02}"), b"v", 0).await.unwrap();
    }

    let (_, n) = kv.count("/items/").await.unwrap();
    assert_eq!(n, 10);

    let (_, limited) = kv.list("/items/", 5, 0).await.unwrap();
    assert_eq!(limited.len(), 5);
    assert_eq!(limited[0].key, "/items/00");

    kv.delete("/items/00", 0).await.unwrap();
    let (_, n) = kv.count("/items/").await.unwrap();
    assert_eq!(n, 9);

    server.stop().await;
}

#[tokio::test]
async fn test_db_size_reports_bytes() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    kv.create("/size", b"some bytes", 0).await.unwrap();
    let size = kv.db_size().await.unwrap();
    assert!(size > 0, "database size must be positive, got {size}");

    server.stop().await;
}

#[tokio::test]
async fn test_revisions_survive_restart() {
    let tmp = TempDir::new().unwrap();

    let server = start_test_server(&tmp).await;
    let kv = server.backend();
    let r1 = kv.create("/persist", b"v", 0).await.unwrap();
    server.stop().await;

    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let (_, found) = kv.get("/persist", 0).await.unwrap();
    assert_eq!(found.unwrap().mod_revision, r1);

    // New writes continue the same revision sequence.
    let r2 = kv.create("/persist2", b"v", 0).await.unwrap();
    assert!(r2 > r1);

    server.stop().await;
}
