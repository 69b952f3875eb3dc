//! Invariant tests for the revision protocol.
//!
//! These drive many concurrent writers against the assembled server and
//! assert the ordering, exclusivity and compaction guarantees the engine
//! promises, rather than single happy paths.

use std::collections::HashMap;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use rusq::backend::Backend;
use rusq::revlog::poll::PollConfig;
use rusq::server::{RusqServer, ServerConfig};
use rusq::Error;

async fn start_test_server(tempdir: &TempDir) -> RusqServer {
    let config = ServerConfig {
        datastore_endpoint: format!("sqlite://{}/props.db", tempdir.path().display()),
        poll: PollConfig {
            interval: Duration::from_millis(100),
            ..PollConfig::default()
        },
        ..ServerConfig::default()
    };
    RusqServer::new(config).await.expect("failed to start server")
}

#[tokio::test]
async fn test_interleaved_writers_get_strictly_increasing_revisions() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    const WRITERS: usize = 8;
    const WRITES: usize = 10;

    let mut tasks = Vec::new();
    for w in 0..WRITERS {
        let kv = kv.clone();
        tasks.push(tokio::spawn(async move {
            let mut revisions = Vec::new();
            for i in 0..WRITES {
                let rev = kv
                    .create(&format!("/mono/{w}/{i}"), b"v", 0)
                    .await
                    .unwrap();
                revisions.push(rev);
            }
            revisions
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        let revisions = task.await.unwrap();
        // Each writer observes its own assignments in increasing order.
        assert!(revisions.windows(2).all(|w| w[0] < w[1]));
        all.extend(revisions);
    }

    // Globally, every assignment is unique.
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), WRITERS * WRITES);

    server.stop().await;
}

#[tokio::test]
async fn test_cas_exclusivity_among_many_racers() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    const RACERS: usize = 8;
    let base = kv.create("/contested", b"base", 0).await.unwrap();

    let mut tasks = Vec::new();
    for r in 0..RACERS {
        let kv = kv.clone();
        tasks.push(tokio::spawn(async move {
            kv.update("/contested", format!("racer-{r}").as_bytes(), base, 0)
                .await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(e) => assert_eq!(e, Error::KeyExists),
        }
    }
    assert_eq!(winners, 1, "exactly one of {RACERS} racers may win");

    let (_, current) = kv.get("/contested", 0).await.unwrap();
    assert_eq!(current.unwrap().mod_revision, base + 1);

    server.stop().await;
}

#[tokio::test]
async fn test_compaction_preserves_the_present() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    // A spread of keys with different histories: fresh, rewritten,
    // deleted, recreated.
    let mut expected: HashMap<String, Vec<u8>> = HashMap::new();
    for i in 0..10 {
        let key = format!("/mix/{i:02}");
        let r = kv.create(&key, b"first", 0).await.unwrap();
        match i % 3 {
            0 => {
                expected.insert(key, b"first".to_vec());
            }
            1 => {
                kv.update(&key, b"second", r, 0).await.unwrap();
                expected.insert(key, b"second".to_vec());
            }
            _ => {
                kv.delete(&key, r).await.unwrap();
                if i % 2 == 0 {
                    kv.create(&key, b"reborn", 0).await.unwrap();
                    expected.insert(key, b"reborn".to_vec());
                }
            }
        }
    }

    let head = kv.current_revision().await.unwrap();
    kv.compact(head).await.unwrap();

    // The live state is byte-identical after compaction.
    let (_, live) = kv.list("/mix/", 0, 0).await.unwrap();
    let live: HashMap<String, Vec<u8>> =
        live.into_iter().map(|kv| (kv.key, kv.value)).collect();
    assert_eq!(live, expected);

    // And history below the watermark is gone.
    assert_eq!(kv.get("/mix/00", 1).await.unwrap_err(), Error::Compacted);

    server.stop().await;
}

#[tokio::test]
async fn test_watcher_sees_exactly_the_writes_after_its_revision() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    // History before the watcher attaches.
    let mut revisions = Vec::new();
    for i in 0..5 {
        revisions.push(kv.create(&format!("/tail/{i}"), b"v", 0).await.unwrap());
    }
    let attach_at = revisions[1];

    // Let the poller move the live head past the history.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut watch = kv.watch("/tail/", attach_at).await.unwrap();

    // More writes while the watcher catches up.
    for i in 5..8 {
        revisions.push(kv.create(&format!("/tail/{i}"), b"v", 0).await.unwrap());
    }

    let expected: Vec<i64> = revisions
        .iter()
        .copied()
        .filter(|r| *r > attach_at)
        .collect();

    let mut seen = Vec::new();
    for _ in 0..expected.len() {
        let ev = timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("timed out")
            .expect("stream ended");
        seen.push(ev.revision());
    }
    assert_eq!(seen, expected, "exactly the writes after r, in id order");

    server.stop().await;
}

#[tokio::test]
async fn test_lease_cascade_is_complete() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let mut watch = kv.watch("/fleet/", 0).await.unwrap();

    let lease = server.lease_manager().grant(1);
    let keys: Vec<String> = (0..5).map(|i| format!("/fleet/{i}")).collect();
    for key in &keys {
        kv.create(key, b"v", lease.id).await.unwrap();
    }

    // Every key produces a PUT, then a DELETE when the lease dies.
    let mut puts = 0;
    let mut deletes = Vec::new();
    while deletes.len() < keys.len() {
        let ev = timeout(Duration::from_secs(10), watch.recv())
            .await
            .expect("cascade never completed")
            .expect("stream ended");
        if ev.delete {
            deletes.push(ev.kv.key);
        } else {
            puts += 1;
        }
    }
    assert_eq!(puts, keys.len());
    deletes.sort();
    assert_eq!(deletes, keys);

    // Afterwards nothing under the prefix survives.
    let (_, n) = kv.count("/fleet/").await.unwrap();
    assert_eq!(n, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_reads_at_explicit_revisions_are_stable_snapshots() {
    let tmp = TempDir::new().unwrap();
    let server = start_test_server(&tmp).await;
    let kv = server.backend();

    let r1 = kv.create("/snap", b"one", 0).await.unwrap();
    let (r2, _) = kv.update("/snap", b"two", r1, 0).await.unwrap();

    // The snapshot answer never changes, no matter how much is written
    // afterwards.
    for i in 0..5 {
        kv.create(&format!("/noise/{i}"), b"n", 0).await.unwrap();
        let (_, at_r1) = kv.get("/snap", r1).await.unwrap();
        assert_eq!(at_r1.unwrap().value, b"one");
        let (_, at_r2) = kv.get("/snap", r2).await.unwrap();
        assert_eq!(at_r2.unwrap().value, b"two");
    }

    server.stop().await;
}
