//! Lease management with TTL tracking and cascading deletion.
//!
//! Leases live in memory only. A min-heap orders upcoming deadlines and a
//! single loop wakes at the next one; expired leases are pushed onto a
//! channel for the owner to cascade-delete their keys through the engine,
//! which makes the deletions visible to watchers through the normal log
//! path.
//!
//! The reverse index (lease id -> key set) is fed from a full-keyspace
//! watch subscription rather than a SQL index: a PUT carrying a lease
//! attaches its key, a PUT without one or a DELETE detaches it. On
//! startup the index is rebuilt from the live rows with `lease != 0`;
//! their original TTLs are not recoverable from the rows, so rehydrated
//! leases restart with a configured TTL.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backend::Event;
use crate::errors::{Error, Result};
use crate::watch::Watch;

/// Lease tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// TTL assigned to leases observed on startup, whose declared TTL
    /// died with the previous process.
    pub recovered_ttl: i64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { recovered_ttl: 60 }
    }
}

/// A granted lease.
#[derive(Clone, Debug)]
pub struct Lease {
    pub id: i64,
    /// Granted TTL in seconds.
    pub ttl: i64,
    pub granted_at: Instant,
}

impl Lease {
    /// Remaining TTL in seconds.
    pub fn remaining_ttl(&self) -> i64 {
        let elapsed = self.granted_at.elapsed().as_secs() as i64;
        (self.ttl - elapsed).max(0)
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_ttl() <= 0
    }

    fn deadline(&self) -> Instant {
        self.granted_at + Duration::from_secs(self.ttl as u64)
    }
}

/// Heap entry ordering upcoming expirations.
#[derive(Debug, Clone, Eq, PartialEq)]
struct LeaseExpiry {
    lease_id: i64,
    expires_at: Instant,
}

impl Ord for LeaseExpiry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.expires_at
            .cmp(&other.expires_at)
            .then(self.lease_id.cmp(&other.lease_id))
    }
}

impl PartialOrd for LeaseExpiry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Sent when a lease dies and its keys must be deleted.
#[derive(Debug, Clone)]
pub struct LeaseExpireEvent {
    pub lease_id: i64,
    pub keys: Vec<String>,
}

/// Manages lease lifecycle and TTL tracking.
pub struct LeaseManager {
    /// All active leases: id -> lease.
    leases: RwLock<HashMap<i64, Lease>>,

    /// Reverse index: lease id -> attached keys.
    lease_keys: RwLock<HashMap<i64, HashSet<String>>>,

    /// Which lease currently holds each key.
    key_lease: RwLock<HashMap<String, i64>>,

    /// Min-heap of upcoming expirations. Entries go stale on keep-alive;
    /// the expiry loop re-checks the lease before acting.
    expiry_queue: RwLock<BinaryHeap<Reverse<LeaseExpiry>>>,

    /// Nudges the expiry loop when a nearer deadline appears.
    wakeup: Notify,

    expire_tx: mpsc::Sender<LeaseExpireEvent>,
}

impl LeaseManager {
    pub fn new(expire_tx: mpsc::Sender<LeaseExpireEvent>) -> Arc<Self> {
        Arc::new(Self {
            leases: RwLock::new(HashMap::new()),
            lease_keys: RwLock::new(HashMap::new()),
            key_lease: RwLock::new(HashMap::new()),
            expiry_queue: RwLock::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            expire_tx,
        })
    }

    /// Grants a lease with a random non-zero id. A non-positive TTL is
    /// clamped to one second.
    pub fn grant(&self, ttl: i64) -> Lease {
        let id = loop {
            let bits = uuid::Uuid::new_v4().as_u64_pair().0;
            let candidate = (bits & i64::MAX as u64) as i64;
            if candidate != 0 && !self.leases.read().contains_key(&candidate) {
                break candidate;
            }
        };
        self.grant_with_id(id, ttl)
    }

    fn grant_with_id(&self, id: i64, ttl: i64) -> Lease {
        let lease = Lease {
            id,
            ttl: ttl.max(1),
            granted_at: Instant::now(),
        };

        self.leases.write().insert(id, lease.clone());
        self.lease_keys.write().entry(id).or_default();
        self.expiry_queue.write().push(Reverse(LeaseExpiry {
            lease_id: id,
            expires_at: lease.deadline(),
        }));
        self.wakeup.notify_one();

        debug!(lease_id = id, ttl = lease.ttl, "lease granted");
        lease
    }

    /// Pushes the deadline to now + granted TTL. Returns the TTL.
    pub fn keep_alive(&self, id: i64) -> Result<i64> {
        let mut leases = self.leases.write();
        let Some(lease) = leases.get_mut(&id) else {
            return Err(Error::LeaseNotFound(id));
        };
        lease.granted_at = Instant::now();
        let ttl = lease.ttl;
        let expires_at = lease.deadline();
        drop(leases);

        self.expiry_queue.write().push(Reverse(LeaseExpiry {
            lease_id: id,
            expires_at,
        }));
        self.wakeup.notify_one();

        debug!(lease_id = id, ttl, "lease renewed");
        Ok(ttl)
    }

    /// Destroys the lease, returning the keys that were attached.
    pub fn revoke(&self, id: i64) -> Result<Vec<String>> {
        if self.leases.write().remove(&id).is_none() {
            return Err(Error::LeaseNotFound(id));
        }
        let keys: Vec<String> = self
            .lease_keys
            .write()
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        let mut key_lease = self.key_lease.write();
        for key in &keys {
            key_lease.remove(key);
        }

        debug!(lease_id = id, key_count = keys.len(), "lease revoked");
        Ok(keys)
    }

    pub fn get(&self, id: i64) -> Option<Lease> {
        self.leases.read().get(&id).cloned()
    }

    /// Remaining TTL, granted TTL and attached keys.
    pub fn time_to_live(&self, id: i64) -> Result<(i64, i64, Vec<String>)> {
        let leases = self.leases.read();
        let Some(lease) = leases.get(&id) else {
            return Err(Error::LeaseNotFound(id));
        };
        let remaining = lease.remaining_ttl();
        let granted = lease.ttl;
        drop(leases);

        let keys = self
            .lease_keys
            .read()
            .get(&id)
            .map(|set| {
                let mut keys: Vec<String> = set.iter().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default();
        Ok((remaining, granted, keys))
    }

    pub fn count(&self) -> usize {
        self.leases.read().len()
    }

    /// Rebuilds lease state from the live key set observed at startup.
    /// Unknown lease ids come back to life with `recovered_ttl`.
    pub fn hydrate(&self, pairs: &[(String, i64)], recovered_ttl: i64) {
        for (key, lease_id) in pairs {
            if *lease_id == 0 {
                continue;
            }
            if !self.leases.read().contains_key(lease_id) {
                self.grant_with_id(*lease_id, recovered_ttl);
            }
            self.attach(*lease_id, key.clone());
        }
        if !pairs.is_empty() {
            info!(keys = pairs.len(), leases = self.count(), "lease state rebuilt");
        }
    }

    fn attach(&self, lease_id: i64, key: String) {
        let mut key_lease = self.key_lease.write();
        let mut lease_keys = self.lease_keys.write();
        if let Some(old) = key_lease.insert(key.clone(), lease_id) {
            if old != lease_id {
                if let Some(set) = lease_keys.get_mut(&old) {
                    set.remove(&key);
                }
            }
        }
        lease_keys.entry(lease_id).or_default().insert(key);
    }

    fn detach(&self, key: &str) {
        let mut key_lease = self.key_lease.write();
        if let Some(old) = key_lease.remove(key) {
            if let Some(set) = self.lease_keys.write().get_mut(&old) {
                set.remove(key);
            }
        }
    }

    /// Maintains the reverse index from the event stream. Runs until the
    /// watch closes or shutdown.
    pub async fn run_index(
        self: Arc<Self>,
        mut events: Watch,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                ev = events.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };
            self.observe(&event);
        }
        debug!("lease index task stopped");
    }

    fn observe(&self, event: &Event) {
        if event.delete {
            self.detach(&event.kv.key);
        } else if event.kv.lease != 0 {
            self.attach(event.kv.lease, event.kv.key.clone());
        } else {
            self.detach(&event.kv.key);
        }
    }

    /// Wakes at the next deadline and emits expiry events. Heap entries
    /// made stale by keep-alives are discarded on inspection.
    pub async fn run_expiry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let sleep_for = {
                let queue = self.expiry_queue.read();
                match queue.peek() {
                    Some(Reverse(next)) => {
                        next.expires_at.saturating_duration_since(Instant::now())
                    }
                    None => Duration::from_secs(1),
                }
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(sleep_for) => {}
                _ = self.wakeup.notified() => continue,
            }

            while let Some(event) = self.pop_expired() {
                if let Err(e) = self.expire_tx.send(event).await {
                    warn!(error = %e, "lease expiry channel closed");
                    return;
                }
            }
        }
        debug!("lease expiry loop stopped");
    }

    /// Pops the next genuinely expired lease, skipping stale heap entries.
    fn pop_expired(&self) -> Option<LeaseExpireEvent> {
        loop {
            let lease_id = {
                let mut queue = self.expiry_queue.write();
                let Reverse(next) = queue.peek()?;
                if next.expires_at > Instant::now() {
                    return None;
                }
                let lease_id = next.lease_id;
                queue.pop();
                lease_id
            };

            let expired = {
                let leases = self.leases.read();
                matches!(leases.get(&lease_id), Some(lease) if lease.is_expired())
            };
            if !expired {
                continue;
            }

            match self.revoke(lease_id) {
                Ok(keys) => {
                    info!(lease_id, key_count = keys.len(), "lease expired");
                    return Some(LeaseExpireEvent { lease_id, keys });
                }
                Err(_) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyValue;

    fn manager() -> (Arc<LeaseManager>, mpsc::Receiver<LeaseExpireEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (LeaseManager::new(tx), rx)
    }

    fn put_event(key: &str, lease: i64) -> Event {
        Event {
            create: true,
            delete: false,
            kv: KeyValue {
                key: key.to_string(),
                create_revision: 1,
                mod_revision: 1,
                lease,
                value: b"v".to_vec(),
            },
            prev_kv: None,
        }
    }

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let (mgr, _rx) = manager();

        let lease = mgr.grant(30);
        assert!(lease.id != 0);
        assert_eq!(lease.ttl, 30);
        assert_eq!(mgr.count(), 1);

        let keys = mgr.revoke(lease.id).unwrap();
        assert!(keys.is_empty());
        assert_eq!(mgr.count(), 0);
        assert_eq!(mgr.revoke(lease.id).unwrap_err(), Error::LeaseNotFound(lease.id));
    }

    #[tokio::test]
    async fn test_grant_ids_are_random_and_distinct() {
        let (mgr, _rx) = manager();
        let a = mgr.grant(10).id;
        let b = mgr.grant(10).id;
        assert_ne!(a, b);
        assert!(a > 0 && b > 0);
    }

    #[tokio::test]
    async fn test_keep_alive_extends_deadline() {
        let (mgr, _rx) = manager();

        let lease = mgr.grant(10);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let before = mgr.get(lease.id).unwrap().remaining_ttl();
        let ttl = mgr.keep_alive(lease.id).unwrap();
        assert_eq!(ttl, 10);
        assert!(mgr.get(lease.id).unwrap().remaining_ttl() >= before);
    }

    #[tokio::test]
    async fn test_keep_alive_unknown_lease() {
        let (mgr, _rx) = manager();
        assert_eq!(mgr.keep_alive(42).unwrap_err(), Error::LeaseNotFound(42));
    }

    #[tokio::test]
    async fn test_index_attach_and_detach() {
        let (mgr, _rx) = manager();
        let lease = mgr.grant(30);

        mgr.observe(&put_event("/leased/a", lease.id));
        mgr.observe(&put_event("/leased/b", lease.id));
        let (_, _, keys) = mgr.time_to_live(lease.id).unwrap();
        assert_eq!(keys, vec!["/leased/a", "/leased/b"]);

        // Re-put without a lease releases the key.
        mgr.observe(&put_event("/leased/a", 0));
        let (_, _, keys) = mgr.time_to_live(lease.id).unwrap();
        assert_eq!(keys, vec!["/leased/b"]);

        // Deletion releases too.
        let mut ev = put_event("/leased/b", 0);
        ev.delete = true;
        mgr.observe(&ev);
        let (_, _, keys) = mgr.time_to_live(lease.id).unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_emits_attached_keys() {
        let (mgr, mut rx) = manager();
        let (_tx, shutdown) = watch::channel(false);

        let lease = mgr.grant(1);
        mgr.observe(&put_event("/leased/x", lease.id));

        tokio::spawn(mgr.clone().run_expiry_loop(shutdown));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("expiry never fired")
            .unwrap();
        assert_eq!(event.lease_id, lease.id);
        assert_eq!(event.keys, vec!["/leased/x"]);
        assert_eq!(mgr.count(), 0);
    }

    #[tokio::test]
    async fn test_hydrate_restores_unknown_leases() {
        let (mgr, _rx) = manager();

        mgr.hydrate(
            &[
                ("/a".to_string(), 7),
                ("/b".to_string(), 7),
                ("/c".to_string(), 0),
            ],
            60,
        );

        assert_eq!(mgr.count(), 1);
        let (remaining, granted, keys) = mgr.time_to_live(7).unwrap();
        assert_eq!(granted, 60);
        assert!(remaining > 0);
        assert_eq!(keys, vec!["/a", "/b"]);
    }
}
