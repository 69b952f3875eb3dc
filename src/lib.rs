//! # rusq: an etcd-shaped key/value engine over a relational database
//!
//! rusq lets a Kubernetes-style control plane keep its cluster state in
//! SQLite, PostgreSQL or MySQL by emulating etcd's storage model on an
//! append-only revision-log table:
//!
//! - **MVCC revisions**: every mutation is one row; the database-assigned
//!   id is the cluster revision and supports point-in-time reads
//! - **Lock-free compare-and-swap**: a unique index on
//!   `(name, prev_revision)` makes the backend the serializer
//! - **Ordered watches**: a poll loop reconstructs a gap-free event
//!   stream and fans it out with per-watcher backpressure
//! - **Leases**: TTL-tracked keys with cascading deletion
//! - **Compaction**: bounded history with a persisted watermark
//!
//! The gRPC transport is not part of this crate; an adapter embeds
//! [`RusqServer`] and drives it through the [`Backend`] trait.

// Layered bottom-up: dialect -> store -> revlog -> kv; watch and lease
// ride on revlog; server wires everything.
pub mod backend;
pub mod dialect;
pub mod errors;
pub mod kv;
pub mod lease;
pub mod revlog;
pub mod server;
pub mod store;
pub mod watch;

// Re-export main types at crate root for convenience
pub use backend::{Backend, Event, KeyValue};
pub use errors::{Error, Result};
pub use kv::KvEngine;
pub use lease::{Lease, LeaseManager};
pub use revlog::RevisionLog;
pub use server::{RusqServer, ServerConfig};
pub use watch::{Broadcaster, Watch};
