//! Watch fan-out: one ordered event stream, many subscribers.
//!
//! The broadcaster is the single fan-out point between the poller and all
//! watch streams. Subscribers attach with a start revision; history is
//! replayed from the log before any live event, and the two segments are
//! spliced so every subscriber observes a strictly increasing, gap-free,
//! duplicate-free id sequence.
//!
//! Delivery is per-subscriber bounded queues written with `try_send`; a
//! full queue cancels that subscriber with `SlowWatcher` and never blocks
//! the poller or its peers. Ownership points from broadcaster to
//! subscriber; a [`Watch`] handle holds only a weak back-reference, used
//! to cancel itself.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::Event;
use crate::errors::{Error, Result};
use crate::revlog::RevisionLog;

/// Rows fetched per catch-up page.
const CATCHUP_PAGE: i64 = 500;

/// Pause between catch-up attempts after a transient log error.
const CATCHUP_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Watch fan-out tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Events a subscriber may have queued before it is cancelled as slow.
    pub queue_length: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { queue_length: 500 }
    }
}

enum Delivery {
    /// Historical replay in progress; live events pile up here until the
    /// splice. The buffer honors the same bound as the queue.
    CatchingUp { buffer: VecDeque<Event> },
    Live,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::Sender<Event>,
    delivery: Delivery,
    /// Highest id delivered or scheduled; nothing at or below it is sent
    /// again.
    last_sent: i64,
    status: Arc<Mutex<Option<Error>>>,
}

impl Subscriber {
    fn wants(&self, event: &Event) -> bool {
        event.kv.key.starts_with(&self.prefix) && event.revision() > self.last_sent
    }
}

/// Single-producer, many-consumer fan-out of ordered log events.
pub struct Broadcaster {
    log: Arc<RevisionLog>,
    subscribers: Mutex<HashMap<i64, Subscriber>>,
    next_id: AtomicI64,
    /// Highest id handed to [`Broadcaster::publish`] so far.
    published: AtomicI64,
    queue_length: usize,
    /// Handed to watches for self-cancellation and to catch-up tasks.
    weak_self: Weak<Broadcaster>,
}

impl Broadcaster {
    pub fn new(log: Arc<RevisionLog>, config: WatchConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            log,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            published: AtomicI64::new(0),
            queue_length: config.queue_length,
            weak_self: me.clone(),
        })
    }

    /// Seeds the live-stream head; never moves it backwards.
    pub fn set_head(&self, revision: i64) {
        self.published.fetch_max(revision, Ordering::SeqCst);
    }

    /// Registers a subscriber for keys under `prefix`, delivering exactly
    /// the events with id greater than `start_revision` (0 = from now).
    pub async fn subscribe(&self, prefix: &str, start_revision: i64) -> Result<Watch> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.queue_length);
        let status = Arc::new(Mutex::new(None));

        // Snapshot the head and register in one critical section with
        // [`Broadcaster::publish`], or an event fanned out between the
        // two steps would be lost to this subscriber forever.
        let needs_catchup = {
            let mut subscribers = self.subscribers.lock();
            let published = self.published.load(Ordering::SeqCst);
            let needs_catchup = start_revision > 0 && start_revision < published;
            subscribers.insert(
                id,
                Subscriber {
                    prefix: prefix.to_string(),
                    tx,
                    delivery: if needs_catchup {
                        Delivery::CatchingUp {
                            buffer: VecDeque::new(),
                        }
                    } else {
                        Delivery::Live
                    },
                    last_sent: if start_revision > 0 {
                        start_revision
                    } else {
                        published
                    },
                    status: status.clone(),
                },
            );
            needs_catchup
        };
        debug!(watch_id = id, prefix, start_revision, "watch created");

        if needs_catchup {
            if let Some(hub) = self.weak_self.upgrade() {
                let prefix = prefix.to_string();
                tokio::spawn(async move {
                    hub.catch_up(id, prefix, start_revision).await;
                });
            }
        }

        Ok(Watch {
            id,
            rx,
            status,
            hub: self.weak_self.clone(),
        })
    }

    /// Fans a poller batch out to every subscriber. `head` is the highest
    /// id the poller has confirmed, whether or not any subscriber matched
    /// it. Never blocks: delivery is `try_send` onto bounded queues.
    pub fn publish(&self, events: &[Event], head: i64) {
        let mut dropped: Vec<i64> = Vec::new();
        let mut subscribers = self.subscribers.lock();
        // Advanced under the registry lock so registration sees either
        // the old head or this batch, never neither.
        self.published.fetch_max(head, Ordering::SeqCst);
        for (&id, sub) in subscribers.iter_mut() {
            for event in events {
                if !sub.wants(event) {
                    continue;
                }
                match &mut sub.delivery {
                    Delivery::CatchingUp { buffer } => {
                        if buffer.len() >= self.queue_length {
                            warn!(watch_id = id, "watcher fell behind during catch-up");
                            *sub.status.lock() = Some(Error::SlowWatcher);
                            dropped.push(id);
                            break;
                        }
                        buffer.push_back(event.clone());
                    }
                    Delivery::Live => match sub.tx.try_send(event.clone()) {
                        Ok(()) => sub.last_sent = event.revision(),
                        Err(TrySendError::Full(_)) => {
                            warn!(watch_id = id, "watcher queue full, cancelling");
                            *sub.status.lock() = Some(Error::SlowWatcher);
                            dropped.push(id);
                            break;
                        }
                        Err(TrySendError::Closed(_)) => {
                            dropped.push(id);
                            break;
                        }
                    },
                }
            }
        }
        for id in dropped {
            subscribers.remove(&id);
        }
    }

    /// Removes a subscriber; its queue drains as the receiver is dropped.
    pub fn cancel(&self, id: i64) {
        if self.subscribers.lock().remove(&id).is_some() {
            debug!(watch_id = id, "watch cancelled");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Replays `(start_revision, published]` from the log, then splices
    /// the subscriber into the live stream. Historical sends may wait on
    /// the subscriber's queue; the buffered live events are drained with
    /// the same monotone filter, so the concatenation has no gap and no
    /// duplicate.
    ///
    /// Replay never runs past the poller's confirmed head: rows above it
    /// are committed but not yet known gap-free, and skipping ahead of a
    /// still-in-flight id would make the live filter drop that id when
    /// the poller later emits it. Everything above the head reaches the
    /// subscriber through the buffer instead.
    async fn catch_up(self: Arc<Self>, id: i64, prefix: String, start_revision: i64) {
        let tx = match self.subscribers.lock().get(&id) {
            Some(sub) => sub.tx.clone(),
            None => return,
        };

        let mut sent = start_revision;
        loop {
            if !self.subscribers.lock().contains_key(&id) {
                return;
            }
            let head = self.published.load(Ordering::SeqCst);
            if sent >= head {
                break;
            }
            let rows = match self.log.after(&prefix, sent, CATCHUP_PAGE).await {
                Ok(rows) => rows,
                Err(Error::Compacted) => {
                    warn!(watch_id = id, start_revision, "watch start below watermark");
                    self.fail(id, Error::Compacted);
                    return;
                }
                Err(e) => {
                    // Transient errors never terminate a watch stream.
                    debug!(watch_id = id, error = %e, "catch-up read failed, retrying");
                    sleep(CATCHUP_RETRY_DELAY).await;
                    continue;
                }
            };

            let mut progressed = false;
            let mut past_head = false;
            for row in rows {
                if row.id > head {
                    past_head = true;
                    break;
                }
                sent = row.id;
                progressed = true;
                if tx.send(row.to_event()).await.is_err() {
                    self.cancel(id);
                    return;
                }
            }
            // No sendable row left at or below the head: the remaining
            // span is holes the poller skipped. Replay is complete.
            if past_head || !progressed {
                break;
            }
        }

        // Splice: everything buffered beyond the replayed head goes out in
        // order, then the subscriber rides the live stream.
        let mut subscribers = self.subscribers.lock();
        let Some(sub) = subscribers.get_mut(&id) else {
            return;
        };
        if let Delivery::CatchingUp { buffer } = std::mem::replace(&mut sub.delivery, Delivery::Live)
        {
            sub.last_sent = sent;
            for event in buffer {
                let revision = event.revision();
                if revision <= sub.last_sent {
                    continue;
                }
                match sub.tx.try_send(event) {
                    Ok(()) => sub.last_sent = revision,
                    Err(_) => {
                        *sub.status.lock() = Some(Error::SlowWatcher);
                        subscribers.remove(&id);
                        return;
                    }
                }
            }
        }
        debug!(watch_id = id, caught_up_to = sent, "watch joined live stream");
    }

    fn fail(&self, id: i64, reason: Error) {
        let mut subscribers = self.subscribers.lock();
        if let Some(sub) = subscribers.remove(&id) {
            *sub.status.lock() = Some(reason);
        }
    }
}

/// A subscriber's end of the watch pipeline.
///
/// Events arrive in strictly increasing revision order. When `recv`
/// returns `None` the stream is over; [`Watch::close_reason`] reports a
/// terminal `SlowWatcher` or `Compacted`, or `None` for a plain cancel.
pub struct Watch {
    id: i64,
    rx: mpsc::Receiver<Event>,
    status: Arc<Mutex<Option<Error>>>,
    hub: Weak<Broadcaster>,
}

impl Watch {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Why the stream ended, once it has.
    pub fn close_reason(&self) -> Option<Error> {
        self.status.lock().clone()
    }

    /// Detaches from the broadcaster and drains the queue.
    pub fn cancel(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.cancel(self.id);
        }
    }

    /// Adapts the watch into a `Stream` of events.
    pub fn into_stream(self) -> WatchStream {
        WatchStream { watch: self }
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// `tokio_stream`-compatible view of a [`Watch`].
pub struct WatchStream {
    watch: Watch,
}

impl tokio_stream::Stream for WatchStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().watch.rx.poll_recv(cx)
    }
}
