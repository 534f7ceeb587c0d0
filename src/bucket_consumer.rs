//! The bucket consumer: a per-peer state machine tracking broker deliveries
//! as they move through `incoming -> active -> released`, and brokering
//! graceful, drain-before-stop shutdown.
//!
//! The state lives behind a single `Mutex`; every mutation is expressed as
//! a pure `old -> new` step taken while the lock is held. Side effects that
//! require `.await` on the broker (cancel, recover, close) never happen
//! while the lock is held: the transition that needs them hands the dead
//! channel off to a detached task instead, per the "watchers schedule work,
//! they don't recurse into the cell" rule in the design notes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::broker::{best_effort, BrokerChannel, BrokerConnection, Delivery, DeliveryHandler};
use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
struct Tracked {
    name: String,
    tag: u64,
}

struct Inner {
    channel: Option<Arc<dyn BrokerChannel>>,
    consumer_tag: Option<String>,
    incoming: Vec<Tracked>,
    active: Vec<Tracked>,
    released: Vec<Tracked>,
    status: ConsumerStatus,
}

impl Inner {
    fn stopped_empty() -> Self {
        Inner {
            channel: None,
            consumer_tag: None,
            incoming: Vec::new(),
            active: Vec::new(),
            released: Vec::new(),
            status: ConsumerStatus::Stopped,
        }
    }
}

/// The handle external callers (and the distributor) hold. Its `Arc`
/// identity is stable across restarts: `start` on an existing handle
/// replaces everything inside it but never hands out a new `Arc`.
pub struct BucketConsumerHandle {
    instance_id: PeerId,
    inner: Mutex<Inner>,
    drain_signal: Notify,
}

impl BucketConsumerHandle {
    fn new_stopped(instance_id: PeerId) -> Self {
        BucketConsumerHandle {
            instance_id,
            inner: Mutex::new(Inner::stopped_empty()),
            drain_signal: Notify::new(),
        }
    }

    pub async fn is_stopped(&self) -> bool {
        self.inner.lock().await.status == ConsumerStatus::Stopped
    }

    async fn on_delivery(&self, delivery: Delivery) {
        let name = match String::from_utf8(delivery.payload.clone()) {
            Ok(name) => name,
            Err(_) => {
                log::warn!("discarding non-UTF-8 bucket delivery (tag {})", delivery.delivery_tag);
                let channel = { self.inner.lock().await.channel.clone() };
                if let Some(channel) = channel {
                    best_effort("reject_discard", channel.reject_discard(delivery.delivery_tag)).await;
                }
                return;
            }
        };
        let mut inner = self.inner.lock().await;
        if inner.status == ConsumerStatus::Stopped {
            return;
        }
        inner.incoming.push(Tracked {
            name,
            tag: delivery.delivery_tag,
        });
    }

    /// Moves `incoming` into `active` (if running) and returns the current
    /// active set. Never mutates when not running.
    pub async fn buckets(&self) -> BTreeSet<String> {
        let mut inner = self.inner.lock().await;
        if inner.status == ConsumerStatus::Running {
            let mut incoming = std::mem::take(&mut inner.incoming);
            inner.active.append(&mut incoming);
        }
        inner.active.iter().map(|t| t.name.clone()).collect()
    }

    /// Releases the named buckets back to the broker. Buckets not currently
    /// active are ignored.
    pub async fn release(&self, names: &BTreeSet<String>) {
        let to_reject: Vec<Tracked> = {
            let mut inner = self.inner.lock().await;
            let (released, kept): (Vec<Tracked>, Vec<Tracked>) =
                inner.active.drain(..).partition(|t| names.contains(&t.name));
            inner.active = kept;
            inner.released.extend(released.iter().cloned());
            let channel_empty_after = inner.active.is_empty();
            if inner.status == ConsumerStatus::Stopping && channel_empty_after {
                // `notify_one` stores a permit when nobody is waiting yet, so
                // a release that empties `active` before `stop` re-registers
                // its `notified()` future still wakes it rather than being
                // lost (tokio's `notify_waiters` stores no permit at all).
                self.drain_signal.notify_one();
            }
            released
        };

        let channel = { self.inner.lock().await.channel.clone() };
        if let Some(channel) = channel {
            for tracked in &to_reject {
                best_effort("reject_requeue", channel.reject_requeue(tracked.tag)).await;
            }
        }
        let mut inner = self.inner.lock().await;
        inner.released.retain(|t| !to_reject.iter().any(|r| r.tag == t.tag));
    }

    /// Stops the consumer. Non-forced stops wait for `active` to drain
    /// before tearing down the channel; forced stops abandon whatever is
    /// active immediately and let the broker requeue it on close.
    pub async fn stop(&self, force: bool) {
        loop {
            let (became_stopped, teardown) = {
                let mut inner = self.inner.lock().await;
                if inner.status == ConsumerStatus::Stopped {
                    return;
                }
                if inner.active.is_empty() || force {
                    let abandoned = inner.active.len();
                    if force && abandoned > 0 {
                        log::warn!(
                            "forced stop on {} abandoning {abandoned} in-flight bucket(s)",
                            self.instance_id
                        );
                    }
                    inner.status = ConsumerStatus::Stopped;
                    inner.incoming.clear();
                    inner.released.clear();
                    inner.active.clear();
                    let channel = inner.channel.take();
                    let consumer_tag = inner.consumer_tag.take();
                    (true, channel.map(|c| (c, consumer_tag)))
                } else {
                    inner.status = ConsumerStatus::Stopping;
                    (false, None)
                }
            };

            if became_stopped {
                if let Some((channel, consumer_tag)) = teardown {
                    teardown_channel(channel, consumer_tag).await;
                }
                return;
            }

            self.drain_signal.notified().await;
        }
    }

    /// Replaces this handle's internals with a freshly opened channel and
    /// subscription, transitioning it to `running`. Called only by
    /// [`start`].
    async fn replace_with(&self, channel: Arc<dyn BrokerChannel>, consumer_tag: String) {
        let mut inner = self.inner.lock().await;
        inner.channel = Some(channel);
        inner.consumer_tag = Some(consumer_tag);
        inner.incoming = Vec::new();
        inner.active = Vec::new();
        inner.released = Vec::new();
        inner.status = ConsumerStatus::Running;
    }

    async fn mark_start_failed(&self) {
        let mut inner = self.inner.lock().await;
        inner.channel = None;
        inner.consumer_tag = None;
        inner.status = ConsumerStatus::Stopped;
    }
}

async fn teardown_channel(channel: Arc<dyn BrokerChannel>, consumer_tag: Option<String>) {
    if let Some(tag) = consumer_tag {
        best_effort("cancel", channel.cancel(&tag)).await;
    }
    best_effort("recover", channel.recover(true)).await;
    channel.close().await;
}

/// Starts (or restarts, on `existing`) a bucket consumer subscribed to
/// `queue_name` with the given prefetch. Always returns a handle, even on
/// failure: a failed start leaves the handle `Stopped` so the caller (the
/// distributor's partition-size listener) can retry on the next state
/// change, per the design's "leave it stopped, retry later" rule.
pub async fn start(
    connection: &Arc<dyn BrokerConnection>,
    queue_name: &str,
    prefetch: u16,
    instance_id: PeerId,
    existing: Option<Arc<BucketConsumerHandle>>,
) -> Arc<BucketConsumerHandle> {
    let handle = existing.unwrap_or_else(|| Arc::new(BucketConsumerHandle::new_stopped(instance_id.clone())));

    let channel = match connection.open_channel().await {
        Ok(channel) => channel,
        Err(err) => {
            log::warn!("bucket consumer for {instance_id} failed to open a channel: {err}");
            handle.mark_start_failed().await;
            return handle;
        }
    };

    if let Err(err) = channel.set_prefetch(prefetch).await {
        log::warn!("bucket consumer for {instance_id} failed to set prefetch {prefetch}: {err}");
        channel.close().await;
        handle.mark_start_failed().await;
        return handle;
    }

    let handler_target = handle.clone();
    let handler: DeliveryHandler = Arc::new(move |delivery| {
        let target = handler_target.clone();
        Box::pin(async move { target.on_delivery(delivery).await })
    });

    let consumer_tag = match channel.subscribe(queue_name, handler).await {
        Ok(tag) => tag,
        Err(err) => {
            log::warn!("bucket consumer for {instance_id} failed to subscribe to {queue_name}: {err}");
            channel.close().await;
            handle.mark_start_failed().await;
            return handle;
        }
    };

    handle.replace_with(channel, consumer_tag).await;
    log::info!("bucket consumer for {instance_id} running on {queue_name} with prefetch {prefetch}");
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use std::collections::HashSet;

    fn names(set: &BTreeSet<String>) -> HashSet<&str> {
        set.iter().map(|s| s.as_str()).collect()
    }

    #[tokio::test]
    async fn buckets_promotes_incoming_and_release_requeues() {
        let broker = FakeBroker::new();
        let conn = broker.connect().await;
        let seed_channel = conn.open_channel().await.unwrap();
        seed_channel
            .declare_queue("q", crate::broker::QueueOptions::shared_pool())
            .await
            .unwrap();
        for b in ["a", "b", "c"] {
            seed_channel
                .publish("", "q", b.as_bytes(), Default::default())
                .await
                .unwrap();
        }

        let handle = start(&conn, "q", 10, PeerId("p1".into()), None).await;
        // Give the fake dispatcher a moment to deliver.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let active = handle.buckets().await;
        assert_eq!(names(&active), HashSet::from(["a", "b", "c"]));

        handle.release(&active).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(broker.total_queue_depth("q").await, 3);
    }

    #[tokio::test]
    async fn stop_drains_before_returning() {
        let broker = FakeBroker::new();
        let conn = broker.connect().await;
        let seed_channel = conn.open_channel().await.unwrap();
        seed_channel
            .declare_queue("q", crate::broker::QueueOptions::shared_pool())
            .await
            .unwrap();
        for b in ["a", "b"] {
            seed_channel
                .publish("", "q", b.as_bytes(), Default::default())
                .await
                .unwrap();
        }

        let handle = start(&conn, "q", 10, PeerId("p1".into()), None).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let active = handle.buckets().await;
        assert_eq!(active.len(), 2);

        let stop_handle = handle.clone();
        let stopper = tokio::spawn(async move {
            stop_handle.stop(false).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!stopper.is_finished());

        handle.release(&active).await;
        stopper.await.unwrap();
        assert!(handle.is_stopped().await);
    }

    #[tokio::test]
    async fn forced_stop_abandons_active_and_broker_requeues() {
        let broker = FakeBroker::new();
        let conn = broker.connect().await;
        let seed_channel = conn.open_channel().await.unwrap();
        seed_channel
            .declare_queue("q", crate::broker::QueueOptions::shared_pool())
            .await
            .unwrap();
        seed_channel
            .publish("", "q", b"a", Default::default())
            .await
            .unwrap();

        let handle = start(&conn, "q", 10, PeerId("p1".into()), None).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let active = handle.buckets().await;
        assert_eq!(active.len(), 1);

        handle.stop(true).await;
        assert!(handle.is_stopped().await);
        assert_eq!(broker.total_queue_depth("q").await, 1);
    }
}
