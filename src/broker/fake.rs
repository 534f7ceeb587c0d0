//! An in-process broker used by the test suite. It implements enough of the
//! real AMQP model (exclusive-queue locking, fanout delivery, prefetch,
//! ack/reject-with-requeue, and exclusive-queue deletion on channel close)
//! to drive every scenario in the design document without a running broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::{BrokerChannel, BrokerConnection, Delivery, DeliveryHandler, QueueOptions};
use crate::error::{Error, Result};

#[derive(Clone)]
struct Message {
    tag: u64,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
}

struct QueueState {
    options: QueueOptions,
    locked_by: Option<u64>,
    ready: VecDeque<Message>,
    bell: Arc<Notify>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        QueueState {
            options,
            locked_by: None,
            ready: VecDeque::new(),
            bell: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct Broker {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, Vec<String>>,
    next_tag: u64,
    next_private_name: u64,
    next_conn_id: u64,
}

/// Shared handle to one in-process fake broker. Clone to hand the same
/// backing state to multiple simulated peers, exactly as multiple real
/// peers share one broker over the network.
#[derive(Clone)]
pub struct FakeBroker {
    inner: Arc<Mutex<Broker>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        FakeBroker {
            inner: Arc::new(Mutex::new(Broker::default())),
        }
    }

    pub async fn connect(&self) -> Arc<dyn BrokerConnection> {
        let mut broker = self.inner.lock().await;
        let id = broker.next_conn_id;
        broker.next_conn_id += 1;
        Arc::new(FakeConnection {
            broker: self.inner.clone(),
            conn_id: id,
            channels: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Test helper: total ready + unacked messages across every queue.
    pub async fn total_queue_depth(&self, queue: &str) -> usize {
        let broker = self.inner.lock().await;
        broker.queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// The parts of an open [`FakeChannel`] its owning connection needs in order
/// to tear it down on its behalf: a dying connection takes every channel
/// opened on it down with it, same as a real broker.
struct ChannelTeardown {
    unacked: Arc<Mutex<HashMap<u64, (String, Message)>>>,
    owned_queues: Arc<Mutex<Vec<String>>>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Debug)]
struct FakeConnection {
    broker: Arc<Mutex<Broker>>,
    conn_id: u64,
    channels: Arc<Mutex<Vec<ChannelTeardown>>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ChannelTeardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTeardown").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let unacked = Arc::new(Mutex::new(HashMap::new()));
        let cancelled = Arc::new(AtomicBool::new(false));
        let owned_queues = Arc::new(Mutex::new(Vec::new()));

        self.channels.lock().await.push(ChannelTeardown {
            unacked: unacked.clone(),
            owned_queues: owned_queues.clone(),
            cancelled: cancelled.clone(),
        });

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            conn_id: self.conn_id,
            prefetch: Arc::new(AtomicU16::new(u16::MAX)),
            unacked,
            cancelled,
            owned_queues,
        }))
    }

    /// Simulates a dead connection: every channel opened on it is cancelled,
    /// its unacked deliveries are requeued, and its exclusive queues are
    /// dropped, exactly as a real broker reclaims a connection's channels
    /// when the underlying socket dies. Idempotent with a channel's own
    /// `close`, since tearing down an already-empty channel is a no-op.
    async fn close(&self) {
        let channels = std::mem::take(&mut *self.channels.lock().await);
        for channel in channels {
            channel.cancelled.store(true, Ordering::SeqCst);
            recover_and_release(&self.broker, self.conn_id, &channel.unacked, &channel.owned_queues).await;
        }
    }
}

#[derive(Debug)]
struct FakeChannel {
    broker: Arc<Mutex<Broker>>,
    conn_id: u64,
    prefetch: Arc<AtomicU16>,
    unacked: Arc<Mutex<HashMap<u64, (String, Message)>>>,
    cancelled: Arc<AtomicBool>,
    owned_queues: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut broker = self.broker.lock().await;
        if let Some(existing) = broker.queues.get(name) {
            if options.exclusive {
                if existing.locked_by.is_some() && existing.locked_by != Some(self.conn_id) {
                    return Err(Error::LockContended {
                        queue: name.to_string(),
                    });
                }
            } else if existing.options != options {
                return Err(Error::QueueConflict {
                    queue: name.to_string(),
                });
            }
            return Ok(());
        }
        let mut state = QueueState::new(options);
        if options.exclusive {
            state.locked_by = Some(self.conn_id);
        }
        broker.queues.insert(name.to_string(), state);
        drop(broker);
        self.owned_queues.lock().await.push(name.to_string());
        Ok(())
    }

    async fn declare_queue_passive(&self, name: &str) -> Result<bool> {
        let broker = self.broker.lock().await;
        Ok(broker.queues.contains_key(name))
    }

    async fn declare_fanout_exchange(&self, name: &str) -> Result<()> {
        let mut broker = self.broker.lock().await;
        broker.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<()> {
        let mut broker = self.broker.lock().await;
        let bound = broker.exchanges.entry(exchange.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn declare_private_queue(&self) -> Result<String> {
        let mut broker = self.broker.lock().await;
        let name = format!("fake.gen-{}", broker.next_private_name);
        broker.next_private_name += 1;
        let mut state = QueueState::new(QueueOptions::private_broadcast());
        state.locked_by = Some(self.conn_id);
        broker.queues.insert(name.clone(), state);
        drop(broker);
        self.owned_queues.lock().await.push(name.clone());
        Ok(name)
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut broker = self.broker.lock().await;
        broker.queues.remove(name);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let mut broker = self.broker.lock().await;
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            broker
                .exchanges
                .get(exchange)
                .cloned()
                .unwrap_or_default()
        };
        for target in targets {
            let tag = broker.next_tag;
            broker.next_tag += 1;
            let message = Message {
                tag,
                payload: payload.to_vec(),
                headers: headers.clone(),
            };
            if let Some(queue) = broker.queues.get_mut(&target) {
                queue.ready.push_back(message);
                queue.bell.notify_waiters();
            }
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let effective = if count == 0 { u16::MAX } else { count };
        self.prefetch.store(effective, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: DeliveryHandler) -> Result<String> {
        let bell = {
            let mut broker = self.broker.lock().await;
            broker
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| QueueState::new(QueueOptions::shared_pool()))
                .bell
                .clone()
        };
        let consumer_tag = {
            let mut broker = self.broker.lock().await;
            broker.next_tag += 1;
            format!("fake-consumer-{}", broker.next_tag)
        };

        let broker = self.broker.clone();
        let prefetch = self.prefetch.clone();
        let unacked = self.unacked.clone();
        let cancelled = self.cancelled.clone();
        let queue_name = queue.to_string();

        tokio::spawn(async move {
            loop {
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                let message = {
                    let mut broker_guard = broker.lock().await;
                    let in_flight = unacked.lock().await.len();
                    let limit = prefetch.load(Ordering::SeqCst) as usize;
                    if in_flight >= limit {
                        None
                    } else if let Some(q) = broker_guard.queues.get_mut(&queue_name) {
                        q.ready.pop_front()
                    } else {
                        None
                    }
                };
                match message {
                    Some(message) => {
                        unacked
                            .lock()
                            .await
                            .insert(message.tag, (queue_name.clone(), message.clone()));
                        let delivery = Delivery {
                            delivery_tag: message.tag,
                            headers: message.headers,
                            payload: message.payload,
                        };
                        handler(delivery).await;
                    }
                    None => {
                        tokio::select! {
                            _ = bell.notified() => {}
                            _ = tokio::time::sleep(std::time::Duration::from_millis(25)) => {}
                        }
                    }
                }
            }
        });

        Ok(consumer_tag)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.unacked.lock().await.remove(&delivery_tag);
        Ok(())
    }

    async fn reject_requeue(&self, delivery_tag: u64) -> Result<()> {
        let entry = self.unacked.lock().await.remove(&delivery_tag);
        if let Some((queue_name, message)) = entry {
            let mut broker = self.broker.lock().await;
            if let Some(queue) = broker.queues.get_mut(&queue_name) {
                queue.ready.push_back(message);
                queue.bell.notify_waiters();
            }
        }
        Ok(())
    }

    async fn reject_discard(&self, delivery_tag: u64) -> Result<()> {
        self.unacked.lock().await.remove(&delivery_tag);
        Ok(())
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn recover(&self, requeue: bool) -> Result<()> {
        if !requeue {
            return Ok(());
        }
        let mut unacked = self.unacked.lock().await;
        let drained: Vec<(String, Message)> = unacked.drain().map(|(_, v)| v).collect();
        drop(unacked);
        let mut broker = self.broker.lock().await;
        for (queue_name, message) in drained {
            if let Some(queue) = broker.queues.get_mut(&queue_name) {
                queue.ready.push_back(message);
                queue.bell.notify_waiters();
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        recover_and_release(&self.broker, self.conn_id, &self.unacked, &self.owned_queues).await;
    }
}

/// Mirrors real broker behavior on a channel going away: its unacked
/// deliveries return to their queue, and any exclusive queue it held (the
/// pool-init lock, a broadcast peer's private queue) is deleted. Shared by
/// a channel's own `close` and by its owning connection's `close`, so a
/// dying connection tears down every channel opened on it the same way.
async fn recover_and_release(
    broker: &Arc<Mutex<Broker>>,
    conn_id: u64,
    unacked: &Arc<Mutex<HashMap<u64, (String, Message)>>>,
    owned_queues: &Arc<Mutex<Vec<String>>>,
) {
    let drained: Vec<(String, Message)> = unacked.lock().await.drain().map(|(_, v)| v).collect();
    let owned = owned_queues.lock().await.clone();
    let mut broker = broker.lock().await;
    for (queue_name, message) in drained {
        if let Some(queue) = broker.queues.get_mut(&queue_name) {
            queue.ready.push_back(message);
            queue.bell.notify_waiters();
        }
    }
    for name in owned {
        if let Some(queue) = broker.queues.get(&name) {
            if queue.options.exclusive && queue.locked_by == Some(conn_id) {
                broker.queues.remove(&name);
            }
        }
    }
}
