//! The distributor: orchestrates pool initialization, cluster-membership
//! gossip, partition-size recomputation, and the bucket consumer's restart
//! cycle, for one peer.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::broadcast::{
    self, start_broadcast_consumer, stop_broadcast_consumer, BroadcastConsumerHandle, BroadcastHandler,
    GossipMessage,
};
use crate::broker::BrokerConnection;
use crate::bucket_consumer::{self, BucketConsumerHandle};
use crate::config::DistributorOptions;
use crate::identity::PeerId;
use crate::pool;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The cluster-facing half of a peer's state: its peer map and current
/// partition size. Published on a `watch` channel so the partition-size
/// listener task observes every change without polling.
#[derive(Debug, Clone)]
struct ClusterState {
    peers: HashMap<String, u64>,
    partition_size: u16,
}

impl ClusterState {
    fn recompute_partition_size(&mut self, default_bucket_count: usize) {
        let peer_count = self.peers.len().max(1);
        let share = default_bucket_count / peer_count;
        self.partition_size = share.max(1) as u16;
    }
}

struct SharedState {
    connection: Arc<dyn BrokerConnection>,
    peer_id: PeerId,
    bucket_queue: String,
    broadcast_exchange: String,
    default_bucket_count: usize,
    cluster: Mutex<ClusterState>,
    cluster_tx: watch::Sender<ClusterState>,
    bucket_consumer: Mutex<Arc<BucketConsumerHandle>>,
}

/// A running distributor instance. Holding this keeps the peer's periodic
/// tasks, broadcast consumer, and bucket consumer alive; drop only after
/// calling [`stop_bucket_distributor`].
pub struct DistributorHandle {
    state: Arc<SharedState>,
    peers_task: JoinHandle<()>,
    partitions_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
    broadcast_consumer: Mutex<Option<BroadcastConsumerHandle>>,
}

impl Drop for DistributorHandle {
    /// Aborts the periodic tasks so a dropped handle never leaves
    /// self-announce or partition-recompute running unattended. This is not
    /// a substitute for [`stop_bucket_distributor`]: it skips the
    /// broadcast-consumer teardown and the `retract` announcement, so other
    /// peers observe this peer only through its ordinary expiration sweep.
    fn drop(&mut self) {
        self.peers_task.abort();
        self.partitions_task.abort();
        self.listener_task.abort();
    }
}

/// Starts a distributor for `cluster_name` against `connection`, with a
/// fixed universe of `default_buckets` to partition across the cluster.
pub async fn start_bucket_distributor(
    connection: Arc<dyn BrokerConnection>,
    cluster_name: &str,
    default_buckets: Vec<String>,
    options: DistributorOptions,
) -> crate::error::Result<Arc<DistributorHandle>> {
    let owner_queue = format!("{cluster_name}.bucket.owner");
    let bucket_queue = format!("{cluster_name}.bucket");
    let broadcast_exchange = format!("{cluster_name}.bucket.broadcast");
    let peer_id = PeerId::generate();

    pool::init_buckets(&connection, &owner_queue, &bucket_queue, &default_buckets).await?;

    let initial_cluster = ClusterState {
        peers: HashMap::new(),
        partition_size: 1,
    };
    let (cluster_tx, cluster_rx) = watch::channel(initial_cluster.clone());

    let bucket_consumer = bucket_consumer::start(&connection, &bucket_queue, 1, peer_id.clone(), None).await;

    let state = Arc::new(SharedState {
        connection: connection.clone(),
        peer_id: peer_id.clone(),
        bucket_queue,
        broadcast_exchange: broadcast_exchange.clone(),
        default_bucket_count: default_buckets.len(),
        cluster: Mutex::new(initial_cluster),
        cluster_tx,
        bucket_consumer: Mutex::new(bucket_consumer),
    });

    let listener_task = spawn_partition_size_listener(state.clone(), cluster_rx);

    let handler: BroadcastHandler = {
        let state = state.clone();
        Arc::new(move |sender, body| {
            let state = state.clone();
            Box::pin(async move { handle_broadcast(&state, sender, &body).await })
        })
    };
    let broadcast_consumer = start_broadcast_consumer(&connection, &broadcast_exchange, handler).await?;

    broadcast::send_broadcast(&connection, &broadcast_exchange, &peer_id, "poll").await?;

    let peers_task = spawn_update_peers(state.clone(), options.peers_period, options.expiration_period);
    let partitions_task = spawn_update_partitions(state.clone(), options.partition_delay, options.partition_period);

    log::info!("bucket distributor for {peer_id} started on cluster {cluster_name}");

    Ok(Arc::new(DistributorHandle {
        state,
        peers_task,
        partitions_task,
        listener_task,
        broadcast_consumer: Mutex::new(Some(broadcast_consumer)),
    }))
}

/// Stops the distributor: cancels the periodic tasks, stops the broadcast
/// consumer, drains and stops the bucket consumer, and announces departure.
pub async fn stop_bucket_distributor(handle: Arc<DistributorHandle>) {
    handle.peers_task.abort();
    handle.partitions_task.abort();
    handle.listener_task.abort();

    if let Some(broadcast_consumer) = handle.broadcast_consumer.lock().await.take() {
        stop_broadcast_consumer(broadcast_consumer).await;
    }

    let consumer = handle.state.bucket_consumer.lock().await.clone();
    consumer.stop(false).await;

    let retract = format!("retract:{}", handle.state.peer_id);
    if let Err(err) = broadcast::send_broadcast(
        &handle.state.connection,
        &handle.state.broadcast_exchange,
        &handle.state.peer_id,
        &retract,
    )
    .await
    {
        log::warn!("failed to broadcast retract on stop: {err}");
    }

    log::info!("bucket distributor for {} stopped", handle.state.peer_id);
}

/// Returns the bucket names currently acquired by this peer.
pub async fn acquire_buckets(handle: &DistributorHandle) -> BTreeSet<String> {
    let consumer = handle.state.bucket_consumer.lock().await.clone();
    consumer.buckets().await
}

/// Releases the named buckets back to the broker.
pub async fn release_buckets(handle: &DistributorHandle, names: &BTreeSet<String>) {
    let consumer = handle.state.bucket_consumer.lock().await.clone();
    consumer.release(names).await;
}

async fn handle_broadcast(state: &Arc<SharedState>, sender_id: PeerId, body: &str) {
    let _ = &sender_id;
    match GossipMessage::parse(body) {
        Some(GossipMessage::Announce(id)) => {
            let mut cluster = state.cluster.lock().await;
            cluster.peers.insert(id.0, now_millis());
            let snapshot = cluster.clone();
            drop(cluster);
            let _ = state.cluster_tx.send(snapshot);
        }
        Some(GossipMessage::Retract(id)) => {
            let mut cluster = state.cluster.lock().await;
            cluster.peers.remove(&id.0);
            let snapshot = cluster.clone();
            drop(cluster);
            let _ = state.cluster_tx.send(snapshot);
        }
        Some(GossipMessage::Poll) => {
            if let Err(err) = broadcast::send_broadcast(
                &state.connection,
                &state.broadcast_exchange,
                &state.peer_id,
                &format!("announce:{}", state.peer_id),
            )
            .await
            {
                log::warn!("failed to answer poll with an announce: {err}");
            }
        }
        None => {
            log::debug!("ignoring unrecognized broadcast body: {body}");
        }
    }
}

fn spawn_update_peers(
    state: Arc<SharedState>,
    peers_period: std::time::Duration,
    expiration_period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(peers_period);
        loop {
            ticker.tick().await;
            let message = format!("announce:{}", state.peer_id);
            if let Err(err) =
                broadcast::send_broadcast(&state.connection, &state.broadcast_exchange, &state.peer_id, &message)
                    .await
            {
                log::warn!("self-announce failed: {err}");
            }

            let expired_before = now_millis().saturating_sub(expiration_period.as_millis() as u64);
            let mut cluster = state.cluster.lock().await;
            cluster.peers.retain(|_, last_seen| *last_seen >= expired_before);
            let snapshot = cluster.clone();
            drop(cluster);
            let _ = state.cluster_tx.send(snapshot);
        }
    })
}

fn spawn_update_partitions(
    state: Arc<SharedState>,
    partition_delay: std::time::Duration,
    partition_period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(partition_delay).await;
        let mut ticker = tokio::time::interval(partition_period);
        loop {
            ticker.tick().await;
            let mut cluster = state.cluster.lock().await;
            cluster.recompute_partition_size(state.default_bucket_count);
            let snapshot = cluster.clone();
            drop(cluster);
            let _ = state.cluster_tx.send(snapshot);
        }
    })
}

/// Restarts the bucket consumer with a new prefetch whenever partition size
/// changes, and retries a previously failed start on any subsequent change.
fn spawn_partition_size_listener(state: Arc<SharedState>, mut cluster_rx: watch::Receiver<ClusterState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_partition_size = cluster_rx.borrow().partition_size;
        loop {
            if cluster_rx.changed().await.is_err() {
                return;
            }
            let new_partition_size = cluster_rx.borrow().partition_size;
            let current = state.bucket_consumer.lock().await.clone();
            let consumer_is_stopped = current.is_stopped().await;

            if new_partition_size != last_partition_size {
                log::info!(
                    "partition size changed {last_partition_size} -> {new_partition_size}, restarting bucket consumer"
                );
                current.stop(false).await;
                let restarted = bucket_consumer::start(
                    &state.connection,
                    &state.bucket_queue,
                    new_partition_size,
                    state.peer_id.clone(),
                    Some(current),
                )
                .await;
                *state.bucket_consumer.lock().await = restarted;
                last_partition_size = new_partition_size;
            } else if consumer_is_stopped {
                log::info!("retrying bucket consumer start at partition size {new_partition_size}");
                let restarted = bucket_consumer::start(
                    &state.connection,
                    &state.bucket_queue,
                    new_partition_size,
                    state.peer_id.clone(),
                    Some(current),
                )
                .await;
                *state.bucket_consumer.lock().await = restarted;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;
    use std::time::Duration;

    fn fast_options() -> DistributorOptions {
        DistributorOptions {
            peers_period: Duration::from_millis(50),
            expiration_period: Duration::from_millis(500),
            partition_delay: Duration::from_millis(10),
            partition_period: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn single_peer_acquires_the_full_bucket_set() {
        let broker = FakeBroker::new();
        let conn = broker.connect().await;
        let buckets: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let handle = start_bucket_distributor(conn, "cluster", buckets.clone(), fast_options())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let acquired = acquire_buckets(&handle).await;
        assert_eq!(acquired, buckets.into_iter().collect());

        // Model the host application: hand the batch back so a non-forced
        // stop isn't left draining buckets nobody will ever release.
        release_buckets(&handle, &acquired).await;
        stop_bucket_distributor(handle).await;
    }

    #[tokio::test]
    async fn two_peers_converge_on_even_shares() {
        let broker = FakeBroker::new();
        let buckets: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

        let conn1 = broker.connect().await;
        let h1 = start_bucket_distributor(conn1, "cluster", buckets.clone(), fast_options())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let p1_initial = acquire_buckets(&h1).await;
        assert_eq!(p1_initial.len(), 4);
        // Model the host application releasing its batch once it's done, so
        // the partition-size listener's drain-then-restart can proceed once
        // P2 joins and h1's share shrinks.
        release_buckets(&h1, &p1_initial).await;

        let conn2 = broker.connect().await;
        let h2 = start_bucket_distributor(conn2, "cluster", buckets.clone(), fast_options())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let a1 = acquire_buckets(&h1).await;
        let a2 = acquire_buckets(&h2).await;
        assert_eq!(a1.len(), 2);
        assert_eq!(a2.len(), 2);
        let union: BTreeSet<String> = a1.union(&a2).cloned().collect();
        assert_eq!(union, buckets.into_iter().collect());

        release_buckets(&h1, &a1).await;
        release_buckets(&h2, &a2).await;
        stop_bucket_distributor(h1).await;
        stop_bucket_distributor(h2).await;
    }
}
