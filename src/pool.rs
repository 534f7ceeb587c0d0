//! The pool initializer: seeds the shared bucket queue exactly once per
//! cluster, using an exclusive-queue declaration as a mutual-exclusion lock.

use std::sync::Arc;

use crate::broker::{best_effort, BrokerConnection, QueueOptions};
use crate::error::{Error, Result};

/// Ensures `bucket_queue_name` exists and carries one message per bucket
/// name. Safe to call from every peer concurrently: exactly one peer wins
/// the `owner_queue_name` exclusive lock and performs the seeding; every
/// other peer observes `LockContended`, treats that as "someone else is
/// doing it", and returns immediately.
pub async fn init_buckets(
    connection: &Arc<dyn BrokerConnection>,
    owner_queue_name: &str,
    bucket_queue_name: &str,
    default_buckets: &[String],
) -> Result<()> {
    match try_acquire_lock_and_seed(connection, owner_queue_name, bucket_queue_name, default_buckets).await {
        Ok(()) => Ok(()),
        Err(Error::BrokerUnavailable(reason)) => {
            log::warn!("pool init failed ({reason}), retrying once");
            try_acquire_lock_and_seed(connection, owner_queue_name, bucket_queue_name, default_buckets).await
        }
        Err(err) => Err(err),
    }
}

async fn try_acquire_lock_and_seed(
    connection: &Arc<dyn BrokerConnection>,
    owner_queue_name: &str,
    bucket_queue_name: &str,
    default_buckets: &[String],
) -> Result<()> {
    let lock_channel = connection.open_channel().await?;

    match lock_channel.declare_queue(owner_queue_name, QueueOptions::owner_lock()).await {
        Ok(()) => {}
        Err(Error::LockContended { .. }) => {
            log::debug!("{owner_queue_name} already locked by another peer, skipping pool seed");
            lock_channel.close().await;
            return Ok(());
        }
        Err(other) => {
            lock_channel.close().await;
            return Err(other);
        }
    }

    let result = seed_bucket_queue(lock_channel.as_ref(), bucket_queue_name, default_buckets).await;

    best_effort("delete owner lock queue", lock_channel.delete_queue(owner_queue_name)).await;
    lock_channel.close().await;

    result
}

async fn seed_bucket_queue(
    channel: &dyn crate::broker::BrokerChannel,
    bucket_queue_name: &str,
    default_buckets: &[String],
) -> Result<()> {
    if channel.declare_queue_passive(bucket_queue_name).await? {
        log::debug!("{bucket_queue_name} already seeded");
        return Ok(());
    }

    channel
        .declare_queue(bucket_queue_name, QueueOptions::shared_pool())
        .await?;

    for bucket in default_buckets {
        channel
            .publish(
                "",
                bucket_queue_name,
                bucket.as_bytes(),
                std::collections::HashMap::new(),
            )
            .await?;
    }

    log::info!(
        "seeded {bucket_queue_name} with {} bucket(s)",
        default_buckets.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::fake::FakeBroker;

    #[tokio::test]
    async fn seeds_once_and_is_idempotent_for_late_arrivals() {
        let broker = FakeBroker::new();
        let conn = broker.connect().await;
        let buckets: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        init_buckets(&conn, "cluster.bucket.owner", "cluster.bucket", &buckets)
            .await
            .unwrap();
        assert_eq!(broker.total_queue_depth("cluster.bucket").await, 3);

        // A second peer arriving later must not double-seed.
        init_buckets(&conn, "cluster.bucket.owner", "cluster.bucket", &buckets)
            .await
            .unwrap();
        assert_eq!(broker.total_queue_depth("cluster.bucket").await, 3);
    }

    #[tokio::test]
    async fn concurrent_peers_seed_exactly_once() {
        let broker = FakeBroker::new();
        let buckets: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

        let conn1 = broker.connect().await;
        let conn2 = broker.connect().await;

        let b1 = buckets.clone();
        let b2 = buckets.clone();
        let fut1 = init_buckets(&conn1, "cluster.bucket.owner", "cluster.bucket", &b1);
        let fut2 = init_buckets(&conn2, "cluster.bucket.owner", "cluster.bucket", &b2);
        let (r1, r2) = tokio::join!(fut1, fut2);
        r1.unwrap();
        r2.unwrap();

        assert_eq!(broker.total_queue_depth("cluster.bucket").await, 4);
    }
}
