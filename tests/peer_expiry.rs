//! S3: a peer that disappears without retracting is dropped from the peer
//! map after its expiration period elapses, and its share is reabsorbed.

use std::time::Duration;

use bucketeer::broker::fake::FakeBroker;
use bucketeer::{
    acquire_buckets, release_buckets, start_bucket_distributor, stop_bucket_distributor, DistributorOptions,
};

fn fast_options() -> DistributorOptions {
    DistributorOptions {
        peers_period: Duration::from_millis(50),
        expiration_period: Duration::from_millis(200),
        partition_delay: Duration::from_millis(10),
        partition_period: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn orphaned_share_is_reabsorbed_after_expiry() {
    let broker = FakeBroker::new();
    let buckets: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

    let conn1 = broker.connect().await;
    let h1 = start_bucket_distributor(conn1, "expiry", buckets.clone(), fast_options())
        .await
        .unwrap();

    let conn2 = broker.connect().await;
    let conn2_for_teardown = conn2.clone();
    let h2 = start_bucket_distributor(conn2, "expiry", buckets.clone(), fast_options())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let held1 = acquire_buckets(&h1).await;
    let held2 = acquire_buckets(&h2).await;
    assert_eq!(held1.len(), 2);
    assert_eq!(held2.len(), 2);
    // Model the host application: done with this batch, hand it back so h1's
    // consumer isn't left draining buckets that were never released once P2
    // vanishes and the partition-size listener tries to resize it back up.
    release_buckets(&h1, &held1).await;

    // P2 vanishes without retracting: its periodic tasks die with it, so it
    // simply stops announcing rather than sending a `retract`. Its connection
    // also dies, so the broker recovers and requeues its in-flight
    // deliveries rather than leaving them stuck on a channel nobody will ever
    // close again.
    conn2_for_teardown.close().await;
    drop(h2);

    tokio::time::sleep(Duration::from_millis(800)).await;
    let reabsorbed = acquire_buckets(&h1).await;
    assert_eq!(reabsorbed.len(), 4);

    release_buckets(&h1, &reabsorbed).await;
    stop_bucket_distributor(h1).await;
}
