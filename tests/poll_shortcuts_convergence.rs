//! S6: a joining peer's `poll` prompts an immediate `announce` from
//! existing peers, so its peer map converges within one broadcast
//! round-trip rather than waiting a full `peers_period`.

use std::time::Duration;

use bucketeer::broker::fake::FakeBroker;
use bucketeer::{
    acquire_buckets, release_buckets, start_bucket_distributor, stop_bucket_distributor, DistributorOptions,
};

fn slow_peers_fast_partitions() -> DistributorOptions {
    DistributorOptions {
        // Deliberately long: if convergence depended on this firing, the
        // test would time out before the assertion below.
        peers_period: Duration::from_secs(60),
        expiration_period: Duration::from_secs(600),
        partition_delay: Duration::from_millis(10),
        partition_period: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn joining_peer_converges_via_poll_without_waiting_for_a_full_period() {
    let broker = FakeBroker::new();
    let buckets: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

    let conn1 = broker.connect().await;
    let h1 = start_bucket_distributor(conn1, "poll", buckets.clone(), slow_peers_fast_partitions())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let initial = acquire_buckets(&h1).await;
    assert_eq!(initial.len(), 4);
    // Model the host application releasing its batch once it's done, so the
    // partition-size listener can drain and restart h1's consumer once h2
    // joins and its share shrinks.
    release_buckets(&h1, &initial).await;

    let conn2 = broker.connect().await;
    let h2 = start_bucket_distributor(conn2, "poll", buckets.clone(), slow_peers_fast_partitions())
        .await
        .unwrap();

    // Well under peers_period (60s): convergence here can only come from
    // h2's startup poll prompting h1's immediate announce.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let a1 = acquire_buckets(&h1).await;
    let a2 = acquire_buckets(&h2).await;
    assert_eq!(a1.len(), 2);
    assert_eq!(a2.len(), 2);

    release_buckets(&h1, &a1).await;
    release_buckets(&h2, &a2).await;
    stop_bucket_distributor(h1).await;
    stop_bucket_distributor(h2).await;
}
