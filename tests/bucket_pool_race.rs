//! S5: two peers racing to seed an empty pool exactly once.

use bucketeer::broker::fake::FakeBroker;
use bucketeer::pool::init_buckets;

#[tokio::test]
async fn exactly_one_peer_seeds_the_pool() {
    let broker = FakeBroker::new();
    let buckets: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

    let conn1 = broker.connect().await;
    let conn2 = broker.connect().await;

    let (r1, r2) = tokio::join!(
        init_buckets(&conn1, "race.bucket.owner", "race.bucket", &buckets),
        init_buckets(&conn2, "race.bucket.owner", "race.bucket", &buckets),
    );
    r1.unwrap();
    r2.unwrap();

    assert_eq!(broker.total_queue_depth("race.bucket").await, buckets.len());
}
