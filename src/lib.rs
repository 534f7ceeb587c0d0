//! Broker-coordinated partitioning of a fixed bucket universe across a peer
//! cluster.
//!
//! A peer calls [`start_bucket_distributor`] with a broker connection, a
//! cluster name, and the full set of bucket names to partition. The
//! returned handle tracks this peer's share of that set as the cluster's
//! membership changes; [`acquire_buckets`] reads the currently acquired
//! set, [`release_buckets`] hands a subset back.

pub mod broadcast;
pub mod broker;
pub mod bucket_consumer;
pub mod config;
pub mod distributor;
pub mod error;
pub mod identity;
pub mod pool;

pub use broker::{BrokerChannel, BrokerConnection};
pub use config::DistributorOptions;
pub use distributor::DistributorHandle;
pub use error::{Error, Result};
pub use identity::PeerId;

use std::collections::BTreeSet;
use std::sync::Arc;

/// Starts a bucket distributor for `cluster_name` against `connection`,
/// partitioning `default_buckets` across every peer that joins the same
/// cluster name.
pub async fn start_bucket_distributor(
    connection: Arc<dyn BrokerConnection>,
    cluster_name: &str,
    default_buckets: Vec<String>,
    options: DistributorOptions,
) -> Result<Arc<DistributorHandle>> {
    distributor::start_bucket_distributor(connection, cluster_name, default_buckets, options).await
}

/// Stops a running distributor: drains its bucket consumer, stops gossip,
/// and announces departure to the cluster.
pub async fn stop_bucket_distributor(handle: Arc<DistributorHandle>) {
    distributor::stop_bucket_distributor(handle).await
}

/// Returns the bucket names currently acquired by this peer.
pub async fn acquire_buckets(handle: &DistributorHandle) -> BTreeSet<String> {
    distributor::acquire_buckets(handle).await
}

/// Releases the named buckets back to the broker.
pub async fn release_buckets(handle: &DistributorHandle, names: &BTreeSet<String>) {
    distributor::release_buckets(handle, names).await
}
