//! The broker gateway: a thin adapter over whatever AMQP-shaped broker the
//! host application connects us to.
//!
//! Everything above this module talks to [`BrokerConnection`] and
//! [`BrokerChannel`], never to a concrete client library. [`amqp`] backs
//! those traits with a real broker connection; [`fake`] backs them with an
//! in-process broker used by the test suite.
//!
//! Resource discipline: short-lived operations (the pool lock, seeding,
//! broadcast sends) open a channel, use it, and close it on every exit path.
//! Long-lived consumers (the bucket consumer, the broadcast consumer) own
//! their channel for their own lifetime and close it only from their own
//! shutdown path.

pub mod amqp;
pub mod fake;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// A single inbound message, handed to a subscription's delivery handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

/// Parameters for declaring (or asserting the existence of) a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub const fn owner_lock() -> Self {
        QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: false,
        }
    }

    pub const fn shared_pool() -> Self {
        QueueOptions {
            durable: false,
            exclusive: false,
            auto_delete: false,
        }
    }

    pub const fn private_broadcast() -> Self {
        QueueOptions {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// A delivery handler invoked once per message on a dedicated task. Handlers
/// never see broker-level failures directly; a handler that wants a message
/// rejected-with-requeue returns `Err`, which the channel logs.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> DeliveryFuture + Send + Sync>;
pub type DeliveryFuture = futures_util::future::BoxFuture<'static, ()>;

/// An open connection to the broker. Owned by the caller of
/// `start_bucket_distributor` and expected to outlive the distributor; the
/// distributor never closes it, only opens channels on it.
#[async_trait]
pub trait BrokerConnection: Send + Sync + fmt::Debug {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Idempotent; callers may invoke this even if channels opened on this
    /// connection are still alive elsewhere (their own close is separate).
    async fn close(&self);
}

/// A single broker channel: the unit on which queues/exchanges are declared,
/// messages published and consumed, and acknowledgement flows negotiated.
#[async_trait]
pub trait BrokerChannel: Send + Sync + fmt::Debug {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    /// `Ok(true)` if the queue exists, `Ok(false)` if it does not.
    async fn declare_queue_passive(&self, name: &str) -> Result<bool>;

    async fn declare_fanout_exchange(&self, name: &str) -> Result<()>;

    async fn bind(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Declares a server-named, exclusive, auto-delete queue (used for each
    /// peer's private broadcast inbox) and returns the assigned name.
    async fn declare_private_queue(&self) -> Result<String>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: HashMap<String, String>,
    ) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn subscribe(&self, queue: &str, handler: DeliveryHandler) -> Result<String>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject_requeue(&self, delivery_tag: u64) -> Result<()>;

    /// Rejects a delivery without requeueing it. Used only for the one
    /// payload a bucket consumer refuses to hold onto at all: a delivery
    /// whose bytes are not valid UTF-8.
    async fn reject_discard(&self, delivery_tag: u64) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn recover(&self, requeue: bool) -> Result<()>;

    /// Idempotent and infallible to callers: teardown failures are logged by
    /// the implementation, never raised.
    async fn close(&self);
}

/// Runs `op`, logging and swallowing any error instead of propagating it.
/// Used on every teardown path once a channel may already be dead.
pub async fn best_effort<F>(label: &str, op: F)
where
    F: std::future::Future<Output = Result<()>>,
{
    if let Err(err) = op.await {
        log::warn!("best-effort {label} failed (channel likely already dead): {err}");
    }
}

pub(crate) fn broker_unavailable(context: &str, err: impl fmt::Display) -> Error {
    Error::BrokerUnavailable(format!("{context}: {err}"))
}
