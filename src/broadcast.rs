//! The broadcast plane: fanout gossip carrying `announce`, `retract`, and
//! `poll` between peers.
//!
//! Every peer binds one auto-named, exclusive, auto-delete queue to a single
//! fanout exchange; every message published to that exchange reaches every
//! peer, including the sender, which disambiguates self-delivery via the
//! `peer-id` header rather than by filtering its own messages out.

use std::collections::HashMap;
use std::sync::Arc;

use crate::broker::{best_effort, BrokerChannel, BrokerConnection, Delivery, DeliveryHandler};
use crate::error::Result;
use crate::identity::PeerId;

/// Prefetch applied to every broadcast consumer channel. Gossip messages are
/// small and cheap to process; a generous prefetch keeps one slow handler
/// from starving the rest of a burst.
const BROADCAST_PREFETCH: u16 = 10;

/// A handler invoked once per gossip message, given the announcing peer and
/// the raw message body (`announce:<id>`, `retract:<id>`, or `poll`).
pub type BroadcastHandler = Arc<dyn Fn(PeerId, String) -> BroadcastHandlerFuture + Send + Sync>;
pub type BroadcastHandlerFuture = futures_util::future::BoxFuture<'static, ()>;

/// Publishes `message` to `exchange` on a short-lived channel, tagging it
/// with the sending peer's id. Fire-and-forget: the channel is opened,
/// used, and closed within this call regardless of outcome.
pub async fn send_broadcast(
    connection: &Arc<dyn BrokerConnection>,
    exchange: &str,
    peer_id: &PeerId,
    message: &str,
) -> Result<()> {
    let channel = connection.open_channel().await?;
    let mut headers = HashMap::new();
    headers.insert("peer-id".to_string(), peer_id.to_string());
    let result = channel.publish(exchange, "", message.as_bytes(), headers).await;
    channel.close().await;
    result
}

/// A running broadcast subscription. Dropping this without calling
/// [`stop_broadcast_consumer`] leaks the channel; the distributor always
/// stops it explicitly on shutdown.
pub struct BroadcastConsumerHandle {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
}

/// Declares `exchange` as fanout, binds a fresh private queue to it, and
/// subscribes with `handler`. Deliveries are acked unconditionally after the
/// handler returns: a handler failure is logged, never left unacked, so one
/// malformed message can never jam the gossip loop.
pub async fn start_broadcast_consumer(
    connection: &Arc<dyn BrokerConnection>,
    exchange: &str,
    handler: BroadcastHandler,
) -> Result<BroadcastConsumerHandle> {
    let channel = connection.open_channel().await?;
    channel.declare_fanout_exchange(exchange).await?;
    let queue_name = channel.declare_private_queue().await?;
    channel.bind(&queue_name, exchange).await?;
    channel.set_prefetch(BROADCAST_PREFETCH).await?;

    let delivery_handler: DeliveryHandler = {
        let channel = channel.clone();
        Arc::new(move |delivery: Delivery| {
            let channel = channel.clone();
            let handler = handler.clone();
            Box::pin(async move {
                let sender = delivery
                    .headers
                    .get("peer-id")
                    .cloned()
                    .map(PeerId)
                    .unwrap_or_else(|| PeerId("unknown".to_string()));
                match String::from_utf8(delivery.payload.clone()) {
                    Ok(body) => handler(sender, body).await,
                    Err(err) => log::warn!("dropping non-UTF-8 broadcast payload: {err}"),
                }
                best_effort("ack broadcast delivery", channel.ack(delivery.delivery_tag)).await;
            })
        })
    };

    let consumer_tag = channel.subscribe(&queue_name, delivery_handler).await?;
    Ok(BroadcastConsumerHandle { channel, consumer_tag })
}

/// Cancels the subscription and closes the channel. The channel's
/// exclusive, auto-delete private queue disappears with it.
pub async fn stop_broadcast_consumer(handle: BroadcastConsumerHandle) {
    best_effort("cancel broadcast consumer", handle.channel.cancel(&handle.consumer_tag)).await;
    handle.channel.close().await;
}

/// Parses a gossip message body into the verb it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipMessage {
    Announce(PeerId),
    Retract(PeerId),
    Poll,
}

impl GossipMessage {
    pub fn parse(body: &str) -> Option<GossipMessage> {
        if body == "poll" {
            Some(GossipMessage::Poll)
        } else if let Some(id) = body.strip_prefix("announce:") {
            Some(GossipMessage::Announce(PeerId(id.to_string())))
        } else if let Some(id) = body.strip_prefix("retract:") {
            Some(GossipMessage::Retract(PeerId(id.to_string())))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_announce_retract_and_poll() {
        assert_eq!(
            GossipMessage::parse("announce:p1"),
            Some(GossipMessage::Announce(PeerId("p1".to_string())))
        );
        assert_eq!(
            GossipMessage::parse("retract:p1"),
            Some(GossipMessage::Retract(PeerId("p1".to_string())))
        );
        assert_eq!(GossipMessage::parse("poll"), Some(GossipMessage::Poll));
        assert_eq!(GossipMessage::parse("garbage"), None);
    }

    #[tokio::test]
    async fn broadcast_round_trips_through_a_fake_exchange() {
        use crate::broker::fake::FakeBroker;
        use std::sync::atomic::{AtomicBool, Ordering};

        let broker = FakeBroker::new();
        let conn1 = broker.connect().await;
        let conn2 = broker.connect().await;

        let received = Arc::new(AtomicBool::new(false));
        let received_clone = received.clone();
        let handler: BroadcastHandler = Arc::new(move |_sender, body| {
            let received = received_clone.clone();
            Box::pin(async move {
                if body == "poll" {
                    received.store(true, Ordering::SeqCst);
                }
            })
        });

        let consumer = start_broadcast_consumer(&conn2, "cluster.bucket.broadcast", handler)
            .await
            .unwrap();

        send_broadcast(&conn1, "cluster.bucket.broadcast", &PeerId("p1".to_string()), "poll")
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(received.load(Ordering::SeqCst));

        stop_broadcast_consumer(consumer).await;
    }
}
