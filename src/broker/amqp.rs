//! Production broker gateway, backed by a real AMQP connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::protocol::AMQPSoftError;
use lapin::{BasicProperties, Channel, Connection as LapinConnectionHandle, ConnectionProperties, ExchangeKind};

use super::{broker_unavailable, BrokerChannel, BrokerConnection, Delivery, DeliveryHandler, QueueOptions};
use crate::error::{Error, Result};

/// Opens a connection to `uri` and wraps it as a [`BrokerConnection`].
pub async fn connect(uri: &str) -> Result<Arc<dyn BrokerConnection>> {
    let connection = LapinConnectionHandle::connect(uri, ConnectionProperties::default())
        .await
        .map_err(|err| broker_unavailable("connect", err))?;
    Ok(Arc::new(AmqpConnection { connection }))
}

#[derive(Debug)]
struct AmqpConnection {
    connection: LapinConnectionHandle,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| broker_unavailable("open_channel", err))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) {
        if let Err(err) = self.connection.close(200, "normal shutdown").await {
            log::warn!("closing broker connection failed (already dead?): {err}");
        }
    }
}

#[derive(Debug)]
struct AmqpChannel {
    channel: Channel,
}

/// Exclusive queue declares and parameter-mismatch declares both surface as
/// `lapin::Error::ProtocolError`; the AMQP reply code inside is what tells
/// us which one happened. 405 (resource-locked) is another peer already
/// holding the pool-init lock, not a conflict; any other soft/hard error
/// falls back to the generic `BrokerUnavailable`.
fn classify_declare_error(queue: &str, err: &lapin::Error) -> Error {
    if let lapin::Error::ProtocolError(amqp_err) = err {
        match amqp_err.kind() {
            lapin::protocol::AMQPErrorKind::Soft(AMQPSoftError::RESOURCELOCKED) => {
                return Error::LockContended {
                    queue: queue.to_string(),
                };
            }
            lapin::protocol::AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                return Error::QueueConflict {
                    queue: queue.to_string(),
                };
            }
            _ => {}
        }
    }
    broker_unavailable("declare_queue", err)
}

fn headers_to_field_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn field_table_to_headers(table: &FieldTable) -> HashMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(s) => Some((key.to_string(), s.to_string())),
            AMQPValue::ShortString(s) => Some((key.to_string(), s.to_string())),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let declare_options = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        self.channel
            .queue_declare(name, declare_options, FieldTable::default())
            .await
            .map_err(|err| classify_declare_error(name, &err))?;
        Ok(())
    }

    async fn declare_queue_passive(&self, name: &str) -> Result<bool> {
        let declare_options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        match self
            .channel
            .queue_declare(name, declare_options, FieldTable::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn declare_fanout_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: false,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| broker_unavailable("declare_fanout_exchange", err))
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, "", QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|err| broker_unavailable("bind", err))
    }

    async fn declare_private_queue(&self) -> Result<String> {
        let declare_options = QueueDeclareOptions {
            passive: false,
            durable: false,
            exclusive: true,
            auto_delete: true,
            nowait: false,
        };
        let queue = self
            .channel
            .queue_declare("", declare_options, FieldTable::default())
            .await
            .map_err(|err| broker_unavailable("declare_private_queue", err))?;
        Ok(queue.name().to_string())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| broker_unavailable("delete_queue", err))?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let properties = BasicProperties::default().with_headers(headers_to_field_table(&headers));
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|err| broker_unavailable("publish", err))?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| broker_unavailable("set_prefetch", err))
    }

    async fn subscribe(&self, queue: &str, handler: DeliveryHandler) -> Result<String> {
        let consumer_tag = format!("consumer-{}", uuid_like());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| broker_unavailable("subscribe", err))?;

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let headers = delivery
                            .properties
                            .headers()
                            .as_ref()
                            .map(field_table_to_headers)
                            .unwrap_or_default();
                        let mapped = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            headers,
                            payload: delivery.data.clone(),
                        };
                        handler(mapped).await;
                    }
                    Err(err) => {
                        log::warn!("consumer stream error on subscription: {err}");
                        break;
                    }
                }
            }
        });

        Ok(consumer_tag)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|err| broker_unavailable("ack", err))
    }

    async fn reject_requeue(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: true })
            .await
            .map_err(|err| broker_unavailable("reject_requeue", err))
    }

    async fn reject_discard(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| broker_unavailable("reject_discard", err))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| broker_unavailable("cancel", err))
    }

    async fn recover(&self, requeue: bool) -> Result<()> {
        self.channel
            .basic_recover(requeue)
            .await
            .map_err(|err| broker_unavailable("recover", err))
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(200, "normal shutdown").await {
            log::warn!("closing broker channel failed (already dead?): {err}");
        }
    }
}

/// A lightweight unique-enough tag; avoids pulling in a UUID crate for a
/// value whose only job is to disambiguate log lines.
fn uuid_like() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos:x}-{n:x}")
}
