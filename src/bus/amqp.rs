//! AMQP 0-9-1 transport through lapin

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::warn;
use tokio::sync::mpsc;

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::error::BusError;

const DELIVERY_BUFFER: usize = 64;

/// A broker connection with one channel
pub struct AmqpBus {
    // Kept so the connection lives as long as the bus
    _connection: Connection,
    channel: Channel,
}

impl AmqpBus {
    /// Connect and declare `queues` (non-durable, deleted when unused)
    pub async fn connect(uri: &str, queues: &[&str]) -> Result<Self, BusError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let bus = Self {
            _connection: connection,
            channel,
        };
        for queue in queues {
            bus.declare(queue).await?;
        }
        Ok(bus)
    }

    async fn declare(&self, queue: &str) -> Result<(), BusError> {
        let options = QueueDeclareOptions {
            durable: false,
            auto_delete: true,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| BusError::Connect(format!("failed to declare queue '{}': {}", queue, e)))?;
        Ok(())
    }
}

fn properties(message: &OutboundMessage) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (name, value) in &message.headers {
        headers.insert(ShortString::from(name.as_str()), AMQPValue::LongString(value.as_str().into()));
    }

    let properties = BasicProperties::default()
        .with_headers(headers)
        .with_timestamp(message.timestamp)
        .with_content_type(ShortString::from(message.content_type.as_str()));
    match &message.kind {
        Some(kind) => properties.with_kind(ShortString::from(kind.as_str())),
        None => properties,
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), BusError> {
        let publish_err = |e: lapin::Error| BusError::Publish {
            queue: queue.to_string(),
            reason: e.to_string(),
        };

        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), &message.body, properties(&message))
            .await
            .map_err(publish_err)?
            .await
            .map_err(publish_err)?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<mpsc::Receiver<InboundMessage>, BusError> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let tag = format!("tokenwatch-{}", uuid::Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(queue, &tag, options, FieldTable::default())
            .await
            .map_err(|e| BusError::Subscribe {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let message = InboundMessage {
                            content_type: delivery.properties.content_type().as_ref().map(|s| s.to_string()),
                            kind: delivery.properties.kind().as_ref().map(|s| s.to_string()),
                            body: delivery.data,
                        };
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Consumer on '{}' stopped: {}", queue, e);
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
