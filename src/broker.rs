//! AMQP transport
//!
//! Raw tracking payloads arrive on a topic exchange; the consumer binds an
//! exclusive auto-delete queue, decodes each delivery by its discriminator
//! and hands it to the sink fan-out. Malformed payloads and unknown
//! discriminators are logged and dropped, never fatal.

use crate::events::{EventDecodeError, TrackingEvent};
use crate::sink::EventSink;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub tracking_topic: String,
    pub sort_exchange: String,
}

/// Connect to the broker. Failing here is fatal at startup.
pub async fn connect(url: &str) -> Result<Connection, lapin::Error> {
    Connection::connect(url, ConnectionProperties::default()).await
}

/// Declare the topic exchange used for outbound sort override publication.
pub async fn declare_sort_exchange(channel: &Channel, exchange: &str) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
}

/// Bind an exclusive queue to the tracking topic and feed every delivery
/// into the sink until the consumer stream ends.
pub async fn consume_tracking(
    channel: Channel,
    topic: &str,
    sink: Arc<dyn EventSink>,
) -> Result<(), lapin::Error> {
    channel
        .exchange_declare(
            topic,
            ExchangeKind::Topic,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            queue.name().as_str(),
            topic,
            topic,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let mut consumer = channel
        .basic_consume(
            queue.name().as_str(),
            "",
            BasicConsumeOptions {
                no_ack: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    log::info!("consuming tracking events on topic {}", topic);

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                log::warn!("tracking delivery error: {}", e);
                continue;
            }
        };

        match TrackingEvent::decode(&delivery.data) {
            Ok(event) => sink.handle(&event).await,
            Err(EventDecodeError::UnknownEvent(event_type)) => {
                log::warn!("dropping event with unknown type {}", event_type);
            }
            Err(e) => {
                log::warn!("failed to decode tracking payload: {}", e);
            }
        }
    }

    log::warn!("tracking consumer stream closed");
    Ok(())
}
