//! RabbitMQ implementation of [`BrokerClient`]
//!
//! Each actor owns one connection. Publishing goes through a single channel
//! with publisher confirms awaited per message; every consumer gets its own
//! channel so its prefetch (`basic.qos`) applies to it alone.

use crate::{
    Acknowledge, BrokerClient, BrokerConfig, BrokerError, BrokerResult, Delivery, DeliveryStream,
    OutgoingMessage, Topology,
};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

/// AMQP delivery mode for messages that survive a broker restart
const PERSISTENT: u8 = 2;

/// RabbitMQ broker client
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    name: String,
}

impl AmqpBroker {
    /// Connect and open the publishing channel
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or channel cannot be established.
    pub async fn connect(config: &BrokerConfig, connection_name: &str) -> BrokerResult<Self> {
        let properties =
            ConnectionProperties::default().with_connection_name(connection_name.to_string().into());
        let connection = Connection::connect(&config.uri(), properties).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!(
            "Connected to RabbitMQ at {}:{} as {}",
            config.host, config.port, connection_name
        );

        Ok(Self {
            connection,
            channel,
            name: connection_name.to_string(),
        })
    }

    /// Close the connection
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the close.
    pub async fn close(&self) -> BrokerResult<()> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

struct AmqpAcker(Acker);

#[async_trait::async_trait]
impl Acknowledge for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.routing_key.to_string(),
        delivery.data,
        delivery.redelivered,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

#[async_trait::async_trait]
impl BrokerClient for AmqpBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> BrokerResult<()> {
        let mut properties =
            BasicProperties::default().with_content_type(message.content_type.to_string().into());
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::Publish(format!(
                "broker refused message with key {routing_key}"
            )));
        }

        debug!("Published to {} with routing key {}", exchange, routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let consumer = channel
            .basic_consume(
                queue,
                &format!("{}-{}", self.name, queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!("Consuming {} with prefetch {}", queue, prefetch);

        // The consumer channel must outlive the stream
        let stream = consumer.map(move |result| {
            let _channel = &channel;
            result.map(into_delivery).map_err(BrokerError::from)
        });
        Ok(Box::pin(stream))
    }

    async fn declare_topology(&self, topology: &Topology) -> BrokerResult<()> {
        let durable_exchange = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        for exchange in topology.exchanges() {
            self.channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    durable_exchange,
                    FieldTable::default(),
                )
                .await?;
        }

        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };
        for queue in topology.queues() {
            self.channel
                .queue_declare(queue, durable_queue, FieldTable::default())
                .await?;
        }

        for binding in topology.bindings() {
            self.channel
                .queue_bind(
                    &binding.queue,
                    &binding.exchange,
                    &binding.pattern,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            info!(
                "Queue {} bound to {} with routing key {}",
                binding.queue, binding.exchange, binding.pattern
            );
        }
        Ok(())
    }

    async fn verify_topology(&self, topology: &Topology) -> BrokerResult<()> {
        // A failed passive declare closes the channel, so use a throwaway one
        let channel = self.connection.create_channel().await?;
        let passive_exchange = ExchangeDeclareOptions {
            passive: true,
            durable: true,
            ..ExchangeDeclareOptions::default()
        };
        for exchange in topology.exchanges() {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    passive_exchange,
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::TopologyMissing(format!("exchange {exchange}: {e}")))?;
        }

        let passive_queue = QueueDeclareOptions {
            passive: true,
            durable: true,
            ..QueueDeclareOptions::default()
        };
        for queue in topology.queues() {
            channel
                .queue_declare(queue, passive_queue, FieldTable::default())
                .await
                .map_err(|e| BrokerError::TopologyMissing(format!("queue {queue}: {e}")))?;
        }

        let _ = channel.close(200, "verified").await;
        Ok(())
    }
}
