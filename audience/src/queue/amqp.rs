//! RabbitMQ queue based on `lapin`.
//!
//! Topology:
//!
//! ```text
//!  scheduler ──► (default exchange) ──► task queue ──► workers (competing consumers)
//!                                           │
//!                                           └─ rejected without requeue ──► dead-letter exchange
//!
//!  workers ──► notification exchange (direct) ──routing key──► notification queue ──► uploaders
//! ```

use std::fmt;
use std::sync::Arc;

use config::shared::QueueConfig;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use crate::bail;
use crate::error::{AudienceResult, ErrorKind};
use crate::messages::{AudienceChangeMessage, ReconciliationTask};
use crate::queue::{ChangePublisher, TaskConsumer, TaskDelivery, TaskOutcome, TaskQueue};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

fn message_properties(message_id: String) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(message_id))
}

fn task_queue_arguments(config: &QueueConfig) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &config.dead_letter_exchange {
        arguments.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    arguments
}

/// Connection to RabbitMQ serving both the task queue and the notification exchange.
///
/// Publishing goes through a single channel in confirm mode, so a publish only succeeds once the
/// broker took responsibility for the message. Every consumer gets its own channel.
#[derive(Clone)]
pub struct AmqpQueue {
    connection: Arc<Connection>,
    publish_channel: Channel,
    config: Arc<QueueConfig>,
}

impl AmqpQueue {
    /// Connects to the broker and declares the topology.
    ///
    /// Declarations are idempotent, so every process declares the full topology on start-up.
    pub async fn connect(config: QueueConfig) -> AudienceResult<Self> {
        let connection =
            Connection::connect(config.url.expose_secret(), ConnectionProperties::default())
                .await?;
        let publish_channel = connection.create_channel().await?;
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let queue = Self {
            connection: Arc::new(connection),
            publish_channel,
            config: Arc::new(config),
        };
        queue.declare_topology().await?;

        info!(
            task_queue = %queue.config.task_queue,
            notification_exchange = %queue.config.notification_exchange,
            "connected to message queue"
        );

        Ok(queue)
    }

    async fn declare_topology(&self) -> AudienceResult<()> {
        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        self.publish_channel
            .queue_declare(
                &self.config.task_queue,
                durable_queue,
                task_queue_arguments(&self.config),
            )
            .await?;

        self.publish_channel
            .exchange_declare(
                &self.config.notification_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.publish_channel
            .queue_declare(
                &self.config.notification_routing_key,
                durable_queue,
                FieldTable::default(),
            )
            .await?;

        self.publish_channel
            .queue_bind(
                &self.config.notification_routing_key,
                &self.config.notification_exchange,
                &self.config.notification_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        message_id: String,
    ) -> AudienceResult<()> {
        let confirmation = self
            .publish_channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                message_properties(message_id),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            bail!(
                ErrorKind::QueueOperationFailed,
                "Broker rejected a published message",
                format!("exchange '{exchange}', routing key '{routing_key}'")
            );
        }

        Ok(())
    }

    /// Closes the connection.
    pub async fn close(&self) -> AudienceResult<()> {
        self.connection.close(200, "shutdown").await?;

        Ok(())
    }
}

impl fmt::Debug for AmqpQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpQueue")
            .field("task_queue", &self.config.task_queue)
            .field("notification_exchange", &self.config.notification_exchange)
            .finish()
    }
}

impl TaskQueue for AmqpQueue {
    type Consumer = AmqpConsumer;

    async fn publish_task(&self, task: &ReconciliationTask) -> AudienceResult<()> {
        let payload = task.to_payload()?;
        self.publish("", &self.config.task_queue, &payload, task.message_id())
            .await
    }

    async fn consumer(&self, tag: &str) -> AudienceResult<AmqpConsumer> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;
        let consumer = channel
            .basic_consume(
                &self.config.task_queue,
                tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!(consumer_tag = tag, prefetch = self.config.prefetch, "created task consumer");

        Ok(AmqpConsumer {
            _channel: channel,
            consumer,
        })
    }
}

impl ChangePublisher for AmqpQueue {
    async fn publish_change(&self, message: &AudienceChangeMessage) -> AudienceResult<()> {
        let payload = message.to_payload()?;
        self.publish(
            &self.config.notification_exchange,
            &self.config.notification_routing_key,
            &payload,
            message.message_id(),
        )
        .await
    }
}

/// Consumer of the task queue on a dedicated channel.
///
/// Dropping it closes nothing explicitly: unsettled deliveries return to the queue once the
/// channel goes away with the connection.
pub struct AmqpConsumer {
    _channel: Channel,
    consumer: Consumer,
}

impl fmt::Debug for AmqpConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConsumer")
            .field("tag", &self.consumer.tag())
            .finish()
    }
}

impl TaskConsumer for AmqpConsumer {
    type Delivery = AmqpDelivery;

    async fn next(&mut self) -> Option<AudienceResult<AmqpDelivery>> {
        let delivery = self.consumer.next().await?;

        Some(
            delivery
                .map(|delivery| AmqpDelivery { delivery })
                .map_err(Into::into),
        )
    }
}

#[derive(Debug)]
pub struct AmqpDelivery {
    delivery: Delivery,
}

impl TaskDelivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    async fn settle(self, outcome: TaskOutcome) -> AudienceResult<()> {
        let acker = &self.delivery.acker;
        match outcome {
            TaskOutcome::Committed => acker.ack(BasicAckOptions::default()).await?,
            TaskOutcome::Requeue => {
                acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await?
            }
            TaskOutcome::Drop => {
                acker
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: false,
                    })
                    .await?
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use config::SerializableSecretString;

    use super::*;

    fn config(dead_letter_exchange: Option<&str>) -> QueueConfig {
        QueueConfig {
            url: SerializableSecretString::from("amqp://localhost:5672/%2f".to_string()),
            task_queue: QueueConfig::DEFAULT_TASK_QUEUE.to_string(),
            dead_letter_exchange: dead_letter_exchange.map(str::to_string),
            notification_exchange: QueueConfig::DEFAULT_NOTIFICATION_EXCHANGE.to_string(),
            notification_routing_key: QueueConfig::DEFAULT_NOTIFICATION_ROUTING_KEY.to_string(),
            prefetch: QueueConfig::DEFAULT_PREFETCH,
        }
    }

    #[test]
    fn dead_letter_exchange_is_optional() {
        assert!(task_queue_arguments(&config(None)).inner().is_empty());

        let arguments = task_queue_arguments(&config(Some("audience.dead")));
        assert!(
            arguments
                .inner()
                .contains_key(&ShortString::from("x-dead-letter-exchange"))
        );
    }

    #[test]
    fn messages_are_persistent_json() {
        let properties = message_properties("7-1759280400".to_string());

        assert_eq!(properties.delivery_mode(), &Some(DELIVERY_MODE_PERSISTENT));
        assert_eq!(
            properties.content_type().as_ref().map(|value| value.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            properties.message_id().as_ref().map(|value| value.as_str()),
            Some("7-1759280400")
        );
    }
}
