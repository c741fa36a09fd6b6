//! AMQP 0-9-1 transport backed by lapin

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use super::error::{BrokerError, BrokerResult};
use super::transport::{
    Acknowledger, BrokerChannel, ChannelRole, ChannelSetup, Connector, DeliveryStream,
    OutgoingMessage, QueueMessage,
};
use crate::config::BrokerSettings;

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Longest wait for a publisher confirm before the message is counted as sent
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// How often a channel re-checks connection status while waiting for loss
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Opens AMQP connections to a single broker
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            uri: settings.amqp_uri(),
        }
    }
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

async fn declare_queues(channel: &Channel, setup: &ChannelSetup) -> BrokerResult<()> {
    let mut arguments = FieldTable::default();

    if let Some(dead_letter) = &setup.dead_letter_queue {
        channel
            .queue_declare(dead_letter, durable(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("declare {dead_letter}: {e}")))?;

        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(LongString::from("")),
        );
        arguments.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(LongString::from(dead_letter.as_str())),
        );
    }

    channel
        .queue_declare(&setup.queue, durable(), arguments)
        .await
        .map_err(|e| BrokerError::Channel(format!("declare {}: {e}", setup.queue)))?;

    Ok(())
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, setup: &ChannelSetup) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let (lost, _) = watch::channel(false);
        let lost = Arc::new(lost);
        connection.on_error({
            let lost = Arc::clone(&lost);
            move |err| {
                error!(error = %err, "broker connection error");
                lost.send_replace(true);
            }
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        declare_queues(&channel, setup).await?;

        match setup.role {
            ChannelRole::Consumer => {
                if let Some(prefetch) = setup.prefetch() {
                    channel
                        .basic_qos(prefetch, BasicQosOptions::default())
                        .await
                        .map_err(|e| BrokerError::Channel(format!("qos: {e}")))?;
                }
            }
            ChannelRole::Publisher => {
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| BrokerError::Channel(format!("confirm select: {e}")))?;
            }
        }

        debug!(queue = %setup.queue, role = ?setup.role, "amqp channel ready");

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            lost,
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    lost: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn publish(&self, queue: &str, message: OutgoingMessage) -> BrokerResult<()> {
        let delivery_mode = if message.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        let properties = BasicProperties::default()
            .with_content_type(message.content_type.into())
            .with_delivery_mode(delivery_mode)
            .with_timestamp(message.timestamp.timestamp().max(0) as u64);

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        await_confirmation(queue, confirm).await;

        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(format!("consume {queue}: {e}")))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(into_queue_message)
                    .map_err(|e| BrokerError::Channel(e.to_string()))
            })
            .boxed())
    }

    fn is_open(&self) -> bool {
        !*self.lost.borrow()
            && self.connection.status().connected()
            && self.channel.status().connected()
    }

    async fn closed(&self) {
        let mut lost = self.lost.subscribe();
        let lost = async move {
            let _ = lost.wait_for(|lost| *lost).await;
        };
        tokio::pin!(lost);
        let mut poll = tokio::time::interval(STATUS_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = &mut lost => return,
                _ = poll.tick() => {
                    if !self.is_open() {
                        return;
                    }
                }
            }
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut result = Ok(());

        if self.channel.status().connected()
            && let Err(err) = self.channel.close(REPLY_SUCCESS, "channel closed").await
        {
            result = Err(BrokerError::Channel(err.to_string()));
        }

        if self.connection.status().connected()
            && let Err(err) = self
                .connection
                .close(REPLY_SUCCESS, "connection closed")
                .await
        {
            result = Err(BrokerError::Connection(err.to_string()));
        }

        self.lost.send_replace(true);
        result
    }
}

/// Confirmation is best effort: a nack or a missing confirm is logged, not retried
async fn await_confirmation(
    queue: &str,
    confirm: impl Future<Output = lapin::Result<Confirmation>>,
) {
    match tokio::time::timeout(CONFIRM_TIMEOUT, confirm).await {
        Ok(Ok(confirmation)) if confirmation.is_nack() => {
            warn!(queue, "broker did not confirm published message");
        }
        Ok(Ok(_)) => {}
        Ok(Err(err)) => warn!(queue, error = %err, "publisher confirm failed"),
        Err(_) => warn!(
            queue,
            "no publisher confirm within {}s",
            CONFIRM_TIMEOUT.as_secs()
        ),
    }
}

fn into_queue_message(delivery: Delivery) -> QueueMessage {
    let persistent = *delivery.properties.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT);
    let timestamp = (*delivery.properties.timestamp())
        .and_then(|secs| DateTime::from_timestamp(i64::try_from(secs).ok()?, 0));

    QueueMessage::new(
        delivery.delivery_tag,
        delivery.data,
        persistent,
        delivery.redelivered,
        timestamp,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}
