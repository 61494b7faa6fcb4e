//! RabbitMQ transport built on `lapin`.

use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::debug;

use crate::error::BrokerError;
use crate::transport::{
    BrokerTransport, DeliveryEvent, DeliveryStream, RawDelivery, ShutdownSignal, Topology,
    TransportSettings,
};

const PERSISTENT: u8 = 2;
const CONTENT_TYPE_JSON: &str = "application/json";

pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
}

fn map_lapin_error(error: lapin::Error) -> BrokerError {
    match error {
        lapin::Error::IOError(io) => {
            BrokerError::Io(std::io::Error::new(io.kind(), io.to_string()))
        }
        other => BrokerError::Transport(other.to_string()),
    }
}

/// Close reasons that mean the broker ended the session on purpose rather
/// than the link failing underneath it.
fn is_broker_initiated(reason: &str) -> bool {
    let normalized = reason.to_ascii_lowercase().replace(['-', ' '], "_");
    ["connection_forced", "resource_locked", "access_refused"]
        .iter()
        .any(|marker| normalized.contains(marker))
}

impl BrokerTransport for AmqpTransport {
    async fn connect(settings: &TransportSettings) -> Result<Self, BrokerError> {
        debug!(?settings, "opening AMQP connection");
        let uri = settings.amqp_uri();
        let connecting = Connection::connect(&uri, ConnectionProperties::default());
        let connection = tokio::time::timeout(settings.connect_timeout, connecting)
            .await
            .map_err(|_| BrokerError::ConnectTimeout(settings.connect_timeout))?
            .map_err(map_lapin_error)?;

        let channel = connection.create_channel().await.map_err(map_lapin_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(map_lapin_error)?;

        Ok(Self {
            connection,
            channel,
        })
    }

    async fn declare_topology(&mut self, topology: &Topology) -> Result<(), BrokerError> {
        let durable_queue = QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        };

        if !topology.exchange.is_empty() {
            self.channel
                .exchange_declare(
                    &topology.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(map_lapin_error)?;
        }

        for queue in [&topology.inbound_queue, &topology.confirmation_queue] {
            self.channel
                .queue_declare(queue, durable_queue, FieldTable::default())
                .await
                .map_err(map_lapin_error)?;
        }

        if !topology.exchange.is_empty() {
            let bindings = [
                (&topology.inbound_queue, &topology.inbound_routing_key),
                (&topology.confirmation_queue, &topology.confirmation_routing_key),
            ];
            for (queue, routing_key) in bindings {
                self.channel
                    .queue_bind(
                        queue,
                        &topology.exchange,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(map_lapin_error)?;
            }
        }

        Ok(())
    }

    async fn consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(map_lapin_error)?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(map_lapin_error)?;

        let deliveries = consumer.map(|delivery| match delivery {
            Ok(delivery) => DeliveryEvent::Delivery(RawDelivery {
                delivery_tag: delivery.delivery_tag,
                payload: delivery.data,
                redelivered: delivery.redelivered,
            }),
            Err(error) => {
                let reason = error.to_string();
                DeliveryEvent::Shutdown(ShutdownSignal {
                    graceful: is_broker_initiated(&reason),
                    reason,
                })
            }
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(map_lapin_error)
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(CONTENT_TYPE_JSON.into());

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(map_lapin_error)?
            .await
            .map_err(map_lapin_error)?;

        if confirmation.is_nack() {
            return Err(BrokerError::Transport(
                "broker rejected published message".to_string(),
            ));
        }
        Ok(())
    }

    async fn cancel_consumer(&mut self, consumer_tag: &str) -> Result<(), BrokerError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(map_lapin_error)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "client closing")
                .await
                .map_err(map_lapin_error)?;
        }
        if self.connection.status().connected() {
            self.connection
                .close(200, "client closing")
                .await
                .map_err(map_lapin_error)?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}
