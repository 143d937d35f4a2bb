use super::{Acknowledger, BrokerError, BusMessage, Delivery, MessageBroker};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
	BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
	ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// RabbitMQ-backed broker over a topic exchange with publisher confirms.
pub struct RabbitBroker {
	channel: Channel,
	exchange: String,
}

impl RabbitBroker {
	pub async fn connect(endpoint: &str, exchange: &str) -> Result<Self, BrokerError> {
		let connection = Connection::connect(endpoint, ConnectionProperties::default())
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;
		let channel = connection
			.create_channel()
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;

		channel
			.confirm_select(ConfirmSelectOptions::default())
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;
		channel
			.exchange_declare(
				exchange,
				ExchangeKind::Topic,
				ExchangeDeclareOptions {
					durable: true,
					..ExchangeDeclareOptions::default()
				},
				FieldTable::default(),
			)
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;

		info!(endpoint, exchange, "Connected to message broker");
		Ok(Self {
			channel,
			exchange: exchange.to_owned(),
		})
	}
}

#[async_trait]
impl MessageBroker for RabbitBroker {
	async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BrokerError> {
		let properties = BasicProperties::default()
			.with_content_type("application/json".into())
			.with_message_id(message.message_id.clone().into())
			.with_correlation_id(message.correlation_id.clone().into());

		let confirm = self
			.channel
			.basic_publish(
				&self.exchange,
				topic,
				BasicPublishOptions::default(),
				&message.body,
				properties,
			)
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;

		match confirm {
			Confirmation::Nack(_) => Err(BrokerError::Rejected),
			_ => {
				debug!(topic, message_id = %message.message_id, "Published message");
				Ok(())
			}
		}
	}

	async fn subscribe(
		&self,
		topic: &str,
		prefetch: u16,
	) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
		self.channel
			.basic_qos(prefetch, BasicQosOptions::default())
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;

		let queue = self
			.channel
			.queue_declare(
				topic,
				QueueDeclareOptions {
					durable: true,
					..QueueDeclareOptions::default()
				},
				FieldTable::default(),
			)
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;
		self.channel
			.queue_bind(
				queue.name().as_str(),
				&self.exchange,
				topic,
				QueueBindOptions::default(),
				FieldTable::default(),
			)
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;

		let mut consumer = self
			.channel
			.basic_consume(
				queue.name().as_str(),
				"informatics-gateway",
				BasicConsumeOptions::default(),
				FieldTable::default(),
			)
			.await
			.map_err(|e| BrokerError::Connection(e.to_string()))?;

		let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
		let topic = topic.to_owned();
		tokio::spawn(async move {
			while let Some(delivery) = consumer.next().await {
				match delivery {
					Ok(delivery) => {
						let message = BusMessage {
							message_id: delivery
								.properties
								.message_id()
								.as_ref()
								.map(ToString::to_string)
								.unwrap_or_default(),
							correlation_id: delivery
								.properties
								.correlation_id()
								.as_ref()
								.map(ToString::to_string)
								.unwrap_or_default(),
							body: delivery.data.clone(),
						};
						let acker = Box::new(RabbitAcker { delivery });
						if tx.send(Delivery::new(message, acker)).await.is_err() {
							// Subscriber dropped the channel; stop consuming.
							break;
						}
					}
					Err(err) => error!(topic, "Consumer error: {err}"),
				}
			}
			warn!(topic, "Consumer stream ended");
		});

		Ok(rx)
	}
}

struct RabbitAcker {
	delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acknowledger for RabbitAcker {
	async fn ack(self: Box<Self>) {
		if let Err(err) = self.delivery.ack(BasicAckOptions::default()).await {
			error!("Failed to ack delivery: {err}");
		}
	}

	async fn nack(self: Box<Self>, requeue: bool) {
		let options = BasicNackOptions {
			requeue,
			..BasicNackOptions::default()
		};
		if let Err(err) = self.delivery.nack(options).await {
			error!("Failed to nack delivery: {err}");
		}
	}
}
