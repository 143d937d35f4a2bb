pub mod rabbit;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A message on the bus: JSON body plus the ids every consumer needs for
/// correlation and idempotency.
#[derive(Debug, Clone)]
pub struct BusMessage {
	pub message_id: String,
	pub correlation_id: String,
	pub body: Vec<u8>,
}

impl BusMessage {
	pub fn json<T: Serialize>(
		correlation_id: impl Into<String>,
		payload: &T,
	) -> Result<Self, BrokerError> {
		Ok(Self {
			message_id: Uuid::new_v4().to_string(),
			correlation_id: correlation_id.into(),
			body: serde_json::to_vec(payload)?,
		})
	}

	pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BrokerError> {
		Ok(serde_json::from_slice(&self.body)?)
	}
}

/// Acknowledgement half of a received message.
#[async_trait]
pub trait Acknowledger: Send {
	async fn ack(self: Box<Self>);
	async fn nack(self: Box<Self>, requeue: bool);
}

pub struct Delivery {
	pub message: BusMessage,
	acker: Box<dyn Acknowledger>,
}

impl Delivery {
	pub fn new(message: BusMessage, acker: Box<dyn Acknowledger>) -> Self {
		Self { message, acker }
	}

	pub async fn ack(self) {
		self.acker.ack().await;
	}

	pub async fn nack(self, requeue: bool) {
		self.acker.nack(requeue).await;
	}
}

/// Message-bus seam. Publication is at-least-once; consumers are expected
/// to dedupe on the ids carried by [`BusMessage`].
#[async_trait]
pub trait MessageBroker: Send + Sync {
	async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BrokerError>;

	/// Subscribes to `topic`; at most `prefetch` unacknowledged deliveries
	/// are in flight at a time.
	async fn subscribe(
		&self,
		topic: &str,
		prefetch: u16,
	) -> Result<mpsc::Receiver<Delivery>, BrokerError>;
}

#[derive(Debug, Error)]
pub enum BrokerError {
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error("broker connection error: {0}")]
	Connection(String),
	#[error("publish was rejected by the broker")]
	Rejected,
}

struct NoopAcker;

#[async_trait]
impl Acknowledger for NoopAcker {
	async fn ack(self: Box<Self>) {}
	async fn nack(self: Box<Self>, _requeue: bool) {}
}

/// Process-local broker used by tests and broker-less development setups.
/// Every published message is retained for inspection and forwarded to the
/// topic's subscribers.
#[derive(Default)]
pub struct InMemoryBroker {
	published: Mutex<Vec<(String, BusMessage)>>,
	subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<Delivery>>>>,
}

impl InMemoryBroker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn published(&self, topic: &str) -> Vec<BusMessage> {
		self.published
			.lock()
			.unwrap()
			.iter()
			.filter(|(t, _)| t == topic)
			.map(|(_, m)| m.clone())
			.collect()
	}

	pub fn published_count(&self) -> usize {
		self.published.lock().unwrap().len()
	}
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
	async fn publish(&self, topic: &str, message: BusMessage) -> Result<(), BrokerError> {
		self.published
			.lock()
			.unwrap()
			.push((topic.to_owned(), message.clone()));

		let senders = self
			.subscribers
			.lock()
			.unwrap()
			.get(topic)
			.cloned()
			.unwrap_or_default();
		for sender in senders {
			let _ = sender
				.send(Delivery::new(message.clone(), Box::new(NoopAcker)))
				.await;
		}
		Ok(())
	}

	async fn subscribe(
		&self,
		topic: &str,
		prefetch: u16,
	) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
		let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
		self.subscribers
			.lock()
			.unwrap()
			.entry(topic.to_owned())
			.or_default()
			.push(tx);
		Ok(rx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn publish_reaches_subscriber() {
		let broker = InMemoryBroker::new();
		let mut rx = broker.subscribe("topic.a", 4).await.unwrap();

		let message = BusMessage::json("corr", &serde_json::json!({"n": 1})).unwrap();
		broker.publish("topic.a", message).await.unwrap();
		broker
			.publish("topic.b", BusMessage::json("corr", &1u32).unwrap())
			.await
			.unwrap();

		let delivery = rx.recv().await.unwrap();
		assert_eq!(delivery.message.correlation_id, "corr");
		delivery.ack().await;

		assert_eq!(broker.published("topic.a").len(), 1);
		assert_eq!(broker.published("topic.b").len(), 1);
	}
}
