use crate::ae::DestinationApplicationEntity;
use crate::dimse::channel::{DestinationChannel, DestinationChannelOptions};
use crate::dimse::{DimseError, STATUS_SUCCESS};
use crate::types::{AE, UI};
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::TryFutureExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

const RECYCLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PoolError<T> {
	#[error(transparent)]
	Backend(#[from] T),
	#[error("Timed out")]
	Timeout,
	#[error("Failed to resolve destination address: {0}")]
	Resolve(String),
}

pub trait Manager: Send + Sync {
	type Object;
	type Error;
	type Parameter: PartialEq;

	async fn create(&self, param: &Self::Parameter)
		-> Result<Self::Object, PoolError<Self::Error>>;
	async fn recycle(&self, object: &Self::Object) -> Result<(), String>;
}

/// Generic object pool with per-parameter slot matching.
///
/// An association is only reusable for a compatible presentation context,
/// so `get` looks for a slot whose parameter matches before opening a new
/// association. Recycling failures fall back to a fresh object.
pub struct Pool<M: Manager> {
	inner: Arc<InnerPool<M>>,
}

impl<M: Manager> Pool<M> {
	pub fn new(manager: M, pool_size: usize, timeout: Duration) -> Self {
		Self {
			inner: Arc::new(InnerPool {
				manager,
				slots: Mutex::new(VecDeque::new()),
				semaphore: Semaphore::new(pool_size),
				timeout,
			}),
		}
	}

	pub async fn get(&self, parameter: M::Parameter) -> Result<Object<M>, PoolError<M::Error>> {
		let timeout = tokio::time::timeout(self.inner.timeout, async {
			self.inner
				.semaphore
				.acquire()
				.await
				.expect("Semaphore should not be closed")
				.forget();

			let slot: Option<ObjectInner<M>> = {
				let mut slots = self.inner.slots.lock().unwrap();
				let target_slot = slots
					.iter()
					.rposition(|slot| slot.parameter == parameter)
					.and_then(|position| slots.remove(position));

				if let Some(target_slot) = target_slot {
					Some(target_slot)
				} else {
					slots.pop_front();
					None
				}
			};

			let object_inner = if let Some(mut slot) = slot {
				let recycle_result = self.inner.manager.recycle(&slot.object).await;
				if recycle_result.is_ok() {
					slot.last_used = Instant::now();
					slot
				} else {
					let object = self.inner.manager.create(&parameter).await?;
					ObjectInner {
						object,
						parameter,
						last_used: Instant::now(),
					}
				}
			} else {
				let object = self.inner.manager.create(&parameter).await?;
				ObjectInner {
					object,
					parameter,
					last_used: Instant::now(),
				}
			};

			Ok(Object {
				pool: Arc::downgrade(&self.inner),
				inner: Some(object_inner),
			})
		});

		timeout.unwrap_or_else(|_| Err(PoolError::Timeout)).await
	}
}

impl<M: Manager> Clone for Pool<M> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

pub struct Object<M: Manager> {
	pool: Weak<InnerPool<M>>,
	inner: Option<ObjectInner<M>>,
}

impl<M: Manager> Deref for Object<M> {
	type Target = M::Object;

	fn deref(&self) -> &Self::Target {
		&self.inner.as_ref().unwrap().object
	}
}

impl<M: Manager> Drop for Object<M> {
	fn drop(&mut self) {
		if let Some(pool) = self.pool.upgrade() {
			pool.semaphore.add_permits(1);
			if let Some(object) = self.inner.take() {
				let mut slots = pool.slots.lock().unwrap();
				slots.push_back(object);
			}
		}
	}
}

struct InnerPool<M: Manager> {
	manager: M,
	slots: Mutex<VecDeque<ObjectInner<M>>>,
	semaphore: Semaphore,
	timeout: Duration,
}

struct ObjectInner<M: Manager> {
	object: M::Object,
	parameter: M::Parameter,
	#[allow(dead_code)]
	last_used: Instant,
}

/// Opens destination channels towards one export destination.
pub struct DestinationManager {
	pub address: SocketAddr,
	pub calling_aet: AE,
	pub called_aet: AE,
}

impl DestinationManager {
	pub fn for_destination(
		calling_aet: &str,
		destination: &DestinationApplicationEntity,
	) -> Result<Self, PoolError<DimseError>> {
		let address = (destination.host_ip.as_str(), destination.port)
			.to_socket_addrs()
			.map_err(|e| PoolError::Resolve(e.to_string()))?
			.next()
			.ok_or_else(|| PoolError::Resolve(destination.host_ip.clone()))?;

		Ok(Self {
			address,
			calling_aet: AE::from(calling_aet),
			called_aet: destination.ae_title.clone(),
		})
	}
}

pub struct PresentationParameter {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

impl PartialEq for PresentationParameter {
	fn eq(&self, other: &Self) -> bool {
		self.abstract_syntax_uid == other.abstract_syntax_uid
			&& self
				.transfer_syntax_uids
				.iter()
				.any(|ts| other.transfer_syntax_uids.contains(ts))
	}
}

impl Manager for DestinationManager {
	type Object = DestinationChannel;
	type Error = DimseError;
	type Parameter = PresentationParameter;

	async fn create(
		&self,
		param: &Self::Parameter,
	) -> Result<Self::Object, PoolError<Self::Error>> {
		let options = DestinationChannelOptions {
			calling_aet: self.calling_aet.clone(),
			called_aet: self.called_aet.clone(),
			abstract_syntax: param.abstract_syntax_uid.clone(),
			transfer_syntaxes: param.transfer_syntax_uids.clone(),
			address: self.address,
		};

		let channel = DestinationChannel::connect(options)
			.await
			.map_err(PoolError::Backend);

		if let Ok(channel) = &channel {
			info!(
				scu_uuid = channel.uuid().to_string(),
				called_aet = self.called_aet,
				"Opened destination channel"
			);
		} else {
			warn!(called_aet = self.called_aet, "Failed to open destination channel");
		}

		channel
	}

	async fn recycle(&self, channel: &Self::Object) -> Result<(), String> {
		let status = channel
			.echo(RECYCLE_TIMEOUT)
			.await
			.map_err(|err| format!("Failed to recycle destination channel: {err}"))?;

		if status == STATUS_SUCCESS {
			Ok(())
		} else {
			Err(format!("C-ECHO returned status {status:#06x}"))
		}
	}
}

pub type DestinationPool = Pool<DestinationManager>;
