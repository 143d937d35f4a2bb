use crate::dimse::pool::{DestinationPool, PoolError, PresentationParameter};
use crate::dimse::{next_message_id, CompositeStoreRequest, DimseError, StatusType};
use crate::types::{Priority, UI, US};
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Ships single instances to a pooled destination channel.
pub struct StoreServiceClassUser {
	pool: DestinationPool,
	timeout: Duration,
}

impl StoreServiceClassUser {
	pub const fn new(pool: DestinationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	pub async fn store(
		&self,
		file: FileDicomObject<InMemDicomObject>,
	) -> Result<StatusType, StoreError> {
		let channel = self
			.pool
			.get(PresentationParameter {
				abstract_syntax_uid: UI::from(file.meta().media_storage_sop_class_uid()),
				transfer_syntax_uids: vec![UI::from(file.meta().transfer_syntax())],
			})
			.await?;

		let request = CompositeStoreRequest {
			affected_sop_class_uid: UI::from(file.meta().media_storage_sop_class_uid()),
			affected_sop_instance_uid: UI::from(file.meta().media_storage_sop_instance_uid()),
			priority: Priority::Medium as US,
			message_id: next_message_id(),
			data_set: file.into_inner(),
		};

		let status = channel.store(request, self.timeout).await?;
		debug!(status, "C-STORE response received");
		StatusType::try_from(status).map_err(StoreError::UnknownStatus)
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Dimse(#[from] DimseError),
	#[error(transparent)]
	Pool(#[from] PoolError<DimseError>),
	#[error("Remote returned unknown status code {0:#06x}")]
	UnknownStatus(u16),
}
