use crate::config::{default_grouping_timeout, Hl7Config};
use crate::ingest::InstanceProcessor;
use crate::lifecycle::Component;
use crate::storage::info::StorageInfoProvider;
use crate::storage::{DataKind, CONTENT_TYPE_HL7};
use crate::types::{DataOrigin, DataService};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// MLLP framing bytes: <VT> message <FS><CR>.
const VT: u8 = 0x0B;
const FS: u8 = 0x1C;
const CR: u8 = 0x0D;

/// HL7 v2 MLLP listener.
///
/// Every framed message is buffered, acknowledged with `MSA|AA` (or
/// `MSA|AE` on failure) and routed into the ingest path; the connection is
/// the grouping scope, so one HL7 session becomes one payload.
pub struct MllpService {
	config: Hl7Config,
	processor: Arc<InstanceProcessor>,
	storage_info: Arc<StorageInfoProvider>,
}

impl MllpService {
	pub fn new(
		config: Hl7Config,
		processor: Arc<InstanceProcessor>,
		storage_info: Arc<StorageInfoProvider>,
	) -> Self {
		Self {
			config,
			processor,
			storage_info,
		}
	}

	#[instrument(skip_all, fields(%peer))]
	async fn handle_connection(
		self: Arc<Self>,
		mut stream: TcpStream,
		peer: SocketAddr,
		token: CancellationToken,
	) {
		let correlation_id = Uuid::new_v4().to_string();
		let origin = DataOrigin {
			data_service: DataService::Hl7,
			source: peer.ip().to_string(),
			destination: String::from("GATEWAY"),
		};
		let idle = Duration::from_millis(self.config.client_timeout);
		let mut buffer = BytesMut::with_capacity(8 * 1024);

		loop {
			let read = tokio::select! {
				() = token.cancelled() => break,
				read = tokio::time::timeout(idle, stream.read_buf(&mut buffer)) => read,
			};

			match read {
				Ok(Ok(0)) => break,
				Ok(Ok(_)) => {}
				Ok(Err(err)) => {
					warn!("Connection error: {err}");
					break;
				}
				Err(_) => {
					info!("Connection idle; closing");
					break;
				}
			}

			for frame in extract_frames(&mut buffer) {
				let ack = self.process_message(frame, &correlation_id, &origin).await;
				let mut framed = Vec::with_capacity(ack.len() + 3);
				framed.push(VT);
				framed.extend_from_slice(ack.as_bytes());
				framed.push(FS);
				framed.push(CR);
				if let Err(err) = stream.write_all(&framed).await {
					warn!("Failed to write ACK: {err}");
					return;
				}
			}
		}
	}

	/// Ingests one framed message and returns the ACK to send back.
	async fn process_message(
		&self,
		message: Bytes,
		correlation_id: &str,
		origin: &DataOrigin,
	) -> String {
		let control_id =
			message_control_id(&message).unwrap_or_else(|| Uuid::new_v4().to_string());

		if !self.storage_info.has_space_to_store() {
			error!("Rejecting HL7 message: insufficient storage");
			return ack(&control_id, false);
		}

		let result = self
			.processor
			.process_raw(
				message,
				DataKind::Hl7 {
					message_control_id: control_id.clone(),
				},
				&control_id,
				CONTENT_TYPE_HL7,
				correlation_id,
				origin.clone(),
				Vec::new(),
				default_grouping_timeout(),
			)
			.await;

		match result {
			Ok(payload_id) => {
				info!(control_id, payload_id = %payload_id, "HL7 message accepted");
				ack(&control_id, true)
			}
			Err(err) => {
				error!(control_id, "Failed to ingest HL7 message: {err}");
				ack(&control_id, false)
			}
		}
	}
}

/// Drains complete `<VT>…<FS><CR>` frames from the buffer, discarding any
/// leading bytes outside a frame.
fn extract_frames(buffer: &mut BytesMut) -> Vec<Bytes> {
	let mut frames = Vec::new();

	loop {
		let Some(start) = buffer.iter().position(|b| *b == VT) else {
			buffer.clear();
			break;
		};
		if start > 0 {
			let _ = buffer.split_to(start);
		}

		let Some(end) = buffer
			.windows(2)
			.position(|pair| pair == [FS, CR])
		else {
			break;
		};

		let mut frame = buffer.split_to(end + 2);
		let _ = frame.split_to(1); // leading VT
		frame.truncate(frame.len() - 2); // trailing FS CR
		frames.push(frame.freeze());
	}
	frames
}

/// MSH-10 of the first segment.
fn message_control_id(message: &[u8]) -> Option<String> {
	let text = std::str::from_utf8(message).ok()?;
	let msh = text.split(['\r', '\n']).find(|s| s.starts_with("MSH"))?;
	let control_id = msh.split('|').nth(9)?.trim();
	if control_id.is_empty() {
		None
	} else {
		Some(control_id.to_owned())
	}
}

fn ack(control_id: &str, accepted: bool) -> String {
	let code = if accepted { "AA" } else { "AE" };
	let timestamp = Utc::now().format("%Y%m%d%H%M%S");
	format!("MSH|^~\\&|GATEWAY|GATEWAY|||{timestamp}||ACK|{control_id}|P|2.3\rMSA|{code}|{control_id}")
}

#[async_trait]
impl Component for MllpService {
	fn name(&self) -> &'static str {
		"hl7-mllp"
	}

	async fn run(self: Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.config.interface, self.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!(%address, "Started HL7 MLLP listener");

		loop {
			let accepted = tokio::select! {
				() = token.cancelled() => break,
				accepted = listener.accept() => accepted,
			};

			match accepted {
				Ok((stream, peer)) => {
					info!(%peer, "Accepted HL7 connection");
					tokio::spawn(Arc::clone(&self).handle_connection(
						stream,
						peer,
						token.clone(),
					));
				}
				Err(err) => error!("Failed to accept HL7 connection: {err}"),
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &[u8] =
		b"MSH|^~\\&|HIS|HOSPITAL|GATEWAY|HOSPITAL|20240101120000||ADT^A01|MSG0001|P|2.3\rPID|1||12345\r";

	#[test]
	fn extracts_single_frame() {
		let mut buffer = BytesMut::new();
		buffer.extend_from_slice(&[VT]);
		buffer.extend_from_slice(SAMPLE);
		buffer.extend_from_slice(&[FS, CR]);

		let frames = extract_frames(&mut buffer);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].as_ref(), SAMPLE);
		assert!(buffer.is_empty());
	}

	#[test]
	fn keeps_incomplete_frames_buffered() {
		let mut buffer = BytesMut::new();
		buffer.extend_from_slice(&[VT]);
		buffer.extend_from_slice(b"MSH|partial");

		assert!(extract_frames(&mut buffer).is_empty());
		// the partial frame is still there for the next read
		assert_eq!(buffer[0], VT);

		buffer.extend_from_slice(&[FS, CR]);
		let frames = extract_frames(&mut buffer);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].as_ref(), b"MSH|partial");
	}

	#[test]
	fn extracts_back_to_back_frames_and_discards_junk() {
		let mut buffer = BytesMut::new();
		buffer.extend_from_slice(b"junk");
		for payload in [&b"one"[..], &b"two"[..]] {
			buffer.extend_from_slice(&[VT]);
			buffer.extend_from_slice(payload);
			buffer.extend_from_slice(&[FS, CR]);
		}

		let frames = extract_frames(&mut buffer);
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].as_ref(), b"one");
		assert_eq!(frames[1].as_ref(), b"two");
	}

	#[test]
	fn reads_message_control_id() {
		assert_eq!(message_control_id(SAMPLE).as_deref(), Some("MSG0001"));
		assert_eq!(message_control_id(b"PID|only"), None);
	}

	#[test]
	fn ack_carries_the_control_id() {
		let accepted = ack("MSG0001", true);
		assert!(accepted.contains("MSA|AA|MSG0001"));
		let rejected = ack("MSG0001", false);
		assert!(rejected.contains("MSA|AE|MSG0001"));
	}
}
