//! Association channels.
//!
//! `dicom-ul` only offers blocking socket I/O, so every association runs on
//! a dedicated OS thread. Unlike a raw PDU pump, the actors here work at
//! the level the gateway cares about: the server actor hands whole
//! [`Exchange`]s to the SCP (answering releases itself), and the
//! destination actor runs an entire C-STORE or C-ECHO conversation per
//! command, so the async side only ever sees the resulting status code.

use crate::dimse::codec::{EncodedMessage, Exchange, MessageCodec, NegotiatedContext};
use crate::dimse::{
	next_message_id, CompositeEchoRequest, CompositeStoreRequest, DicomMessage, DimseError,
};
use crate::types::{AE, US};
use dicom::dictionary_std::tags;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::Pdu;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbound association accepted by the SCP.
///
/// Constructing one implies negotiation succeeded against this listener's
/// AE title, so the calling AE title is always known.
pub struct ServerChannel {
	commands: mpsc::Sender<ServerCommand>,
	negotiated: Vec<NegotiatedContext>,
	calling_aet: AE,
	tcp_stream: TcpStream,
}

pub struct ServerChannelOptions {
	/// The called AE title this listener answers for. Associations
	/// addressed to any other AE title are rejected during negotiation.
	pub aet: AE,
	pub tcp_stream: TcpStream,
	pub uncompressed: bool,
}

enum ServerCommand {
	Read(oneshot::Sender<Result<Exchange, DimseError>>),
	Write(DicomMessage, oneshot::Sender<Result<(), DimseError>>),
}

impl ServerChannel {
	pub async fn accept(options: ServerChannelOptions) -> Result<Self, DimseError> {
		let mut server_options =
			dicom::ul::ServerAssociationOptions::new().ae_title(options.aet.clone());
		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (ready_tx, ready) = oneshot::channel::<Result<_, DimseError>>();
		let (commands_tx, mut commands) = mpsc::channel::<ServerCommand>(1);

		thread::Builder::new()
			.name(format!("{}-scp-assoc", options.aet))
			.spawn(move || {
				let span = tracing::info_span!("ServerChannel", aet = options.aet);
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						info!(
							calling_aet = association.client_ae_title(),
							"Established inbound association"
						);
						let calling_aet = AE::from(association.client_ae_title());
						let negotiated: Vec<NegotiatedContext> = association
							.presentation_contexts()
							.iter()
							.map(NegotiatedContext::from)
							.collect();
						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream::clone");

						if ready_tx.send(Ok((stream, negotiated, calling_aet))).is_err() {
							return;
						}
						association
					}
					Err(err) => {
						let _ = ready_tx.send(Err(DimseError::Establish(Box::new(err))));
						return;
					}
				};

				let codec = MessageCodec::new(
					association
						.presentation_contexts()
						.iter()
						.map(NegotiatedContext::from)
						.collect(),
				);

				while let Some(command) = commands.blocking_recv() {
					match command {
						ServerCommand::Read(reply) => {
							let exchange =
								codec.decode(|| {
									association.receive().map_err(|e| DimseError::Transport(Box::new(e)))
								});
							// A release is answered here so the peer is not
							// left waiting on the async side.
							if let Ok(Exchange::Released) = &exchange {
								if let Err(err) = association.send(&Pdu::ReleaseRP) {
									debug!("Failed to confirm release: {err}");
								}
							}
							// Anything but a message ends the association.
							let done = !matches!(&exchange, Ok(Exchange::Message(_)));
							if reply.send(exchange).is_err() || done {
								return;
							}
						}
						ServerCommand::Write(message, reply) => {
							// Responses are command sets (plus the odd small
							// data set); nothing here needs chunking.
							let result = codec.encode(message).and_then(|encoded| {
								association
									.send(&encoded.command_pdu())
									.map_err(|e| DimseError::Transport(Box::new(e)))?;
								if let Some(data) = &encoded.data {
									association
										.send(&encoded.data_pdu(data.clone()))
										.map_err(|e| DimseError::Transport(Box::new(e)))?;
								}
								Ok(())
							});
							let done = result.is_err();
							if reply.send(result).is_err() || done {
								return;
							}
						}
					}
				}

				if let Err(err) = association.abort() {
					debug!("Abort on drop failed: {err}");
				}
			})
			.map_err(DimseError::Thread)?;

		let (tcp_stream, negotiated, calling_aet) =
			ready.await.map_err(|_| DimseError::ActorGone)??;

		Ok(Self {
			commands: commands_tx,
			negotiated,
			calling_aet,
			tcp_stream,
		})
	}

	/// AE title of the peer that opened this association.
	pub fn calling_aet(&self) -> &str {
		&self.calling_aet
	}

	pub fn negotiated(&self) -> &[NegotiatedContext] {
		&self.negotiated
	}

	/// Waits for the next message (or wind-down) from the peer.
	pub async fn read(&self, timeout: Duration) -> Result<Exchange, DimseError> {
		let (reply_tx, reply) = oneshot::channel();
		self.commands
			.send(ServerCommand::Read(reply_tx))
			.await
			.map_err(|_| DimseError::ActorGone)?;
		await_reply(reply, timeout).await
	}

	/// Sends a response on the given presentation context.
	pub async fn write(
		&self,
		message: impl Into<DicomMessage>,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), DimseError> {
		let mut message: DicomMessage = message.into();
		message.presentation_context_id = presentation_context_id;

		let (reply_tx, reply) = oneshot::channel();
		self.commands
			.send(ServerCommand::Write(message, reply_tx))
			.await
			.map_err(|_| DimseError::ActorGone)?;
		await_reply(reply, timeout).await
	}
}

impl Drop for ServerChannel {
	fn drop(&mut self) {
		shutdown_stream(&self.tcp_stream);
	}
}

/// Outbound association towards one export destination.
///
/// Each command is a complete conversation: `store` writes the C-STORE-RQ
/// (chunking oversized data sets through the P-DATA writer) and waits for
/// the C-STORE-RSP; `echo` does the same for C-ECHO. The caller only sees
/// the status code the peer answered with.
pub struct DestinationChannel {
	commands: mpsc::Sender<DestinationCommand>,
	uuid: Uuid,
	tcp_stream: TcpStream,
}

pub struct DestinationChannelOptions {
	pub calling_aet: AE,
	pub called_aet: AE,
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
	pub address: SocketAddr,
}

enum DestinationCommand {
	Store(CompositeStoreRequest, oneshot::Sender<Result<US, DimseError>>),
	Echo(oneshot::Sender<Result<US, DimseError>>),
}

impl DestinationChannel {
	pub async fn connect(options: DestinationChannelOptions) -> Result<Self, DimseError> {
		let uuid = Uuid::new_v4();
		let address = options.address;
		let thread_name = format!("{}-scu", options.called_aet);
		let ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		let (ready_tx, ready) = oneshot::channel::<Result<_, DimseError>>();
		let (commands_tx, mut commands) = mpsc::channel::<DestinationCommand>(1);

		thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let span = tracing::info_span!("DestinationChannel", scu_uuid = uuid.to_string());
				let _enter = span.enter();

				let mut association = match ul_options.establish(address) {
					Ok(mut association) => {
						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream::clone");
						if ready_tx.send(Ok(stream)).is_err() {
							return;
						}
						association
					}
					Err(err) => {
						let _ = ready_tx.send(Err(DimseError::Establish(Box::new(err))));
						return;
					}
				};

				let codec = MessageCodec::new(
					association
						.presentation_contexts()
						.iter()
						.map(NegotiatedContext::from)
						.collect(),
				);

				while let Some(command) = commands.blocking_recv() {
					let (result, reply) = match command {
						DestinationCommand::Store(request, reply) => (
							run_conversation(&mut association, &codec, request.into()),
							reply,
						),
						DestinationCommand::Echo(reply) => {
							let request = CompositeEchoRequest {
								message_id: next_message_id(),
							};
							(run_conversation(&mut association, &codec, request.into()), reply)
						}
					};

					let done = result.is_err();
					if reply.send(result).is_err() || done {
						break;
					}
				}

				if let Err(err) = association.abort() {
					debug!("Abort on drop failed: {err}");
				}
			})
			.map_err(DimseError::Thread)?;

		let tcp_stream = ready.await.map_err(|_| DimseError::ActorGone)??;

		Ok(Self {
			commands: commands_tx,
			uuid,
			tcp_stream,
		})
	}

	pub fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	/// Ships one instance and returns the C-STORE-RSP status.
	pub async fn store(
		&self,
		request: CompositeStoreRequest,
		timeout: Duration,
	) -> Result<US, DimseError> {
		let (reply_tx, reply) = oneshot::channel();
		self.commands
			.send(DestinationCommand::Store(request, reply_tx))
			.await
			.map_err(|_| DimseError::ActorGone)?;
		await_reply(reply, timeout).await
	}

	/// Verifies the association and returns the C-ECHO-RSP status.
	pub async fn echo(&self, timeout: Duration) -> Result<US, DimseError> {
		let (reply_tx, reply) = oneshot::channel();
		self.commands
			.send(DestinationCommand::Echo(reply_tx))
			.await
			.map_err(|_| DimseError::ActorGone)?;
		await_reply(reply, timeout).await
	}
}

impl Drop for DestinationChannel {
	fn drop(&mut self) {
		shutdown_stream(&self.tcp_stream);
	}
}

/// Request/response round trip on the SCU side: send the message, wait for
/// the peer's answer, pull the status out of it.
fn run_conversation(
	association: &mut dicom::ul::ClientAssociation<std::net::TcpStream>,
	codec: &MessageCodec,
	message: DicomMessage,
) -> Result<US, DimseError> {
	let encoded = codec.encode(message)?;

	association
		.send(&encoded.command_pdu())
		.map_err(|e| DimseError::Transport(Box::new(e)))?;
	send_data(association, &encoded)?;

	let exchange = codec.decode(|| association.receive().map_err(|e| DimseError::Transport(Box::new(e))))?;
	match exchange {
		Exchange::Message(response) => response
			.status()
			.ok_or(DimseError::MissingAttribute(tags::STATUS)),
		Exchange::Released | Exchange::Aborted => Err(DimseError::PeerClosed),
	}
}

/// Writes the data buffer, chunking it through the P-DATA writer when it
/// exceeds the acceptor's maximum PDU length.
fn send_data(
	association: &mut dicom::ul::ClientAssociation<std::net::TcpStream>,
	encoded: &EncodedMessage,
) -> Result<(), DimseError> {
	let Some(data) = &encoded.data else {
		return Ok(());
	};

	if data.len() > association.acceptor_max_pdu_length() as usize {
		let mut writer = association.send_pdata(encoded.presentation_context_id);
		writer.write_all(data).map_err(DimseError::ChunkWriter)?;
		Ok(())
	} else {
		association
			.send(&encoded.data_pdu(data.clone()))
			.map_err(|e| DimseError::Transport(Box::new(e)))
	}
}

async fn await_reply<R>(
	reply: oneshot::Receiver<Result<R, DimseError>>,
	timeout: Duration,
) -> Result<R, DimseError> {
	match tokio::time::timeout(timeout, reply).await {
		Ok(Ok(result)) => result,
		Ok(Err(_)) => Err(DimseError::ActorGone),
		Err(_) => Err(DimseError::Timeout),
	}
}

fn shutdown_stream(stream: &TcpStream) {
	if let Err(err) = stream.shutdown(std::net::Shutdown::Both) {
		match err.kind() {
			std::io::ErrorKind::NotConnected => {}
			_ => warn!("TcpStream::shutdown failed: {err}"),
		}
	}
}
