use dicom::ul::pdu::{PDataValueType, PresentationContextResult};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::{debug, error};
use uuid::Uuid;

use super::{AskPattern, Association, AssociationError, ChannelError, Command};
use crate::types::UI;

/// One (abstract syntax, transfer syntaxes) pair proposed at association
/// negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposedContext {
	pub abstract_syntax_uid: UI,
	pub transfer_syntax_uids: Vec<UI>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub presentation_contexts: Vec<ProposedContext>,
	pub address: SocketAddr,
}

pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	negotiated: Vec<PresentationContextResult>,
	/// Abstract syntaxes in proposal order; `dicom-ul` numbers proposals
	/// 1, 3, 5, … in that same order.
	proposed: Vec<UI>,
}

impl ClientAssociation {
	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation<std::net::TcpStream>,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				if is_command {
					association.send(pdu).map_err(AssociationError::ClientAssociation)
				} else {
					let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
					if data_length > association.acceptor_max_pdu_length() as usize {
						for pdv in data {
							assert_eq!(pdv.value_type, PDataValueType::Data);
							let mut writer = association.send_pdata(pdv.presentation_context_id);
							writer
								.write_all(&pdv.data)
								.map_err(AssociationError::ChunkWriter)?;
						}
						Ok(())
					} else {
						association.send(pdu).map_err(AssociationError::ClientAssociation)
					}
				}
			}
			_ => association.send(pdu).map_err(AssociationError::ClientAssociation),
		}
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = options.address;
		let proposed = options
			.presentation_contexts
			.iter()
			.map(|pctx| pctx.abstract_syntax_uid.clone())
			.collect::<Vec<_>>();

		let mut ul_options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet);
		for pctx in options.presentation_contexts {
			ul_options = ul_options
				.with_presentation_context(pctx.abstract_syntax_uid, pctx.transfer_syntax_uids);
		}

		let _handle = thread::Builder::new()
			.name(String::from("client-association"))
			.spawn(move || {
				let mut association = match ul_options.establish(address) {
					Ok(mut association) => {
						let negotiated = Vec::from(association.presentation_contexts());

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream should be cloneable");

						connect_tx.send(Ok((stream, negotiated))).map_err(|_| ())?;

						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result = association
								.receive()
								.map_err(AssociationError::ClientAssociation);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in ClientAssociation backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to abort ClientAssociation: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, negotiated) = connect_result.await.expect("connect_result.await")?;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			negotiated,
			proposed,
		})
	}

	pub fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	/// The accepted presentation context negotiated for `abstract_syntax`,
	/// if any.
	pub fn select_context(&self, abstract_syntax: &str) -> Option<&PresentationContextResult> {
		self.proposed
			.iter()
			.enumerate()
			.filter(|(_, proposed)| proposed.as_str() == abstract_syntax)
			.find_map(|(index, _)| {
				let id = (2 * index + 1) as u8;
				self.negotiated.iter().find(|pctx| pctx.id == id)
			})
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextResult] {
		&self.negotiated
	}
}
