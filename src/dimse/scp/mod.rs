//! DICOM SCP: one listener thread accepting associations, one task per
//! association dispatching inbound DIMSE requests to the index and the
//! jobs engine.

pub mod find;
pub mod move_request;
pub mod store;

use super::association::server::{ServerAssociation, ServerAssociationOptions};
use super::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, COMMAND_FIELD_C_ECHO_RQ,
	COMMAND_FIELD_C_ECHO_RSP, COMMAND_FIELD_C_FIND_RQ, COMMAND_FIELD_C_MOVE_RQ,
	COMMAND_FIELD_C_STORE_RQ, DATA_SET_MISSING,
};
use crate::config::AppConfig;
use crate::context::ServerContext;
use crate::dimse::association::pool::AssociationPools;
use crate::jobs::JobsEngine;
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, instrument, warn};

/// Shared state of every SCP handler.
#[derive(Clone)]
pub struct ScpState {
	pub context: ServerContext,
	pub jobs: JobsEngine,
	pub pools: AssociationPools,
	pub config: Arc<AppConfig>,
}

impl ScpState {
	/// Deadline for writing responses back to the peer. A configured value
	/// of zero selects blocking writes.
	pub fn response_timeout(&self) -> Duration {
		match self.config.server.dimse.timeout {
			0 => Duration::MAX,
			millis => Duration::from_millis(millis),
		}
	}
}

pub struct DimseServer {
	state: ScpState,
}

impl DimseServer {
	pub fn new(state: ScpState) -> Self {
		Self { state }
	}

	/// Runs the listener loop. Never returns under normal operation.
	#[instrument(skip_all, name = "DIMSE-SCP")]
	pub async fn spawn(&self) -> anyhow::Result<()> {
		let dimse = &self.state.config.server.dimse;
		let address = SocketAddr::from((dimse.interface, dimse.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started DICOM server on {address}");

		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					info!("Accepted incoming association from {peer}");
					let state = self.state.clone();
					tokio::spawn(async move {
						if let Err(err) = process(stream, state).await {
							warn!("Association with {peer} ended: {err}");
						}
					});
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			}
		}
	}
}

async fn process(stream: TcpStream, state: ScpState) -> anyhow::Result<()> {
	let tcp_stream = stream.into_std()?;
	// `dicom-ul` drives the socket with blocking reads on its own thread.
	tcp_stream.set_nonblocking(false)?;

	let options = ServerAssociationOptions {
		aet: state.config.server.aet.clone(),
		tcp_stream,
		uncompressed: state.config.server.dimse.uncompressed,
	};
	let association = ServerAssociation::new(options).await?;

	// Associations stay open until the peer releases or aborts them.
	while let Ok(message) = association.read_message(Duration::MAX).await {
		let Some(command_field) = message.command_field() else {
			warn!("Dropping DIMSE message without a command field");
			break;
		};

		let result = match command_field {
			COMMAND_FIELD_C_ECHO_RQ => handle_echo(&association, &message, &state).await,
			COMMAND_FIELD_C_STORE_RQ => store::handle(&association, message, &state).await,
			COMMAND_FIELD_C_FIND_RQ => find::handle(&association, message, &state).await,
			COMMAND_FIELD_C_MOVE_RQ => move_request::handle(&association, message, &state).await,
			other => {
				warn!("Unsupported DIMSE command field 0x{other:04X}");
				break;
			}
		};

		if let Err(err) = result {
			warn!("DIMSE request failed: {err}");
			break;
		}
	}

	Ok(())
}

/// C-ECHO-RSP
struct EchoResponse {
	message_id: US,
	presentation_context_id: Option<u8>,
}

impl From<EchoResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: EchoResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_ECHO_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: response.presentation_context_id,
        }
    }
}

async fn handle_echo(
	association: &ServerAssociation,
	message: &DicomMessage,
	state: &ScpState,
) -> anyhow::Result<()> {
	let response = EchoResponse {
		message_id: message.message_id().unwrap_or(0),
		presentation_context_id: message.presentation_context_id,
	};
	association
		.write_message(
			response,
			message.presentation_context_id,
			state.response_timeout(),
		)
		.await?;
	Ok(())
}
