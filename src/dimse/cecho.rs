//! Verification service class (C-ECHO).

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use super::association::client::ClientAssociation;
use super::{
	next_message_id, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	WriteError, COMMAND_FIELD_C_ECHO_RQ, DATA_SET_MISSING,
};
use crate::types::US;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;

/// C-ECHO-RQ
#[derive(Debug)]
pub struct CompositeEchoRequest {
	pub message_id: US,
	pub presentation_context_id: Option<u8>,
}

impl From<CompositeEchoRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeEchoRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_ECHO_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING]))
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: request.presentation_context_id,
        }
    }
}

/// C-ECHO-RSP
#[derive(Debug)]
pub struct CompositeEchoResponse {
	pub status: US,
}

impl TryFrom<DicomMessage> for CompositeEchoResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.status()
			.ok_or(Self::Error::MissingAttribute(tags::STATUS))?;
		Ok(Self { status })
	}
}

/// Sends a C-ECHO-RQ and waits for the C-ECHO-RSP. The response carries the
/// status that indicates the health of the connection.
pub struct EchoServiceClassUser<'a> {
	association: &'a ClientAssociation,
}

impl<'a> EchoServiceClassUser<'a> {
	pub const fn new(association: &'a ClientAssociation) -> Self {
		Self { association }
	}

	/// Initiates the C-ECHO protocol.
	#[instrument(skip_all)]
	pub async fn echo(&self, timeout: Duration) -> Result<bool, EchoError> {
		trace!("Initiated C-ECHO protocol");
		let presentation_context_id = self
			.association
			.select_context(uids::VERIFICATION)
			.map(|pctx| pctx.id);

		let request = CompositeEchoRequest {
			message_id: next_message_id(),
			presentation_context_id,
		};
		self.association
			.write_message(request, presentation_context_id, timeout)
			.await?;

		let response = self.association.read_message(timeout).await?;
		let response = CompositeEchoResponse::try_from(response)?;

		let status_type = StatusType::try_from(response.status).unwrap_or(StatusType::Failure);

		debug!(
			status = response.status,
			"Received C-ECHO-RSP ({status_type:?})"
		);
		Ok(status_type == StatusType::Success)
	}
}

/// Errors that can occur for the echoscu.
#[derive(Debug, Error)]
pub enum EchoError {
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Read(#[from] ReadError),
}
