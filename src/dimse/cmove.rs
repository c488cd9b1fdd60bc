//! Move service class (C-MOVE), SCU side.

use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::AssociationError;
use super::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
	COMMAND_FIELD_C_MOVE_RQ, DATA_SET_EXISTS,
};
use crate::types::{AE, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::InMemDicomObject;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, trace};

/// C-MOVE-RQ
pub struct CompositeMoveRequest {
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: US,
	pub destination: AE,
	pub presentation_context_id: Option<u8>,
}

impl From<CompositeMoveRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeMoveRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_MOVE_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
            DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, request.destination)),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
        ]);

        Self {
            command,
            data: Some(request.identifier),
            presentation_context_id: request.presentation_context_id,
        }
    }
}

pub struct MoveServiceClassUser {
	pool: AssociationPool,
	timeout: Duration,
}

impl MoveServiceClassUser {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	/// Issues a C-MOVE-RQ and drains the responses. Pending responses carry
	/// sub-operation counters; the terminal status decides the outcome.
	#[instrument(skip_all, name = "MOVE-SCU")]
	pub async fn invoke(&self, mut request: CompositeMoveRequest) -> Result<(), MoveError> {
		let association = self.pool.get(PresentationParameter::Control).await?;
		let presentation_context_id = association
			.select_context(uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE)
			.map(|pctx| pctx.id)
			.ok_or(MoveError::Unavailable)?;
		request.presentation_context_id = Some(presentation_context_id);

		association
			.write_message(request, Some(presentation_context_id), self.timeout)
			.await?;
		trace!("Sent C-MOVE-RQ");

		loop {
			let response = association.read_message(self.timeout).await?;
			let status = response.status().unwrap_or(0xC000);
			trace!(status, "Received C-MOVE-RSP");

			match StatusType::try_from(status).unwrap_or(StatusType::Failure) {
				StatusType::Success => {
					let completed = response
						.int_element(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS)
						.unwrap_or(0);
					info!(completed, "C-MOVE completed successfully");
					return Ok(());
				}
				StatusType::Pending => {
					let remaining = response
						.int_element(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
						.unwrap_or(0);
					trace!(remaining, "C-MOVE is pending");
				}
				StatusType::Cancel => return Err(MoveError::Cancelled),
				StatusType::Failure | StatusType::Warning => {
					return Err(MoveError::Refused { status });
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum MoveError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] PoolError<AssociationError>),
	#[error("The remote peer did not accept any C-MOVE presentation context")]
	Unavailable,
	#[error("C-MOVE terminated with status 0x{status:04X}")]
	Refused { status: US },
	#[error("C-MOVE operation was canceled")]
	Cancelled,
}
