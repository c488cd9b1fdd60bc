//! Find service class (C-FIND), used for Q/R and modality worklist.

use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::AssociationError;
use super::{
	DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType, WriteError,
	COMMAND_FIELD_C_FIND_RQ, DATA_SET_EXISTS,
};
use crate::types::{QueryInformationModel, Priority, UI, US};
use async_stream::try_stream;
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::tags;
use dicom::object::InMemDicomObject;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// C-FIND-RQ
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_9.html#table_9.1-2>
pub struct CompositeFindRequest {
	pub message_id: US,
	pub priority: US,
	pub affected_sop_class_uid: UI,
	pub identifier: InMemDicomObject,
	pub presentation_context_id: Option<u8>,
}

impl From<CompositeFindRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeFindRequest) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_FIND_RQ])),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS]))
        ]);

        Self {
            command,
            data: Some(request.identifier),
            presentation_context_id: request.presentation_context_id,
        }
    }
}

/// C-FIND-RSP
#[derive(Debug)]
pub struct CompositeFindResponse {
	pub status: US,
	pub data: Option<InMemDicomObject>,
}

impl TryFrom<DicomMessage> for CompositeFindResponse {
	type Error = ReadError;

	fn try_from(message: DicomMessage) -> Result<Self, Self::Error> {
		let status = message
			.status()
			.ok_or(ReadError::MissingAttribute(tags::STATUS))?;

		Ok(Self {
			status,
			data: message.data,
		})
	}
}

pub struct FindServiceClassUser {
	pool: AssociationPool,
	timeout: Duration,
}

pub struct FindServiceClassUserOptions {
	pub query_information_model: QueryInformationModel,
	pub identifier: InMemDicomObject,
	pub message_id: US,
	pub priority: Priority,
}

impl FindServiceClassUser {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	/// Issues a C-FIND-RQ and yields one answer per pending response until
	/// the terminal status arrives. A terminal status that is neither
	/// success nor pending surfaces as [`FindError::Refused`].
	pub fn invoke(
		&self,
		options: FindServiceClassUserOptions,
	) -> impl Stream<Item = Result<InMemDicomObject, FindError>> + '_ {
		try_stream! {
			let association = self.pool.get(PresentationParameter::Control).await?;
			let sop_class = options.query_information_model.as_sop_class();
			let presentation_context_id = association
				.select_context(sop_class)
				.map(|pctx| pctx.id)
				.ok_or(FindError::Unavailable)?;

			let request = CompositeFindRequest {
				identifier: options.identifier,
				message_id: options.message_id,
				priority: options.priority as US,
				affected_sop_class_uid: UI::from(sop_class),
				presentation_context_id: Some(presentation_context_id),
			};
			association
				.write_message(request, Some(presentation_context_id), self.timeout)
				.await?;
			trace!("Sent C-FIND-RQ");

			loop {
				let response = association.read_message(self.timeout).await?;
				let response = CompositeFindResponse::try_from(response)?;
				trace!(status = response.status, "Received C-FIND-RSP");

				match StatusType::try_from(response.status) {
					Ok(StatusType::Pending) => {
						if let Some(data) = response.data {
							yield data;
						}
					}
					Ok(StatusType::Success) => {
						if let Some(data) = response.data {
							yield data;
						}
						break;
					}
					_ => Err(FindError::Refused {
						status: response.status,
					})?,
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum FindError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] PoolError<AssociationError>),
	#[error("The remote peer did not accept any C-FIND presentation context")]
	Unavailable,
	#[error("C-FIND was refused with status 0x{status:04X}")]
	Refused { status: US },
}
