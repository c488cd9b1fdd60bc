//! Storage service class (C-STORE), SCU side. The SCP side lives in
//! [`super::scp`].

use super::association::pool::{AssociationPool, PoolError, PresentationParameter};
use super::association::AssociationError;
use super::{
	next_message_id, DicomMessage, DicomMessageReader, DicomMessageWriter, ReadError, StatusType,
	WriteError, COMMAND_FIELD_C_STORE_RQ, COMMAND_FIELD_C_STORE_RSP, DATA_SET_EXISTS,
	DATA_SET_MISSING,
};
use crate::types::{Priority, AE, UI, US};
use dicom::core::{DataElement, VR};
use dicom::dicom_value;
use dicom::dictionary_std::{tags, uids};
use dicom::object::{FileDicomObject, InMemDicomObject};
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

/// C-STORE-RQ
pub struct CompositeStoreRequest {
	pub affected_sop_class_uid: UI,
	pub affected_sop_instance_uid: UI,
	pub move_originator_aet: Option<AE>,
	pub move_originator_message_id: Option<US>,
	pub message_id: US,
	pub priority: US,
	pub data_set: InMemDicomObject,
	pub presentation_context_id: Option<u8>,
}

impl From<CompositeStoreRequest> for DicomMessage {
	#[rustfmt::skip]
	fn from(request: CompositeStoreRequest) -> Self {
        let mut command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_STORE_RQ])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_EXISTS])),
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, request.affected_sop_class_uid)),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, request.affected_sop_instance_uid)),
            DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [request.message_id])),
            DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [request.priority])),
        ]);

        if let Some(move_originator_message_id) = request.move_originator_message_id {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_MESSAGE_ID, VR::US, dicom_value!(U16, [move_originator_message_id])));
        }

        if let Some(move_originator_aet) = request.move_originator_aet {
            command.put_element(DataElement::new(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE, VR::AE, dicom_value!(Str, move_originator_aet)));
        }

        Self {
            command,
            data: Some(request.data_set),
            presentation_context_id: request.presentation_context_id,
        }
    }
}

/// C-STORE-RSP
pub struct CompositeStoreResponse {
	pub message_id: US,
	pub sop_class_uid: UI,
	pub sop_instance_uid: UI,
	pub status: US,
	pub presentation_context_id: Option<u8>,
}

impl From<CompositeStoreResponse> for DicomMessage {
	#[rustfmt::skip]
	fn from(response: CompositeStoreResponse) -> Self {
        let command = InMemDicomObject::command_from_element_iter([
            DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, response.sop_class_uid)),
            DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_C_STORE_RSP])),
            DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [response.message_id])),
            DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [DATA_SET_MISSING])),
            DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [response.status])),
            DataElement::new(tags::AFFECTED_SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, response.sop_instance_uid))
        ]);

        Self {
            command,
            data: None,
            presentation_context_id: response.presentation_context_id,
        }
    }
}

/// The move-originator fields echoed into C-STORE sub-operations so the
/// move SCU can correlate the stores with its request.
#[derive(Debug, Clone)]
pub struct MoveOriginator {
	pub aet: AE,
	pub message_id: US,
}

pub struct StoreServiceClassUser {
	pool: AssociationPool,
	timeout: Duration,
}

impl StoreServiceClassUser {
	pub const fn new(pool: AssociationPool, timeout: Duration) -> Self {
		Self { pool, timeout }
	}

	/// Sends one instance. The presentation context proposes the file's own
	/// transfer syntax next to Implicit VR Little Endian; the accepted
	/// syntax decides the encoding on the wire.
	pub async fn store(
		&self,
		file: FileDicomObject<InMemDicomObject>,
		originator: Option<&MoveOriginator>,
	) -> Result<(), StoreError> {
		let sop_class_uid = UI::from(
			file.meta()
				.media_storage_sop_class_uid()
				.trim_end_matches('\0'),
		);
		let sop_instance_uid = UI::from(
			file.meta()
				.media_storage_sop_instance_uid()
				.trim_end_matches('\0'),
		);
		let file_transfer_syntax = UI::from(file.meta().transfer_syntax().trim_end_matches('\0'));

		let mut transfer_syntax_uids = vec![file_transfer_syntax];
		let implicit = UI::from(uids::IMPLICIT_VR_LITTLE_ENDIAN);
		if !transfer_syntax_uids.contains(&implicit) {
			transfer_syntax_uids.push(implicit);
		}

		let association = self
			.pool
			.get(PresentationParameter::Store {
				sop_class_uid: sop_class_uid.clone(),
				transfer_syntax_uids,
			})
			.await?;

		let presentation_context_id = association
			.select_context(&sop_class_uid)
			.map(|pctx| pctx.id)
			.ok_or(StoreError::Unavailable)?;

		let request = CompositeStoreRequest {
			affected_sop_class_uid: sop_class_uid,
			affected_sop_instance_uid: sop_instance_uid,
			priority: Priority::Medium as US,
			message_id: next_message_id(),
			move_originator_aet: originator.map(|o| o.aet.clone()),
			move_originator_message_id: originator.map(|o| o.message_id),
			data_set: file.into_inner(),
			presentation_context_id: Some(presentation_context_id),
		};

		association
			.write_message(request, Some(presentation_context_id), self.timeout)
			.await?;
		trace!("Sent C-STORE-RQ");

		let response = association.read_message(self.timeout).await?;
		let status = response.status().unwrap_or(0xC000);
		match StatusType::try_from(status) {
			Ok(StatusType::Success | StatusType::Warning) => Ok(()),
			_ => Err(StoreError::Refused { status }),
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error(transparent)]
	Read(#[from] ReadError),
	#[error(transparent)]
	Write(#[from] WriteError),
	#[error(transparent)]
	Association(#[from] PoolError<AssociationError>),
	#[error("The remote peer did not accept any storage presentation context")]
	Unavailable,
	#[error("C-STORE was refused with status 0x{status:04X}")]
	Refused { status: US },
}
