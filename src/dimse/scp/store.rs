//! SCP side of C-STORE: admits inbound instances through the server
//! context.

use super::ScpState;
use crate::context::StoreStatus;
use crate::dimse::association::server::ServerAssociation;
use crate::dimse::association::Association;
use crate::dimse::cstore::CompositeStoreResponse;
use crate::dimse::{DicomMessage, DicomMessageWriter};
use crate::toolkit;
use crate::types::{UI, US};
use anyhow::Context;
use dicom::dictionary_std::tags;
use dicom::object::FileMetaTableBuilder;
use tracing::{debug, warn};

pub async fn handle(
	association: &ServerAssociation,
	message: DicomMessage,
	state: &ScpState,
) -> anyhow::Result<()> {
	let presentation_context_id = message.presentation_context_id;
	let pctx = association
		.presentation_contexts()
		.iter()
		.find(|pctx| Some(pctx.id) == presentation_context_id)
		.or_else(|| association.presentation_contexts().first())
		.context("No presentation context available")?;

	let message_id = message.message_id().unwrap_or(0);
	let sop_class_uid = message
		.str_element(tags::AFFECTED_SOP_CLASS_UID)
		.context("Missing tag AFFECTED_SOP_CLASS_UID (0000,0002)")?;
	let sop_instance_uid = message
		.str_element(tags::AFFECTED_SOP_INSTANCE_UID)
		.context("Missing tag AFFECTED_SOP_INSTANCE_UID (0000,1000)")?;

	debug!("Received instance {sop_instance_uid} ({sop_class_uid})");

	let status = match message.data {
		None => {
			warn!("C-STORE-RQ without a data set");
			0xC000
		}
		Some(data) => {
			let file = data.with_exact_meta(
				FileMetaTableBuilder::new()
					.media_storage_sop_class_uid(sop_class_uid.as_str())
					.media_storage_sop_instance_uid(sop_instance_uid.as_str())
					.transfer_syntax(&pctx.transfer_syntax)
					.build()
					.expect("FileMetaTableBuilder should contain required data"),
			);

			match toolkit::write_file(&file)
				.and_then(|bytes| state.context.store(&bytes, association.calling_aet()))
			{
				Ok(outcome) => dimse_status(outcome.status),
				Err(err) => {
					// Errors never cross the DIMSE boundary.
					warn!("Admission of {sop_instance_uid} failed: {err}");
					0xC000
				}
			}
		}
	};

	let response = CompositeStoreResponse {
		message_id,
		sop_class_uid: UI::from(sop_class_uid),
		sop_instance_uid: UI::from(sop_instance_uid),
		status,
		presentation_context_id,
	};
	association
		.write_message(response, presentation_context_id, state.response_timeout())
		.await?;

	Ok(())
}

/// Maps the admission outcome to the C-STORE-RSP status. A filtered-out
/// instance is acknowledged and silently discarded.
const fn dimse_status(status: StoreStatus) -> US {
	match status {
		StoreStatus::Success | StoreStatus::AlreadyStored | StoreStatus::FilteredOut => 0x0000,
		// Refused: out of resources.
		StoreStatus::FullStorage => 0xA700,
		StoreStatus::Failure => 0xC000,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_mapping() {
		assert_eq!(dimse_status(StoreStatus::Success), 0x0000);
		assert_eq!(dimse_status(StoreStatus::AlreadyStored), 0x0000);
		assert_eq!(dimse_status(StoreStatus::FilteredOut), 0x0000);
		assert_eq!(dimse_status(StoreStatus::FullStorage), 0xA700);
		assert_eq!(dimse_status(StoreStatus::Failure), 0xC000);
	}
}
