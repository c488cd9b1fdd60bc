//! The DIMSE wire layer.
//!
//! A [`DicomMessage`] is a command set followed by an optional data set,
//! fragmented over P-DATA PDUs. The SCU side lives in [`cecho`], [`cfind`],
//! [`cmove`] and [`cstore`]; [`control`] adds query normalization and
//! manufacturer quirks on top of them; [`scp`] is the server side.

pub mod association;
pub mod cecho;
pub mod cfind;
pub mod cmove;
pub mod control;
pub mod cstore;
pub mod scp;

use crate::types::{UI, US};
use association::{Association, AssociationError};
use dicom::dictionary_std::tags;
use dicom::encoding::TransferSyntaxIndex;
use dicom::object::mem::InMemElement;
use dicom::object::{InMemDicomObject, Tag};
use dicom::transfer_syntax::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::pdu::{PDataValue, PDataValueType};
use dicom::ul::Pdu;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, trace};

/// Value of [`tags::COMMAND_DATA_SET_TYPE`] announcing that a data set
/// follows the command set. For reading, prefer checking against
/// [`DATA_SET_MISSING`]: peers are free to use other truthy values.
pub const DATA_SET_EXISTS: US = 0x0102;
/// Value of [`tags::COMMAND_DATA_SET_TYPE`] for a message without data set.
pub const DATA_SET_MISSING: US = 0x0101;

// Command fields of the composite services, per PS3.7 chapter 9.
pub const COMMAND_FIELD_C_STORE_RQ: US = 0x0001;
pub const COMMAND_FIELD_C_STORE_RSP: US = 0x8001;
pub const COMMAND_FIELD_C_FIND_RQ: US = 0x0020;
pub const COMMAND_FIELD_C_FIND_RSP: US = 0x8020;
pub const COMMAND_FIELD_C_MOVE_RQ: US = 0x0021;
pub const COMMAND_FIELD_C_MOVE_RSP: US = 0x8021;
pub const COMMAND_FIELD_C_ECHO_RQ: US = 0x0030;
pub const COMMAND_FIELD_C_ECHO_RSP: US = 0x8030;

/// A DICOM message composed of a command set followed by an optional data
/// set.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/sect_6.3.html>
pub struct DicomMessage {
	pub command: InMemDicomObject,
	pub data: Option<InMemDicomObject>,
	/// Presentation context the message was received on, or should be sent
	/// on.
	pub presentation_context_id: Option<u8>,
}

impl DicomMessage {
	pub fn command_field(&self) -> Option<US> {
		self.int_element(tags::COMMAND_FIELD)
	}

	pub fn message_id(&self) -> Option<US> {
		self.int_element(tags::MESSAGE_ID)
	}

	pub fn status(&self) -> Option<US> {
		self.int_element(tags::STATUS)
	}

	pub fn int_element(&self, tag: Tag) -> Option<US> {
		self.command
			.get(tag)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
	}

	pub fn str_element(&self, tag: Tag) -> Option<String> {
		self.command
			.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|value| value.trim_end_matches('\0').trim().to_owned())
	}
}

impl std::fmt::Debug for DicomMessage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.data.is_some() {
			write!(f, "DicomMessage {{ command, data }}")
		} else {
			write!(f, "DicomMessage {{ command }}")
		}
	}
}

/// Status classes of the DIMSE services.
/// <https://dicom.nema.org/medical/dicom/current/output/chtml/part07/chapter_C.html>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusType {
	Success,
	Warning,
	Failure,
	Cancel,
	Pending,
}

impl TryFrom<US> for StatusType {
	type Error = US;

	fn try_from(value: US) -> Result<Self, Self::Error> {
		match value {
			0 => Ok(Self::Success),
			1 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => Ok(Self::Warning),
			0xA000..=0xAFFF | 0x0100..=0x01FF | 0x0200..=0x02FF | 0xC000..=0xCFFF => {
				Ok(Self::Failure)
			}
			0xFE00 => Ok(Self::Cancel),
			0xFF00 | 0xFF01 => Ok(Self::Pending),
			_ => Err(value),
		}
	}
}

pub trait DicomMessageReader {
	fn read_message(
		&self,
		timeout: Duration,
	) -> impl std::future::Future<Output = Result<DicomMessage, ReadError>> + Send;
}

pub trait DicomMessageWriter {
	fn write_message(
		&self,
		message: impl Into<DicomMessage> + Send,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> impl std::future::Future<Output = Result<(), WriteError>> + Send;
}

impl<A: Association + Sync> DicomMessageWriter for A {
	#[instrument(skip_all)]
	async fn write_message(
		&self,
		message: impl Into<DicomMessage> + Send,
		presentation_context_id: Option<u8>,
		timeout: Duration,
	) -> Result<(), WriteError> {
		let message: DicomMessage = message.into();

		let presentation_context =
			match presentation_context_id.or(message.presentation_context_id) {
				None => self.presentation_contexts().first(),
				Some(id) => self
					.presentation_contexts()
					.iter()
					.find(|pctx| pctx.id == id),
			}
			.ok_or(NegotiationError::NoPresentationContext)?;

		let mut command_buf = Vec::new();
		message
			.command
			.write_dataset_with_ts(&mut command_buf, &IMPLICIT_VR_LITTLE_ENDIAN.erased())?;

		let command_pdu = Pdu::PData {
			data: vec![PDataValue {
				value_type: PDataValueType::Command,
				presentation_context_id: presentation_context.id,
				is_last: true,
				data: command_buf,
			}],
		};
		self.send(command_pdu, timeout).await?;

		if let Some(data) = message.data {
			let transfer_syntax = TransferSyntaxRegistry
				.get(&presentation_context.transfer_syntax)
				.ok_or_else(|| {
					NegotiationError::UnknownTransferSyntax(UI::from(
						&presentation_context.transfer_syntax,
					))
				})?;
			let mut data_buf = Vec::new();
			data.write_dataset_with_ts(&mut data_buf, transfer_syntax)?;

			let data_pdu = Pdu::PData {
				data: vec![PDataValue {
					value_type: PDataValueType::Data,
					presentation_context_id: presentation_context.id,
					is_last: true,
					data: data_buf,
				}],
			};

			self.send(data_pdu, timeout).await?;
		}

		Ok(())
	}
}

impl<A: Association + Sync> DicomMessageReader for A {
	#[instrument(skip_all)]
	async fn read_message(&self, timeout: Duration) -> Result<DicomMessage, ReadError> {
		let mut command_fragments = Vec::new();
		let mut data_fragments = Vec::new();
		let mut message_command: Option<InMemDicomObject> = None;

		loop {
			let pdu = self.receive(timeout).await?;
			let Pdu::PData { data } = pdu else {
				return Err(ReadError::UnexpectedPdu(pdu));
			};

			for mut pdv in data {
				match pdv.value_type {
					PDataValueType::Command => {
						trace!("Received command fragment (last={})", pdv.is_last);
						if message_command.is_some() {
							// The command set is already complete; another
							// command fragment is out of order.
							return Err(ReadError::OutOfOrder);
						}
						command_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let command = InMemDicomObject::read_dataset_with_ts(
								command_fragments.as_slice(),
								&IMPLICIT_VR_LITTLE_ENDIAN.erased(),
							)?;
							let has_data_set = command
								.get(tags::COMMAND_DATA_SET_TYPE)
								.map(InMemElement::to_int::<US>)
								.and_then(Result::ok)
								.is_some_and(|value| value != DATA_SET_MISSING);

							if has_data_set {
								message_command = Some(command);
								command_fragments = Vec::new();
							} else {
								return Ok(DicomMessage {
									command,
									data: None,
									presentation_context_id: Some(pdv.presentation_context_id),
								});
							}
						}
					}
					PDataValueType::Data => {
						trace!("Received data fragment (last={})", pdv.is_last);
						if message_command.is_none() {
							// Data fragments before the full command set.
							return Err(ReadError::OutOfOrder);
						}
						data_fragments.append(&mut pdv.data);
						if pdv.is_last {
							let presentation_context = self
								.presentation_contexts()
								.iter()
								.find(|pctx| pctx.id == pdv.presentation_context_id)
								.ok_or(NegotiationError::NoPresentationContext)?;
							let transfer_syntax = TransferSyntaxRegistry
								.get(&presentation_context.transfer_syntax)
								.ok_or_else(|| {
									NegotiationError::UnknownTransferSyntax(UI::from(
										&presentation_context.transfer_syntax,
									))
								})?;
							let data = InMemDicomObject::read_dataset_with_ts(
								data_fragments.as_slice(),
								transfer_syntax,
							)?;

							return Ok(DicomMessage {
								command: message_command.expect("command set is complete"),
								data: Some(data),
								presentation_context_id: Some(pdv.presentation_context_id),
							});
						}
					}
				}
			}
		}
	}
}

#[derive(Debug, Error)]
pub enum ReadError {
	#[error("Failed to read DICOM object: {0}")]
	Reader(#[from] dicom::object::ReadError),
	#[error("Received unexpected PDU {0:?}")]
	UnexpectedPdu(Pdu),
	#[error("Received fragments out of order")]
	OutOfOrder,
	#[error("Failed to receive PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error("Mandatory attribute {0} is missing")]
	MissingAttribute(Tag),
}

#[derive(Debug, Error)]
pub enum WriteError {
	#[error("Failed to write DICOM object: {0}")]
	Writer(#[from] dicom::object::WriteError),
	#[error("Failed to send PDU: {0}")]
	Association(#[from] AssociationError),
	#[error(transparent)]
	Negotiation(#[from] NegotiationError),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
	#[error("Unknown transfer syntax with UID '{0}'")]
	UnknownTransferSyntax(UI),
	#[error("No accepted presentation context fits the operation")]
	NoPresentationContext,
}

/// Returns a new message id by incrementing a global counter.
pub fn next_message_id() -> US {
	static CURRENT_MSG_ID: AtomicU16 = AtomicU16::new(1);
	CURRENT_MSG_ID.fetch_add(1, Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_classes() {
		assert_eq!(StatusType::try_from(0x0000), Ok(StatusType::Success));
		assert_eq!(StatusType::try_from(0xFF00), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFF01), Ok(StatusType::Pending));
		assert_eq!(StatusType::try_from(0xFE00), Ok(StatusType::Cancel));
		assert_eq!(StatusType::try_from(0xA700), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xA900), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xC001), Ok(StatusType::Failure));
		assert_eq!(StatusType::try_from(0xB000), Ok(StatusType::Warning));
	}

	#[test]
	fn message_ids_are_distinct() {
		let first = next_message_id();
		let second = next_message_id();
		assert_ne!(first, second);
	}
}
