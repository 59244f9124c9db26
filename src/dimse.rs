//! DIMSE message framing over P-DATA-TF.
//!
//! Command sets always travel in Implicit VR Little Endian; data sets use the
//! transfer syntax negotiated for their presentation context.

use dicom::core::{DataElement, Tag, VR, dicom_value};
use dicom::encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom::object::InMemDicomObject;
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom_dictionary_std::{tags, uids};
use dicom_ul::pdu::{PDataValue, PDataValueType, Pdu};
use thiserror::Error;

pub const C_STORE_RQ: u16 = 0x0001;
pub const C_STORE_RSP: u16 = 0x8001;
pub const C_FIND_RQ: u16 = 0x0020;
pub const C_FIND_RSP: u16 = 0x8020;
pub const C_MOVE_RQ: u16 = 0x0021;
pub const C_MOVE_RSP: u16 = 0x8021;
pub const C_ECHO_RQ: u16 = 0x0030;
pub const C_ECHO_RSP: u16 = 0x8030;

pub const STATUS_SUCCESS: u16 = 0x0000;
pub const STATUS_PENDING: u16 = 0xFF00;
pub const STATUS_PENDING_WARNING: u16 = 0xFF01;
/// Generic "cannot understand" failure used for failed stores.
pub const STATUS_PROCESSING_FAILURE: u16 = 0xC000;

/// CommandDataSetType value announcing that no data set follows.
pub const NO_DATA_SET: u16 = 0x0101;
const DATA_SET_PRESENT: u16 = 0x0000;

const PRIORITY_MEDIUM: u16 = 0x0000;

pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16384;
/// Item length, context ID and message control header of a PDV.
const PDV_HEADER_LENGTH: u32 = 6;

#[derive(Debug, Error)]
pub enum DimseError {
    #[error("Unsupported transfer syntax {0}")]
    UnsupportedTransferSyntax(String),

    #[error("Could not decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error("Could not encode {what}: {message}")]
    Encode { what: &'static str, message: String },

    #[error("Command set has no CommandField")]
    MissingCommandField,

    #[error("PDV for presentation context {found} interleaved with context {expected}")]
    ContextMismatch { expected: u8, found: u8 },
}

/// Looks up a transfer syntax by UID, ignoring padding.
pub fn transfer_syntax(uid: &str) -> Result<&'static TransferSyntax, DimseError> {
    let uid = uid.trim_end_matches(['\0', ' ']);
    TransferSyntaxRegistry
        .get(uid)
        .ok_or_else(|| DimseError::UnsupportedTransferSyntax(uid.to_string()))
}

/// One complete DIMSE message.
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: InMemDicomObject,
    /// Encoded data set, if the command announced one.
    pub data: Option<Vec<u8>>,
}

impl DimseMessage {
    pub fn command_field(&self) -> Option<u16> {
        command_u16(&self.command, tags::COMMAND_FIELD)
    }

    pub fn message_id(&self) -> u16 {
        command_u16(&self.command, tags::MESSAGE_ID)
            .or_else(|| command_u16(&self.command, tags::MESSAGE_ID_BEING_RESPONDED_TO))
            .unwrap_or(0)
    }

    pub fn status(&self) -> Option<u16> {
        command_u16(&self.command, tags::STATUS)
    }

    pub fn command_text(&self, tag: Tag) -> Option<String> {
        crate::tags::attribute_text(&self.command, tag)
    }

    /// Decodes the data set with the transfer syntax `ts_uid`.
    pub fn decode_data(&self, ts_uid: &str) -> Result<Option<InMemDicomObject>, DimseError> {
        let Some(data) = &self.data else {
            return Ok(None);
        };
        let ts = transfer_syntax(ts_uid)?;
        InMemDicomObject::read_dataset_with_ts(data.as_slice(), ts)
            .map(Some)
            .map_err(|err| DimseError::Decode {
                what: "data set",
                message: err.to_string(),
            })
    }
}

fn command_u16(command: &InMemDicomObject, tag: Tag) -> Option<u16> {
    command.element(tag).ok()?.to_int::<u16>().ok()
}

/// Collects PDV fragments until a whole message is available.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    presentation_context_id: Option<u8>,
    command_bytes: Vec<u8>,
    command: Option<InMemDicomObject>,
    data_bytes: Vec<u8>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one PDV. Returns the message once its last fragment arrived.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<DimseMessage>, DimseError> {
        match self.presentation_context_id {
            Some(expected) if expected != pdv.presentation_context_id => {
                return Err(DimseError::ContextMismatch {
                    expected,
                    found: pdv.presentation_context_id,
                });
            }
            _ => self.presentation_context_id = Some(pdv.presentation_context_id),
        }

        match pdv.value_type {
            PDataValueType::Command => {
                self.command_bytes.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let command = decode_command(&self.command_bytes)?;
                let has_data = command_u16(&command, tags::COMMAND_DATA_SET_TYPE)
                    .is_some_and(|kind| kind != NO_DATA_SET);
                if command_u16(&command, tags::COMMAND_FIELD).is_none() {
                    return Err(DimseError::MissingCommandField);
                }
                if has_data {
                    self.command = Some(command);
                    return Ok(None);
                }
                Ok(Some(self.finish(command, None)))
            }
            PDataValueType::Data => {
                self.data_bytes.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                match self.command.take() {
                    Some(command) => {
                        let data = std::mem::take(&mut self.data_bytes);
                        Ok(Some(self.finish(command, Some(data))))
                    }
                    None => Err(DimseError::Decode {
                        what: "data set",
                        message: "received before its command".to_string(),
                    }),
                }
            }
        }
    }

    /// Command of a message whose data set has not arrived yet.
    pub fn pending_command(&self) -> Option<&InMemDicomObject> {
        self.command.as_ref()
    }

    /// Completes the pending message without a buffered data set, for data
    /// that was consumed as it arrived.
    pub fn take_pending(&mut self) -> Option<DimseMessage> {
        let command = self.command.take()?;
        Some(self.finish(command, None))
    }

    fn finish(&mut self, command: InMemDicomObject, data: Option<Vec<u8>>) -> DimseMessage {
        let presentation_context_id = self.presentation_context_id.take().unwrap_or_default();
        self.command_bytes.clear();
        self.data_bytes.clear();
        DimseMessage {
            presentation_context_id,
            command,
            data,
        }
    }
}

fn decode_command(bytes: &[u8]) -> Result<InMemDicomObject, DimseError> {
    let ts = transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)?;
    InMemDicomObject::read_dataset_with_ts(bytes, ts).map_err(|err| DimseError::Decode {
        what: "command set",
        message: err.to_string(),
    })
}

/// Encodes a command set in Implicit VR Little Endian.
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>, DimseError> {
    encode_dataset(command, uids::IMPLICIT_VR_LITTLE_ENDIAN, "command set")
}

/// Encodes a data set in the transfer syntax `ts_uid`.
pub fn encode_data(data: &InMemDicomObject, ts_uid: &str) -> Result<Vec<u8>, DimseError> {
    encode_dataset(data, ts_uid, "data set")
}

fn encode_dataset(
    dicom_object: &InMemDicomObject,
    ts_uid: &str,
    what: &'static str,
) -> Result<Vec<u8>, DimseError> {
    let ts = transfer_syntax(ts_uid)?;
    let mut bytes = Vec::new();
    dicom_object
        .write_dataset_with_ts(&mut bytes, ts)
        .map_err(|err| DimseError::Encode {
            what,
            message: err.to_string(),
        })?;
    Ok(bytes)
}

/// Splits one encoded command or data set into P-DATA-TF PDUs that respect
/// the peer's maximum PDU length (0 means unlimited).
pub fn pdata_pdus(
    presentation_context_id: u8,
    value_type: PDataValueType,
    bytes: &[u8],
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let max_pdu_length = if max_pdu_length == 0 {
        u32::MAX
    } else {
        max_pdu_length
    };
    let chunk_len = max_pdu_length.saturating_sub(PDV_HEADER_LENGTH).max(1) as usize;

    if bytes.is_empty() {
        return vec![Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        }];
    }

    let chunk_count = bytes.len().div_ceil(chunk_len);
    bytes
        .chunks(chunk_len)
        .enumerate()
        .map(|(index, chunk)| Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type: value_type.clone(),
                is_last: index + 1 == chunk_count,
                data: chunk.to_vec(),
            }],
        })
        .collect()
}

/// Encodes a whole message (command plus optional data set) into PDUs.
pub fn message_pdus(
    presentation_context_id: u8,
    command: &InMemDicomObject,
    data: Option<&[u8]>,
    max_pdu_length: u32,
) -> Result<Vec<Pdu>, DimseError> {
    let mut pdus = pdata_pdus(
        presentation_context_id,
        PDataValueType::Command,
        &encode_command(command)?,
        max_pdu_length,
    );
    if let Some(data) = data {
        pdus.extend(pdata_pdus(
            presentation_context_id,
            PDataValueType::Data,
            data,
            max_pdu_length,
        ));
    }
    Ok(pdus)
}

fn data_set_type(has_data: bool) -> u16 {
    if has_data { DATA_SET_PRESENT } else { NO_DATA_SET }
}

pub fn c_echo_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type(false)]),
        ),
    ])
}

pub fn c_echo_rsp(message_id: u16, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::VERIFICATION),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_ECHO_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type(false)]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ])
}

pub fn c_store_rq(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type(true)]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

pub fn c_store_rsp(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_STORE_RSP])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type(false)]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

pub fn c_find_rq(message_id: u16, sop_class_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_FIND_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type(true)]),
        ),
    ])
}

pub fn c_move_rq(message_id: u16, sop_class_uid: &str, move_destination: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [C_MOVE_RQ])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [PRIORITY_MEDIUM])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type(true)]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, move_destination),
        ),
    ])
}

/// Pending statuses keep a C-FIND or C-MOVE exchange going.
pub fn is_pending(status: u16) -> bool {
    matches!(status, STATUS_PENDING | STATUS_PENDING_WARNING)
}
