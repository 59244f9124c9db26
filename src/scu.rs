//! Single-shot outbound operations. Each call opens its own association,
//! performs one exchange and releases. Nothing is retried.

use crate::config::PeerConfig;
use crate::dimse::{self, DimseError, DimseMessage, MessageAssembler};
use crate::tags::attribute_text;

use dicom::core::{DataElement, PrimitiveValue, VR, dicom_value};
use dicom::object::{InMemDicomObject, open_file};
use dicom_dictionary_std::{tags, uids};
use dicom_ul::association::client::{ClientAssociation, ClientAssociationOptions};
use dicom_ul::pdu::{Pdu, PresentationContextResultReason};
use std::{collections::VecDeque, fmt, net::TcpStream, path::Path};
use thiserror::Error;
use tracing::{debug, info, warn};

const MESSAGE_ID: u16 = 1;

#[derive(Debug, Error)]
pub enum ScuError {
    #[error("Association error: {0}")]
    Association(String),

    #[error("No presentation context accepted for {0}")]
    NoAcceptedContext(String),

    #[error(transparent)]
    Dimse(#[from] DimseError),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),

    #[error("Peer aborted the association")]
    Aborted,

    #[error("Unexpected PDU: {0}")]
    UnexpectedPdu(String),
}

fn association_error(err: impl fmt::Display) -> ScuError {
    ScuError::Association(err.to_string())
}

/// Queues DIMSE messages as their PDUs come in. A single P-DATA-TF may
/// complete more than one message.
#[derive(Default)]
struct ResponseReader {
    assembler: MessageAssembler,
    ready: VecDeque<DimseMessage>,
}

impl ResponseReader {
    fn feed(&mut self, pdu: Pdu) -> Result<(), ScuError> {
        match pdu {
            Pdu::PData { data } => {
                for value in data {
                    if let Some(message) = self.assembler.push(value)? {
                        self.ready.push_back(message);
                    }
                }
                Ok(())
            }
            Pdu::AbortRQ { .. } => Err(ScuError::Aborted),
            other => Err(ScuError::UnexpectedPdu(format!("{other:?}"))),
        }
    }

    fn pop(&mut self) -> Option<DimseMessage> {
        self.ready.pop_front()
    }
}

/// Opens an association proposing one presentation context and yields the
/// accepted `(context id, transfer syntax)`.
fn establish(
    peer: &PeerConfig,
    abstract_syntax: &str,
    transfer_syntaxes: Vec<String>,
) -> Result<(ClientAssociation<TcpStream>, u8, String), ScuError> {
    let association = ClientAssociationOptions::new()
        .with_presentation_context(abstract_syntax.to_string(), transfer_syntaxes)
        .calling_ae_title(peer.calling_ae_title.as_str())
        .called_ae_title(peer.ae_title.as_str())
        .establish(peer.address())
        .map_err(association_error)?;
    let accepted = association
        .presentation_contexts()
        .iter()
        .find(|context| context.reason == PresentationContextResultReason::Acceptance)
        .map(|context| (context.id, context.transfer_syntax.to_string()));
    match accepted {
        Some((id, transfer_syntax)) => Ok((association, id, transfer_syntax)),
        None => {
            let _ = association.abort();
            Err(ScuError::NoAcceptedContext(abstract_syntax.to_string()))
        }
    }
}

/// Sends PDUs in order.
fn send_all(
    association: &mut ClientAssociation<TcpStream>,
    pdus: impl IntoIterator<Item = Pdu>,
) -> Result<(), ScuError> {
    for pdu in pdus {
        association.send(&pdu).map_err(association_error)?;
    }
    Ok(())
}

/// Blocks until the next complete DIMSE message arrives.
fn next_message(
    association: &mut ClientAssociation<TcpStream>,
    reader: &mut ResponseReader,
) -> Result<DimseMessage, ScuError> {
    loop {
        if let Some(message) = reader.pop() {
            return Ok(message);
        }
        let pdu = association.receive().map_err(association_error)?;
        reader.feed(pdu)?;
    }
}

/// C-ECHO. Returns the response status.
pub fn echo(peer: &PeerConfig) -> Result<u16, ScuError> {
    let (mut association, context_id, _) = establish(
        peer,
        uids::VERIFICATION,
        vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()],
    )?;
    let max_pdu_length = association.acceptor_max_pdu_length();
    send_all(
        &mut association,
        dimse::message_pdus(context_id, &dimse::c_echo_rq(MESSAGE_ID), None, max_pdu_length)?,
    )?;

    let mut reader = ResponseReader::default();
    let response = next_message(&mut association, &mut reader)?;
    association.release().map_err(association_error)?;

    let status = response.status().unwrap_or(dimse::STATUS_PROCESSING_FAILURE);
    info!("C-ECHO to {} returned status 0x{status:04X}", peer.ae_title);
    Ok(status)
}

/// C-STORE of one file. Returns the response status.
///
/// The file's own transfer syntax is proposed first; uncompressed files may
/// also be sent re-encoded in Explicit or Implicit VR Little Endian.
pub fn store_file(peer: &PeerConfig, path: impl AsRef<Path>) -> Result<u16, ScuError> {
    let path = path.as_ref();
    let file = open_file(path)?;
    let sop_class_uid = file.meta().media_storage_sop_class_uid().to_string();
    let sop_instance_uid = file.meta().media_storage_sop_instance_uid().to_string();
    let file_transfer_syntax = file.meta().transfer_syntax().to_string();

    let mut transfer_syntaxes = vec![file_transfer_syntax.clone()];
    let native = [
        uids::EXPLICIT_VR_LITTLE_ENDIAN,
        uids::IMPLICIT_VR_LITTLE_ENDIAN,
        uids::EXPLICIT_VR_BIG_ENDIAN,
    ];
    if native.contains(&file_transfer_syntax.as_str()) {
        transfer_syntaxes.extend(
            native[..2]
                .iter()
                .filter(|ts| **ts != file_transfer_syntax)
                .map(|ts| ts.to_string()),
        );
    }

    let (mut association, context_id, transfer_syntax) =
        establish(peer, &sop_class_uid, transfer_syntaxes)?;
    debug!("Sending {} as {transfer_syntax}", path.display());
    let data = dimse::encode_data(&file, &transfer_syntax)?;
    let command = dimse::c_store_rq(MESSAGE_ID, &sop_class_uid, &sop_instance_uid);
    let max_pdu_length = association.acceptor_max_pdu_length();
    send_all(
        &mut association,
        dimse::message_pdus(context_id, &command, Some(&data), max_pdu_length)?,
    )?;

    let mut reader = ResponseReader::default();
    let response = next_message(&mut association, &mut reader)?;
    association.release().map_err(association_error)?;

    let status = response.status().unwrap_or(dimse::STATUS_PROCESSING_FAILURE);
    if status == dimse::STATUS_SUCCESS {
        info!("Stored {} ({sop_instance_uid})", path.display());
    } else {
        warn!("C-STORE of {} returned status 0x{status:04X}", path.display());
    }
    Ok(status)
}

/// Matching keys of a study-level C-FIND. Absent keys match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudyQuery {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_instance_uid: Option<String>,
}

impl StudyQuery {
    fn identifier(&self) -> InMemDicomObject {
        let key = |value: &Option<String>| match value {
            Some(value) => PrimitiveValue::from(value.as_str()),
            None => PrimitiveValue::Empty,
        };
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
            DataElement::new(tags::PATIENT_ID, VR::LO, key(&self.patient_id)),
            DataElement::new(tags::PATIENT_NAME, VR::PN, key(&self.patient_name)),
            DataElement::new(tags::STUDY_DATE, VR::DA, PrimitiveValue::Empty),
            DataElement::new(tags::STUDY_TIME, VR::TM, PrimitiveValue::Empty),
            DataElement::new(tags::ACCESSION_NUMBER, VR::SH, PrimitiveValue::Empty),
            DataElement::new(tags::MODALITIES_IN_STUDY, VR::CS, PrimitiveValue::Empty),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, key(&self.study_instance_uid)),
        ])
    }
}

/// One C-FIND match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StudySummary {
    pub patient_id: String,
    pub patient_name: String,
    pub study_time: String,
    pub accession_number: String,
    pub modalities_in_study: String,
    pub study_instance_uid: String,
}

impl StudySummary {
    pub fn from_identifier(identifier: &InMemDicomObject) -> Self {
        let text = |tag| attribute_text(identifier, tag).unwrap_or_default();
        Self {
            patient_id: text(tags::PATIENT_ID),
            patient_name: text(tags::PATIENT_NAME),
            study_time: text(tags::STUDY_TIME),
            accession_number: text(tags::ACCESSION_NUMBER),
            modalities_in_study: text(tags::MODALITIES_IN_STUDY),
            study_instance_uid: text(tags::STUDY_INSTANCE_UID),
        }
    }
}

impl fmt::Display for StudySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PatientID: {}", self.patient_id)?;
        writeln!(f, "PatientName: {}", self.patient_name)?;
        writeln!(f, "StudyTime: {}", self.study_time)?;
        writeln!(f, "AccessionNumber: {}", self.accession_number)?;
        writeln!(f, "ModalitiesInStudy: {}", self.modalities_in_study)?;
        write!(f, "StudyInstanceUID: {}", self.study_instance_uid)
    }
}

/// Study-root C-FIND. `on_match` runs once per pending response; returns the
/// final status.
pub fn find_studies(
    peer: &PeerConfig,
    query: &StudyQuery,
    mut on_match: impl FnMut(StudySummary),
) -> Result<u16, ScuError> {
    let (mut association, context_id, transfer_syntax) = establish(
        peer,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        vec![
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        ],
    )?;
    let data = dimse::encode_data(&query.identifier(), &transfer_syntax)?;
    let command = dimse::c_find_rq(
        MESSAGE_ID,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
    );
    let max_pdu_length = association.acceptor_max_pdu_length();
    send_all(
        &mut association,
        dimse::message_pdus(context_id, &command, Some(&data), max_pdu_length)?,
    )?;

    let mut reader = ResponseReader::default();
    let mut matches = 0;
    let status = loop {
        let response = next_message(&mut association, &mut reader)?;
        let status = response.status().unwrap_or(dimse::STATUS_PROCESSING_FAILURE);
        if !dimse::is_pending(status) {
            break status;
        }
        if let Some(identifier) = response.decode_data(&transfer_syntax)? {
            matches += 1;
            on_match(StudySummary::from_identifier(&identifier));
        }
    };
    association.release().map_err(association_error)?;

    info!("C-FIND returned {matches} studies, status 0x{status:04X}");
    Ok(status)
}

/// Sub-operation counters of a finished C-MOVE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveOutcome {
    pub status: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

/// Study-root C-MOVE of one study to `destination` AE.
pub fn move_study(
    peer: &PeerConfig,
    study_instance_uid: &str,
    destination: &str,
) -> Result<MoveOutcome, ScuError> {
    let (mut association, context_id, transfer_syntax) = establish(
        peer,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        vec![
            uids::EXPLICIT_VR_LITTLE_ENDIAN.to_string(),
            uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
        ],
    )?;
    let identifier = InMemDicomObject::from_element_iter([
        DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, study_instance_uid),
        ),
    ]);
    let data = dimse::encode_data(&identifier, &transfer_syntax)?;
    let command = dimse::c_move_rq(
        MESSAGE_ID,
        uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        destination,
    );
    let max_pdu_length = association.acceptor_max_pdu_length();
    send_all(
        &mut association,
        dimse::message_pdus(context_id, &command, Some(&data), max_pdu_length)?,
    )?;

    let mut reader = ResponseReader::default();
    let outcome = loop {
        let response = next_message(&mut association, &mut reader)?;
        let counter = |tag| {
            response
                .command
                .element(tag)
                .ok()
                .and_then(|element| element.to_int::<u16>().ok())
                .unwrap_or(0)
        };
        let outcome = MoveOutcome {
            status: response.status().unwrap_or(dimse::STATUS_PROCESSING_FAILURE),
            completed: counter(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: counter(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: counter(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
        };
        if !dimse::is_pending(outcome.status) {
            break outcome;
        }
        debug!(
            "C-MOVE pending: {} completed, {} remaining",
            outcome.completed,
            counter(tags::NUMBER_OF_REMAINING_SUBOPERATIONS)
        );
    };
    association.release().map_err(association_error)?;

    info!(
        "C-MOVE of {study_instance_uid} to {destination}: status 0x{:04X}, {} completed, {} failed",
        outcome.status, outcome.completed, outcome.failed
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summarises_find_identifier() {
        let identifier = InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P1")),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^Jane")),
            DataElement::new(
                tags::MODALITIES_IN_STUDY,
                VR::CS,
                dicom_value!(Strs, ["CT", "RTSTRUCT"]),
            ),
            DataElement::new(tags::STUDY_INSTANCE_UID, VR::UI, dicom_value!(Str, "1.2.3")),
        ]);

        let summary = StudySummary::from_identifier(&identifier);

        assert_eq!(summary.patient_id, "P1");
        assert_eq!(summary.study_instance_uid, "1.2.3");
        assert_eq!(summary.modalities_in_study, "CT\\RTSTRUCT");
        assert!(summary.to_string().starts_with("PatientID: P1\nPatientName: Doe^Jane\n"));
    }

    #[test]
    fn query_identifier_has_study_level_keys() {
        let query = StudyQuery {
            patient_id: Some("P1".to_string()),
            ..StudyQuery::default()
        };

        let identifier = query.identifier();

        assert_eq!(
            attribute_text(&identifier, tags::QUERY_RETRIEVE_LEVEL).as_deref(),
            Some("STUDY")
        );
        assert_eq!(attribute_text(&identifier, tags::PATIENT_ID).as_deref(), Some("P1"));
        assert!(identifier.element(tags::STUDY_INSTANCE_UID).is_ok());
        assert!(attribute_text(&identifier, tags::STUDY_INSTANCE_UID).is_none());
    }

    #[test]
    fn reader_queues_multiple_messages_from_one_pdu() {
        let mut pdus = dimse::message_pdus(1, &dimse::c_echo_rsp(1, 0), None, 0).expect("first");
        pdus.extend(dimse::message_pdus(1, &dimse::c_echo_rsp(2, 0), None, 0).expect("second"));
        let data = pdus
            .into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                _ => Vec::new(),
            })
            .collect();

        let mut reader = ResponseReader::default();
        reader.feed(Pdu::PData { data }).expect("feed");

        assert_eq!(reader.pop().map(|message| message.message_id()), Some(1));
        assert_eq!(reader.pop().map(|message| message.message_id()), Some(2));
        assert!(reader.pop().is_none());
        assert!(matches!(
            reader.feed(Pdu::ReleaseRQ),
            Err(ScuError::UnexpectedPdu(_))
        ));
    }

    #[test]
    fn refused_connection_is_an_association_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let peer = PeerConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..PeerConfig::default()
        };

        assert!(matches!(echo(&peer), Err(ScuError::Association(_))));
        assert!(matches!(
            establish(&peer, uids::VERIFICATION, vec![uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()]),
            Err(ScuError::Association(_))
        ));
    }
}
