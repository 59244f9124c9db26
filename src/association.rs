//! Acceptor side of a storage association.
//!
//! [`AssociationSession`] is transport agnostic: it consumes decoded PDUs and
//! returns the PDUs to send back. Everything it stores lands under the
//! configured storage root as `<StudyInstanceUID>/<SOPInstanceUID>.dcm`.

use crate::config::ScpConfig;
use crate::dimse::{self, DimseError, DimseMessage, MessageAssembler};
use crate::tags::attribute_text;

use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom_dictionary_std::{tags, uids};
use dicom_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserVariableItem,
};
use futures::channel::mpsc::UnboundedSender;
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.137038125948464847900039011591283709926";
pub const IMPLEMENTATION_VERSION_NAME: &str = "DICOM-SLICER-01";

/// Accepted for Verification, in order of preference.
pub const UNCOMPRESSED_TRANSFER_SYNTAXES: [&str; 3] = [
    "1.2.840.10008.1.2.1", // Explicit VR Little Endian
    "1.2.840.10008.1.2.2", // Explicit VR Big Endian
    "1.2.840.10008.1.2",   // Implicit VR Little Endian
];

/// Accepted for storage SOP classes, in order of preference.
pub const IMAGE_TRANSFER_SYNTAXES: [&str; 12] = [
    "1.2.840.10008.1.2.4.80", // JPEG-LS Lossless
    "1.2.840.10008.1.2.4.90", // JPEG 2000 Lossless
    "1.2.840.10008.1.2.4.70", // JPEG Lossless, SV1
    "1.2.840.10008.1.2.4.57", // JPEG Lossless
    "1.2.840.10008.1.2.5",    // RLE Lossless
    "1.2.840.10008.1.2.4.81", // JPEG-LS Near Lossless
    "1.2.840.10008.1.2.4.91", // JPEG 2000
    "1.2.840.10008.1.2.4.50", // JPEG Baseline
    "1.2.840.10008.1.2.4.51", // JPEG Extended
    "1.2.840.10008.1.2.1",
    "1.2.840.10008.1.2.2",
    "1.2.840.10008.1.2",
];

pub const STORAGE_SOP_CLASS_PREFIX: &str = "1.2.840.10008.5.1.4.1.1.";

/// Extension of objects still being written.
pub const PARTIAL_FILE_EXTENSION: &str = "part";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ScpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PDU error: {0}")]
    Pdu(String),

    #[error("PDU of {length} bytes exceeds the limit of {limit}")]
    PduTooLarge { length: u32, limit: u32 },

    #[error(transparent)]
    Dimse(#[from] DimseError),

    #[error("C-STORE without a data set")]
    MissingDataSet,

    #[error("Data set has no {0}")]
    MissingAttribute(&'static str),

    #[error("UID {0:?} cannot be used as a file name")]
    InvalidUid(String),

    #[error("Could not write object: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Idle,
    AssociationRequested,
    Established,
    ReceivingObjects,
    Released,
    Aborted,
    Rejected,
}

impl AssociationState {
    /// No further PDUs are expected.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            AssociationState::Released | AssociationState::Aborted | AssociationState::Rejected
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub path: PathBuf,
    pub sop_class_uid: String,
    pub sop_instance_uid: String,
    pub study_instance_uid: String,
    pub calling_ae_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationSummary {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub peer: String,
    pub objects_received: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    Stored(StoredObject),
    Released(AssociationSummary),
    Aborted(AssociationSummary),
}

/// Observer of a storage service, typically used to refresh a study list.
pub trait StorageListener: Send + Sync {
    fn on_object_stored(&self, _object: &StoredObject) {}

    fn on_association_released(&self, _summary: &AssociationSummary) {}

    fn on_association_aborted(&self, _summary: &AssociationSummary) {}
}

impl StorageListener for () {}

impl StorageListener for UnboundedSender<StorageEvent> {
    fn on_object_stored(&self, object: &StoredObject) {
        let _ = self.unbounded_send(StorageEvent::Stored(object.clone()));
    }

    fn on_association_released(&self, summary: &AssociationSummary) {
        let _ = self.unbounded_send(StorageEvent::Released(summary.clone()));
    }

    fn on_association_aborted(&self, summary: &AssociationSummary) {
        let _ = self.unbounded_send(StorageEvent::Aborted(summary.clone()));
    }
}

/// Picks the transfer syntax for a proposed presentation context.
pub fn select_transfer_syntax(
    context: &PresentationContextProposed,
) -> Result<&'static str, PresentationContextResultReason> {
    let abstract_syntax = trim_uid(&context.abstract_syntax);
    let whitelist: &[&'static str] = if abstract_syntax == uids::VERIFICATION {
        &UNCOMPRESSED_TRANSFER_SYNTAXES
    } else if abstract_syntax.starts_with(STORAGE_SOP_CLASS_PREFIX) {
        &IMAGE_TRANSFER_SYNTAXES
    } else {
        return Err(PresentationContextResultReason::AbstractSyntaxNotSupported);
    };

    whitelist
        .iter()
        .copied()
        .find(|candidate| {
            context
                .transfer_syntaxes
                .iter()
                .any(|proposed| trim_uid(proposed) == *candidate)
        })
        .ok_or(PresentationContextResultReason::TransferSyntaxesNotSupported)
}

fn trim_uid(uid: &str) -> &str {
    uid.trim_end_matches(['\0', ' '])
}

/// Data set of an incoming C-STORE, written to the storage root as its
/// fragments arrive.
struct Spool {
    presentation_context_id: u8,
    path: PathBuf,
    writer: BufWriter<File>,
    error: Option<std::io::Error>,
}

impl Spool {
    fn create(presentation_context_id: u8, path: PathBuf) -> std::io::Result<Self> {
        let writer = BufWriter::new(File::create(&path)?);
        Ok(Self {
            presentation_context_id,
            path,
            writer,
            error: None,
        })
    }

    /// Write failures are kept until the data set is complete.
    fn write(&mut self, bytes: &[u8]) {
        if self.error.is_none() {
            if let Err(err) = self.writer.write_all(bytes) {
                self.error = Some(err);
            }
        }
    }

    /// Closes the file and returns its path.
    fn finish(self) -> Result<PathBuf, ScpError> {
        let Spool {
            path,
            mut writer,
            error,
            ..
        } = self;
        let result = match error {
            Some(err) => Err(err),
            None => writer.flush(),
        };
        drop(writer);
        match result {
            Ok(()) => Ok(path),
            Err(err) => {
                let _ = fs::remove_file(&path);
                Err(err.into())
            }
        }
    }
}

/// State of one inbound association.
pub struct AssociationSession {
    id: u64,
    config: Arc<ScpConfig>,
    listener: Arc<dyn StorageListener>,
    received_total: Arc<AtomicUsize>,
    peer: String,
    state: AssociationState,
    calling_ae_title: String,
    called_ae_title: String,
    contexts: Vec<NegotiatedContext>,
    peer_max_pdu_length: u32,
    assembler: MessageAssembler,
    spool: Option<Spool>,
    objects_received: usize,
}

impl AssociationSession {
    /// `received_total` is shared by every association of a server.
    pub fn new(
        config: Arc<ScpConfig>,
        listener: Arc<dyn StorageListener>,
        received_total: Arc<AtomicUsize>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            config,
            listener,
            received_total,
            peer: peer.into(),
            state: AssociationState::Idle,
            calling_ae_title: String::new(),
            called_ae_title: String::new(),
            contexts: Vec::new(),
            peer_max_pdu_length: dimse::DEFAULT_MAX_PDU_LENGTH,
            assembler: MessageAssembler::new(),
            spool: None,
            objects_received: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn contexts(&self) -> &[NegotiatedContext] {
        &self.contexts
    }

    pub fn objects_received(&self) -> usize {
        self.objects_received
    }

    pub fn summary(&self) -> AssociationSummary {
        AssociationSummary {
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            peer: self.peer.clone(),
            objects_received: self.objects_received,
        }
    }

    /// Advances the state machine by one PDU and returns the replies.
    pub fn handle(&mut self, pdu: Pdu) -> Vec<Pdu> {
        match (self.state, pdu) {
            (AssociationState::Idle, Pdu::AssociationRQ(request)) => self.negotiate(request),
            (
                AssociationState::Established | AssociationState::ReceivingObjects,
                Pdu::PData { data },
            ) => self.receive(data),
            (
                AssociationState::Established | AssociationState::ReceivingObjects,
                Pdu::ReleaseRQ,
            ) => self.release(),
            (_, Pdu::AbortRQ { source }) => {
                info!("{}: association aborted by peer ({source:?})", self.peer);
                self.abort();
                Vec::new()
            }
            (state, other) => {
                warn!("{}: unexpected {other:?} in state {state:?}", self.peer);
                self.abort();
                vec![Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                }]
            }
        }
    }

    /// The transport went away. An open association counts as aborted.
    pub fn connection_closed(&mut self) {
        if !self.state.is_closed() && self.state != AssociationState::Idle {
            warn!("{}: connection closed without release", self.peer);
            self.abort();
        }
    }

    fn negotiate(&mut self, request: AssociationRQ) -> Vec<Pdu> {
        self.state = AssociationState::AssociationRequested;
        self.calling_ae_title = request.calling_ae_title.trim().to_string();
        self.called_ae_title = request.called_ae_title.trim().to_string();

        if self.called_ae_title != self.config.ae_title.trim() {
            warn!(
                "{}: rejecting association from {} to unknown AE {:?}",
                self.peer, self.calling_ae_title, self.called_ae_title
            );
            self.state = AssociationState::Rejected;
            return vec![Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized,
                ),
            })];
        }

        self.peer_max_pdu_length = request
            .user_variables
            .iter()
            .find_map(|item| match item {
                UserVariableItem::MaxLength(length) => Some(*length),
                _ => None,
            })
            .unwrap_or(dimse::DEFAULT_MAX_PDU_LENGTH);

        let results: Vec<_> = request
            .presentation_contexts
            .iter()
            .map(|proposed| match select_transfer_syntax(proposed) {
                Ok(transfer_syntax) => {
                    self.contexts.push(NegotiatedContext {
                        id: proposed.id,
                        abstract_syntax: trim_uid(&proposed.abstract_syntax).to_string(),
                        transfer_syntax: transfer_syntax.to_string(),
                    });
                    PresentationContextResult {
                        id: proposed.id,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: transfer_syntax.to_string(),
                    }
                }
                Err(reason) => {
                    debug!(
                        "{}: rejecting context {} ({}): {reason:?}",
                        self.peer, proposed.id, proposed.abstract_syntax
                    );
                    PresentationContextResult {
                        id: proposed.id,
                        reason,
                        transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                    }
                }
            })
            .collect();

        info!(
            "{}: association from {} accepted, {}/{} presentation contexts",
            self.peer,
            self.calling_ae_title,
            self.contexts.len(),
            results.len()
        );
        self.state = AssociationState::Established;
        vec![Pdu::AssociationAC(AssociationAC {
            protocol_version: request.protocol_version,
            calling_ae_title: request.calling_ae_title,
            called_ae_title: request.called_ae_title,
            application_context_name: request.application_context_name,
            presentation_contexts: results,
            user_variables: vec![
                UserVariableItem::MaxLength(self.config.max_pdu_length),
                UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                UserVariableItem::ImplementationVersionName(
                    IMPLEMENTATION_VERSION_NAME.to_string(),
                ),
            ],
        })]
    }

    fn receive(&mut self, data: Vec<PDataValue>) -> Vec<Pdu> {
        self.state = AssociationState::ReceivingObjects;
        let mut replies = Vec::new();
        for value in data {
            match self.receive_value(value) {
                Ok(Some((message, spooled))) => replies.extend(self.dispatch(message, spooled)),
                Ok(None) => {}
                Err(err) => {
                    warn!("{}: malformed DIMSE message: {err}", self.peer);
                    self.abort();
                    replies.push(Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::InvalidPduParameter,
                        ),
                    });
                    break;
                }
            }
        }
        replies
    }

    /// Routes one PDV. C-STORE data sets bypass the assembler and go straight
    /// to a spool file.
    fn receive_value(
        &mut self,
        value: PDataValue,
    ) -> Result<Option<(DimseMessage, Option<Result<PathBuf, ScpError>>)>, DimseError> {
        if matches!(value.value_type, PDataValueType::Data) {
            if let Some(spool) = self.spool.as_mut() {
                if spool.presentation_context_id != value.presentation_context_id {
                    return Err(DimseError::ContextMismatch {
                        expected: spool.presentation_context_id,
                        found: value.presentation_context_id,
                    });
                }
                spool.write(&value.data);
                if !value.is_last {
                    return Ok(None);
                }
                let spooled = self.spool.take().map(Spool::finish);
                return Ok(self.assembler.take_pending().map(|message| (message, spooled)));
            }
        }

        let is_command = matches!(value.value_type, PDataValueType::Command);
        let presentation_context_id = value.presentation_context_id;
        if let Some(message) = self.assembler.push(value)? {
            return Ok(Some((message, None)));
        }
        if is_command {
            self.start_spool(presentation_context_id);
        }
        Ok(None)
    }

    /// Opens the spool file of a C-STORE whose command just completed. When
    /// the file cannot be created the data set is buffered in memory instead.
    fn start_spool(&mut self, presentation_context_id: u8) {
        let Some(command) = self.assembler.pending_command() else {
            return;
        };
        let is_store = command
            .element(tags::COMMAND_FIELD)
            .ok()
            .and_then(|element| element.to_int::<u16>().ok())
            == Some(dimse::C_STORE_RQ);
        if !is_store {
            return;
        }
        let message_id = command
            .element(tags::MESSAGE_ID)
            .ok()
            .and_then(|element| element.to_int::<u16>().ok())
            .unwrap_or(0);
        match Spool::create(presentation_context_id, self.partial_path(message_id)) {
            Ok(spool) => self.spool = Some(spool),
            Err(err) => warn!("{}: spooling to memory: {err}", self.peer),
        }
    }

    fn partial_path(&self, message_id: u16) -> PathBuf {
        self.config
            .storage_root
            .join(format!("{}-{message_id}.{PARTIAL_FILE_EXTENSION}", self.id))
    }

    fn dispatch(
        &mut self,
        message: DimseMessage,
        spooled: Option<Result<PathBuf, ScpError>>,
    ) -> Vec<Pdu> {
        let Some(context) = self
            .contexts
            .iter()
            .find(|context| context.id == message.presentation_context_id)
            .cloned()
        else {
            if let Some(Ok(path)) = spooled {
                let _ = fs::remove_file(path);
            }
            warn!(
                "{}: message on unknown presentation context {}",
                self.peer, message.presentation_context_id
            );
            return Vec::new();
        };

        let response = match message.command_field() {
            Some(dimse::C_ECHO_RQ) => {
                debug!("{}: C-ECHO", self.peer);
                dimse::c_echo_rsp(message.message_id(), dimse::STATUS_SUCCESS)
            }
            Some(dimse::C_STORE_RQ) => self.store(&message, &context, spooled),
            Some(other) => {
                info!("{}: ignoring command 0x{other:04X}", self.peer);
                return Vec::new();
            }
            None => return Vec::new(),
        };

        match dimse::message_pdus(context.id, &response, None, self.peer_max_pdu_length) {
            Ok(pdus) => pdus,
            Err(err) => {
                warn!("{}: could not encode response: {err}", self.peer);
                Vec::new()
            }
        }
    }

    fn store(
        &mut self,
        message: &DimseMessage,
        context: &NegotiatedContext,
        spooled: Option<Result<PathBuf, ScpError>>,
    ) -> InMemDicomObject {
        let sop_class_uid = message
            .command_text(tags::AFFECTED_SOP_CLASS_UID)
            .unwrap_or_else(|| context.abstract_syntax.clone());

        match self.write_object(message, context, spooled) {
            Ok(stored) => {
                self.objects_received += 1;
                self.received_total.fetch_add(1, Ordering::SeqCst);
                info!(
                    "{}: stored {} ({} this association)",
                    self.peer,
                    stored.path.display(),
                    self.objects_received
                );
                self.listener.on_object_stored(&stored);
                dimse::c_store_rsp(
                    message.message_id(),
                    &sop_class_uid,
                    &stored.sop_instance_uid,
                    dimse::STATUS_SUCCESS,
                )
            }
            Err(err) => {
                warn!("{}: C-STORE failed: {err}", self.peer);
                let sop_instance_uid = message
                    .command_text(tags::AFFECTED_SOP_INSTANCE_UID)
                    .unwrap_or_default();
                dimse::c_store_rsp(
                    message.message_id(),
                    &sop_class_uid,
                    &sop_instance_uid,
                    dimse::STATUS_PROCESSING_FAILURE,
                )
            }
        }
    }

    fn write_object(
        &self,
        message: &DimseMessage,
        context: &NegotiatedContext,
        spooled: Option<Result<PathBuf, ScpError>>,
    ) -> Result<StoredObject, ScpError> {
        let (partial, data_set) = match spooled {
            Some(spooled) => {
                let partial = spooled?;
                let data_set = read_spooled(&partial, &context.transfer_syntax);
                (partial, data_set)
            }
            None => {
                let data_set = message
                    .decode_data(&context.transfer_syntax)
                    .map_err(ScpError::from)
                    .and_then(|data_set| data_set.ok_or(ScpError::MissingDataSet));
                (self.partial_path(message.message_id()), data_set)
            }
        };

        let stored = data_set.and_then(|data_set| {
            self.write_data_set(message, context, data_set, &partial)
        });
        if stored.is_err() {
            let _ = fs::remove_file(&partial);
        }
        stored
    }

    /// Writes the full file over `partial`, then moves it into its study
    /// directory.
    fn write_data_set(
        &self,
        message: &DimseMessage,
        context: &NegotiatedContext,
        data_set: InMemDicomObject,
        partial: &Path,
    ) -> Result<StoredObject, ScpError> {
        let study_instance_uid = attribute_text(&data_set, tags::STUDY_INSTANCE_UID)
            .ok_or(ScpError::MissingAttribute("StudyInstanceUID"))?;
        let sop_instance_uid = message
            .command_text(tags::AFFECTED_SOP_INSTANCE_UID)
            .or_else(|| attribute_text(&data_set, tags::SOP_INSTANCE_UID))
            .ok_or(ScpError::MissingAttribute("SOPInstanceUID"))?;
        let sop_class_uid = message
            .command_text(tags::AFFECTED_SOP_CLASS_UID)
            .or_else(|| attribute_text(&data_set, tags::SOP_CLASS_UID))
            .unwrap_or_else(|| context.abstract_syntax.clone());

        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid(sop_class_uid.as_str())
            .media_storage_sop_instance_uid(sop_instance_uid.as_str())
            .transfer_syntax(context.transfer_syntax.as_str())
            .build()
            .map_err(|err| ScpError::Write(err.to_string()))?;
        let file_object = data_set.with_exact_meta(meta);

        let study_directory = self
            .config
            .storage_root
            .join(uid_file_name(&study_instance_uid)?);
        let target = study_directory.join(format!("{}.dcm", uid_file_name(&sop_instance_uid)?));

        file_object
            .write_to_file(partial)
            .map_err(|err| ScpError::Write(err.to_string()))?;
        fs::create_dir_all(&study_directory)?;
        fs::rename(partial, &target)?;

        Ok(StoredObject {
            path: target,
            sop_class_uid,
            sop_instance_uid,
            study_instance_uid,
            calling_ae_title: self.calling_ae_title.clone(),
        })
    }

    fn release(&mut self) -> Vec<Pdu> {
        self.state = AssociationState::Released;
        let summary = self.summary();
        info!(
            "{}: association with {} released, {} objects received",
            self.peer, summary.calling_ae_title, summary.objects_received
        );
        self.listener.on_association_released(&summary);
        vec![Pdu::ReleaseRP]
    }

    fn abort(&mut self) {
        self.state = AssociationState::Aborted;
        // close the spool before its file is removed
        self.spool = None;
        let prefix = format!("{}-", self.id);
        match remove_partial_files(&self.config.storage_root, |name| name.starts_with(&prefix)) {
            Ok(0) => {}
            Ok(removed) => info!("{}: removed {removed} partial files", self.peer),
            Err(err) => warn!("{}: partial file cleanup failed: {err}", self.peer),
        }
        self.listener.on_association_aborted(&self.summary());
    }
}

fn read_spooled(path: &Path, ts_uid: &str) -> Result<InMemDicomObject, ScpError> {
    let ts = dimse::transfer_syntax(ts_uid)?;
    let reader = BufReader::new(File::open(path)?);
    InMemDicomObject::read_dataset_with_ts(reader, ts).map_err(|err| {
        ScpError::Dimse(DimseError::Decode {
            what: "data set",
            message: err.to_string(),
        })
    })
}

/// Restricts UIDs used as path components to characters that cannot escape
/// the storage root.
fn uid_file_name(uid: &str) -> Result<&str, ScpError> {
    let valid = !uid.is_empty()
        && !uid.starts_with('.')
        && uid
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if valid {
        Ok(uid)
    } else {
        Err(ScpError::InvalidUid(uid.to_string()))
    }
}

/// Deletes `*.part` files directly under `root` whose names pass `filter`.
/// Returns how many were removed.
pub fn remove_partial_files(
    root: &Path,
    filter: impl Fn(&str) -> bool,
) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(root)?.filter_map(Result::ok) {
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == PARTIAL_FILE_EXTENSION);
        let selected = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(&filter);
        if is_partial && selected && path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slice::tests::ct_object;
    use dicom::core::{DataElement, VR, dicom_value};
    use futures::channel::mpsc::{self, UnboundedReceiver};

    const APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

    struct Fixture {
        root: tempfile::TempDir,
        counter: Arc<AtomicUsize>,
        events: UnboundedReceiver<StorageEvent>,
        session: AssociationSession,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let config = ScpConfig {
            storage_root: root.path().to_path_buf(),
            ..ScpConfig::default()
        };
        let counter = Arc::new(AtomicUsize::new(0));
        let (sender, events) = mpsc::unbounded();
        let session = AssociationSession::new(
            Arc::new(config),
            Arc::new(sender),
            Arc::clone(&counter),
            "127.0.0.1:50000",
        );
        Fixture {
            root,
            counter,
            events,
            session,
        }
    }

    fn context(
        id: u8,
        abstract_syntax: &str,
        transfer_syntaxes: &[&str],
    ) -> PresentationContextProposed {
        PresentationContextProposed {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
        }
    }

    fn request(called_ae_title: &str, contexts: Vec<PresentationContextProposed>) -> Pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "MODALITY".to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: APPLICATION_CONTEXT.to_string(),
            presentation_contexts: contexts,
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        })
    }

    fn establish(session: &mut AssociationSession) -> Vec<PresentationContextResult> {
        let replies = session.handle(request(
            "STORESCP",
            vec![
                context(1, uids::CT_IMAGE_STORAGE, &[uids::EXPLICIT_VR_LITTLE_ENDIAN]),
                context(3, uids::VERIFICATION, &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
                context(5, "1.2.3.4.5", &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
                context(7, uids::CT_IMAGE_STORAGE, &["1.2.840.10008.1.2.4.100"]),
            ],
        ));
        match replies.as_slice() {
            [Pdu::AssociationAC(accept)] => accept.presentation_contexts.clone(),
            other => panic!("expected A-ASSOCIATE-AC, got {other:?}"),
        }
    }

    fn response(replies: Vec<Pdu>) -> DimseMessage {
        let mut assembler = MessageAssembler::new();
        replies
            .into_iter()
            .flat_map(|pdu| match pdu {
                Pdu::PData { data } => data,
                other => panic!("expected P-DATA-TF, got {other:?}"),
            })
            .find_map(|value| assembler.push(value).expect("response"))
            .expect("complete response")
    }

    fn store_request(
        session: &mut AssociationSession,
        data_set: &InMemDicomObject,
        sop: &str,
    ) -> DimseMessage {
        let data = dimse::encode_data(data_set, uids::EXPLICIT_VR_LITTLE_ENDIAN).expect("data");
        let pdus = dimse::message_pdus(
            1,
            &dimse::c_store_rq(1, uids::CT_IMAGE_STORAGE, sop),
            Some(&data),
            16384,
        )
        .expect("request");
        let replies = pdus.into_iter().flat_map(|pdu| session.handle(pdu)).collect();
        response(replies)
    }

    #[test]
    fn rejects_unknown_called_ae_without_storing() {
        let mut fixture = fixture();

        let replies = fixture.session.handle(request(
            "WRONGAE",
            vec![context(1, uids::CT_IMAGE_STORAGE, &[uids::EXPLICIT_VR_LITTLE_ENDIAN])],
        ));

        assert!(matches!(
            replies.as_slice(),
            [Pdu::AssociationRJ(AssociationRJ {
                result: AssociationRJResult::Permanent,
                source: AssociationRJSource::ServiceUser(
                    AssociationRJServiceUserReason::CalledAETitleNotRecognized
                ),
            })]
        ));
        assert_eq!(fixture.session.state(), AssociationState::Rejected);
        assert_eq!(fs::read_dir(fixture.root.path()).expect("root").count(), 0);
        assert_eq!(fixture.counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn negotiates_from_whitelists() {
        let mut fixture = fixture();

        let results = establish(&mut fixture.session);

        let reasons: Vec<_> = results.iter().map(|result| result.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                PresentationContextResultReason::Acceptance,
                PresentationContextResultReason::Acceptance,
                PresentationContextResultReason::AbstractSyntaxNotSupported,
                PresentationContextResultReason::TransferSyntaxesNotSupported,
            ]
        );
        assert_eq!(results[0].transfer_syntax, uids::EXPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(results[1].transfer_syntax, uids::IMPLICIT_VR_LITTLE_ENDIAN);
        assert_eq!(fixture.session.contexts().len(), 2);
        assert_eq!(fixture.session.state(), AssociationState::Established);
    }

    #[test]
    fn prefers_server_order() {
        let proposed = context(
            1,
            uids::MR_IMAGE_STORAGE,
            &[uids::IMPLICIT_VR_LITTLE_ENDIAN, "1.2.840.10008.1.2.4.90"],
        );
        assert_eq!(select_transfer_syntax(&proposed), Ok("1.2.840.10008.1.2.4.90"));

        let echo = context(1, uids::VERIFICATION, &["1.2.840.10008.1.2.4.90"]);
        assert_eq!(
            select_transfer_syntax(&echo),
            Err(PresentationContextResultReason::TransferSyntaxesNotSupported)
        );
    }

    #[test]
    fn stores_object_under_study_directory() {
        let mut fixture = fixture();
        establish(&mut fixture.session);
        let mut data_set = ct_object(2, 2, 1, 0.0).into_inner();
        data_set.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3"),
        ));

        let reply = store_request(&mut fixture.session, &data_set, "9.9.9");

        assert_eq!(reply.command_field(), Some(dimse::C_STORE_RSP));
        assert_eq!(reply.status(), Some(dimse::STATUS_SUCCESS));
        let stored = fixture.root.path().join("1.2.3").join("9.9.9.dcm");
        assert!(stored.is_file());
        let reopened = dicom::object::open_file(&stored).expect("stored file");
        assert_eq!(reopened.meta().media_storage_sop_instance_uid(), "9.9.9");
        assert_eq!(fixture.counter.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.session.objects_received(), 1);
        match fixture.events.try_next() {
            Ok(Some(StorageEvent::Stored(stored))) => assert_eq!(stored.sop_instance_uid, "9.9.9"),
            other => panic!("expected a stored event, got {other:?}"),
        }
        let leftovers = remove_partial_files(fixture.root.path(), |_| true).expect("cleanup");
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn store_without_study_uid_fails_softly() {
        let mut fixture = fixture();
        establish(&mut fixture.session);
        let data_set = InMemDicomObject::from_element_iter([DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "9.9.9"),
        )]);

        let reply = store_request(&mut fixture.session, &data_set, "9.9.9");

        assert_eq!(reply.status(), Some(dimse::STATUS_PROCESSING_FAILURE));
        assert_eq!(fixture.counter.load(Ordering::SeqCst), 0);
        assert_eq!(remove_partial_files(fixture.root.path(), |_| true).expect("scan"), 0);
        assert_eq!(fixture.session.state(), AssociationState::ReceivingObjects);
    }

    #[test]
    fn answers_echo_and_release() {
        let mut fixture = fixture();
        establish(&mut fixture.session);

        let pdus = dimse::message_pdus(3, &dimse::c_echo_rq(9), None, 16384).expect("echo");
        let replies = pdus.into_iter().flat_map(|pdu| fixture.session.handle(pdu)).collect();
        let reply = response(replies);
        assert_eq!(reply.command_field(), Some(dimse::C_ECHO_RSP));
        assert_eq!(reply.status(), Some(dimse::STATUS_SUCCESS));
        assert_eq!(reply.message_id(), 9);

        let replies = fixture.session.handle(Pdu::ReleaseRQ);
        assert!(matches!(replies.as_slice(), [Pdu::ReleaseRP]));
        assert_eq!(fixture.session.state(), AssociationState::Released);
        assert!(matches!(
            fixture.events.try_next(),
            Ok(Some(StorageEvent::Released(AssociationSummary { objects_received: 0, .. })))
        ));
    }

    fn study_data_set(study_instance_uid: &str) -> InMemDicomObject {
        let mut data_set = ct_object(4, 4, 1, 0.0).into_inner();
        data_set.put(DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, study_instance_uid),
        ));
        data_set
    }

    #[test]
    fn abort_mid_transfer_removes_spooled_data() {
        let mut fixture = fixture();
        establish(&mut fixture.session);
        let other = fixture.root.path().join("999999-1.part");
        fs::write(&other, b"partial").expect("other");
        let data = dimse::encode_data(&study_data_set("1.2.3"), uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .expect("data");
        let mut pdus = dimse::message_pdus(
            1,
            &dimse::c_store_rq(1, uids::CT_IMAGE_STORAGE, "9.9.9"),
            Some(&data),
            64,
        )
        .expect("request");
        assert!(pdus.len() > 2);
        pdus.pop();

        for pdu in pdus {
            assert!(fixture.session.handle(pdu).is_empty());
        }
        let spooled = fixture
            .root
            .path()
            .join(format!("{}-1.part", fixture.session.id()));
        assert!(spooled.is_file());

        let replies = fixture.session.handle(Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });

        assert!(replies.is_empty());
        assert_eq!(fixture.session.state(), AssociationState::Aborted);
        assert!(!spooled.exists());
        assert!(other.exists());
        assert!(!fixture.root.path().join("1.2.3").exists());
        assert_eq!(fixture.counter.load(Ordering::SeqCst), 0);
        assert!(matches!(
            fixture.events.try_next(),
            Ok(Some(StorageEvent::Aborted(AssociationSummary { objects_received: 0, .. })))
        ));
    }

    #[test]
    fn dropped_connection_mid_transfer_removes_spooled_data() {
        let mut fixture = fixture();
        establish(&mut fixture.session);
        let data = dimse::encode_data(&study_data_set("1.2.3"), uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .expect("data");
        let mut pdus = dimse::message_pdus(
            1,
            &dimse::c_store_rq(1, uids::CT_IMAGE_STORAGE, "9.9.9"),
            Some(&data),
            64,
        )
        .expect("request");
        pdus.pop();
        for pdu in pdus {
            fixture.session.handle(pdu);
        }

        fixture.session.connection_closed();

        assert_eq!(fixture.session.state(), AssociationState::Aborted);
        assert_eq!(remove_partial_files(fixture.root.path(), |_| true).expect("scan"), 0);
    }

    #[test]
    fn data_before_association_aborts() {
        let mut fixture = fixture();

        let replies = fixture.session.handle(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: Vec::new(),
            }],
        });

        assert!(matches!(replies.as_slice(), [Pdu::AbortRQ { .. }]));
        assert!(fixture.session.state().is_closed());
    }
}
