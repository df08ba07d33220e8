//! Message protocol spoken with the external strategy engine.
//!
//! Every engine call carries a payload, a correlation id pairing the request to its one
//! response, and the enactment id shared by all messages of one workflow run.
//!
//! # Message Categories
//!
//! ```text
//! requests       RequestConfiguration, ObtainPriorInformation, PrepareForCentring,
//!                RequestCentring, ChooseLattice, CollectionProposal
//! notifications  SubprocessStarted, SubprocessStopped, Info
//! terminal       WorkflowCompleted, WorkflowAborted, WorkflowFailed
//! ```
//!
//! Requests need a typed response and move the connection to OPEN while they are handled.
//! Notifications are answered with no payload and never touch the connection state.
//! Terminal messages end the dispatch loop.

use crate::acquisition::CollectionProposal;
use crate::geometry::{GoniostatRotation, GoniostatTranslation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier shared by every message of one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnactmentId(String);

impl EnactmentId {
    /// Wrap an engine-provided id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty ids are treated as absent.
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EnactmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier pairing one request to its one response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Wrap an engine-provided id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of message types the engine may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    RequestConfiguration,
    ObtainPriorInformation,
    PrepareForCentring,
    RequestCentring,
    ChooseLattice,
    CollectionProposal,
    SubprocessStarted,
    SubprocessStopped,
    Info,
    WorkflowCompleted,
    WorkflowAborted,
    WorkflowFailed,
}

/// How the dispatcher treats a message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    /// Needs a typed response; the connection is OPEN while it is handled.
    Request,
    /// Informational; answered with nothing, state unchanged.
    Notification,
    /// Ends the dispatch loop.
    Terminal,
}

impl MessageType {
    /// Category of this message type.
    pub fn category(self) -> MessageCategory {
        match self {
            MessageType::RequestConfiguration
            | MessageType::ObtainPriorInformation
            | MessageType::PrepareForCentring
            | MessageType::RequestCentring
            | MessageType::ChooseLattice
            | MessageType::CollectionProposal => MessageCategory::Request,
            MessageType::SubprocessStarted | MessageType::SubprocessStopped | MessageType::Info => {
                MessageCategory::Notification
            }
            MessageType::WorkflowCompleted
            | MessageType::WorkflowAborted
            | MessageType::WorkflowFailed => MessageCategory::Terminal,
        }
    }

    /// Whether the message needs a typed response.
    pub fn is_request(self) -> bool {
        self.category() == MessageCategory::Request
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status reported in [`CentringDone`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CentringStatus {
    /// More rotations follow.
    Next,
    /// This was the last rotation of the series.
    Done,
}

impl CentringStatus {
    /// Status for setting `current` out of `total`.
    pub fn for_setting(current: u32, total: u32) -> Self {
        if current >= total {
            CentringStatus::Done
        } else {
            CentringStatus::Next
        }
    }
}

impl fmt::Display for CentringStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CentringStatus::Next => write!(f, "NEXT"),
            CentringStatus::Done => write!(f, "DONE"),
        }
    }
}

/// Unit cell parameters (a, b, c, alpha, beta, gamma).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnitCell(pub [f64; 6]);

/// Engine asks where its beamline configuration lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConfiguration;

/// Location of the beamline configuration directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationData {
    pub location: String,
}

/// Engine asks for what is known about the sample before starting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObtainPriorInformation;

/// Sample knowledge handed to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorInformation {
    pub sample_name: String,
    pub image_root: String,
    pub space_group: Option<String>,
    pub cell: Option<UnitCell>,
}

/// Centring for one goniostat rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestCentring {
    pub current_setting_no: u32,
    pub total_rotations: u32,
    pub goniostat_rotation: GoniostatRotation,
}

/// Result of one centring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentringDone {
    pub status: CentringStatus,
    pub timestamp: DateTime<Utc>,
    pub goniostat_translation: GoniostatTranslation,
}

/// Candidate lattices offered to the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChooseLattice {
    pub lattice_format: String,
    pub solutions: Vec<String>,
}

/// Lattice picked by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedLattice {
    pub lattice_format: String,
    pub solution: String,
}

/// Acquisition finished for a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDone {
    pub proposal_id: uuid::Uuid,
    pub image_root: String,
    /// Zero on success.
    pub status: i32,
}

/// Answer that makes the engine abandon the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamlineAbort {
    pub reason: String,
}

/// Typed payload of an engine message or of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    RequestConfiguration(RequestConfiguration),
    ConfigurationData(ConfigurationData),
    ObtainPriorInformation(ObtainPriorInformation),
    PriorInformation(PriorInformation),
    PrepareForCentring,
    ReadyForCentring,
    RequestCentring(RequestCentring),
    CentringDone(CentringDone),
    ChooseLattice(ChooseLattice),
    SelectedLattice(SelectedLattice),
    CollectionProposal(CollectionProposal),
    CollectionDone(CollectionDone),
    SubprocessStarted { name: String },
    SubprocessStopped,
    Info { text: String },
    WorkflowCompleted,
    WorkflowAborted,
    WorkflowFailed { reason: String },
    BeamlineAbort(BeamlineAbort),
}

impl Payload {
    /// Synthetic abort answer.
    pub fn abort(reason: impl Into<String>) -> Self {
        Payload::BeamlineAbort(BeamlineAbort {
            reason: reason.into(),
        })
    }

    /// Whether this payload is an abort answer.
    pub fn is_abort(&self) -> bool {
        matches!(self, Payload::BeamlineAbort(_))
    }

    /// Message type of an inbound payload; `None` for response-only payloads.
    pub fn message_type(&self) -> Option<MessageType> {
        let kind = match self {
            Payload::RequestConfiguration(_) => MessageType::RequestConfiguration,
            Payload::ObtainPriorInformation(_) => MessageType::ObtainPriorInformation,
            Payload::PrepareForCentring => MessageType::PrepareForCentring,
            Payload::RequestCentring(_) => MessageType::RequestCentring,
            Payload::ChooseLattice(_) => MessageType::ChooseLattice,
            Payload::CollectionProposal(_) => MessageType::CollectionProposal,
            Payload::SubprocessStarted { .. } => MessageType::SubprocessStarted,
            Payload::SubprocessStopped => MessageType::SubprocessStopped,
            Payload::Info { .. } => MessageType::Info,
            Payload::WorkflowCompleted => MessageType::WorkflowCompleted,
            Payload::WorkflowAborted => MessageType::WorkflowAborted,
            Payload::WorkflowFailed { .. } => MessageType::WorkflowFailed,
            Payload::ConfigurationData(_)
            | Payload::PriorInformation(_)
            | Payload::ReadyForCentring
            | Payload::CentringDone(_)
            | Payload::SelectedLattice(_)
            | Payload::CollectionDone(_)
            | Payload::BeamlineAbort(_) => return None,
        };
        Some(kind)
    }
}

/// Answer written into a response sink. `None` is the empty answer to a notification.
pub type Response = Option<Payload>;

/// One inbound engine call, consumed by exactly one handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Option<Payload>,
    pub correlation_id: Option<CorrelationId>,
    pub enactment_id: Option<EnactmentId>,
}

impl Message {
    /// Build a message whose type is taken from its payload.
    ///
    /// Response-only payloads have no message type and are reported as `Info`, which the
    /// dispatcher then rejects as a payload mismatch.
    pub fn from_payload(
        payload: Payload,
        enactment_id: impl Into<String>,
        correlation_id: Option<&str>,
    ) -> Self {
        Self {
            message_type: payload.message_type().unwrap_or(MessageType::Info),
            payload: Some(payload),
            correlation_id: correlation_id.map(CorrelationId::new),
            enactment_id: Some(EnactmentId::new(enactment_id)),
        }
    }
}
