//! Record-Typen für den Signaling Store
//!
//! Diese Strukturen bilden den abstrakten Key-Space
//! `{owner}/calls/{callId}/...` ab und ermöglichen typsichere
//! Reads/Writes unabhängig vom konkreten Store-Backend.

use crate::engine::{IceCandidate, SdpKind, SessionDescription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// CALL STATUS
// ============================================================================

/// Status-Flag eines Call-Records im Store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
    Rejected,
    Missed,
    Failed,
}

impl CallStatus {
    /// Terminale Status beenden jede Warteschleife auf der Gegenseite
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Ringing | CallStatus::Active)
    }
}

// ============================================================================
// CALL RECORD
// ============================================================================

/// Signaling-seitiger Call-Record.
///
/// Bleibt nach Call-Ende für Audit-Zwecke im Store liegen - der Core
/// besitzt ihn nicht, er schreibt ihn nur.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub caller: String,
    pub callee: String,
    #[serde(rename = "isVideo")]
    pub is_video: bool,
    #[serde(rename = "isUserCall")]
    pub is_user_call: bool,
    pub status: CallStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "answeredAt", skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    #[serde(rename = "endedAt", skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

// ============================================================================
// SIGNALING ENVELOPE
// ============================================================================

/// Offer oder Answer im Store.
///
/// Pro Negotiation-Runde genau ein Offer und höchstens ein Answer;
/// Writes haben Overwrite-Semantik (ICE Restart publiziert ein frisches
/// Offer auf denselben Pfad).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl From<SessionDescription> for SignalingEnvelope {
    fn from(desc: SessionDescription) -> Self {
        Self {
            kind: desc.kind,
            sdp: desc.sdp,
        }
    }
}

impl From<SignalingEnvelope> for SessionDescription {
    fn from(env: SignalingEnvelope) -> Self {
        Self {
            kind: env.kind,
            sdp: env.sdp,
        }
    }
}

// ============================================================================
// ICE CANDIDATE RECORD
// ============================================================================

/// Adressat eines Candidate-Records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CandidateDirection {
    ToCaller,
    ToCallee,
}

impl CandidateDirection {
    /// Store-Segment der zugehörigen Candidate-Liste
    pub fn segment(&self) -> &'static str {
        match self {
            CandidateDirection::ToCaller => "ice_toCaller",
            CandidateDirection::ToCallee => "ice_toCallee",
        }
    }
}

/// Ein Eintrag der append-only Candidate-Liste
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    pub direction: CandidateDirection,
}

impl IceCandidateRecord {
    pub fn new(candidate: IceCandidate, direction: CandidateDirection) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            direction,
        }
    }
}

impl From<IceCandidateRecord> for IceCandidate {
    fn from(rec: IceCandidateRecord) -> Self {
        Self {
            candidate: rec.candidate,
            sdp_mid: rec.sdp_mid,
            sdp_mline_index: rec.sdp_mline_index,
        }
    }
}
