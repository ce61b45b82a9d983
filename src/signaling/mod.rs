//! Signaling Module - Call-Koordination über einen Key-Value Store
//!
//! Dieses Modul verwaltet den Austausch von Offer/Answer, ICE Candidates
//! und Status-Flags zwischen den Endpunkten:
//! - Store-Vertrag mit Publish/Read/Subscribe plus In-Memory-Backend
//! - Record-Typen für den Key-Space `{owner}/calls/{callId}/...`
//! - Zwei austauschbare Strategien: Push (Live-Subscription) und Poll
//!

mod channel;
mod poll;
mod push;
mod records;
mod store;

pub use channel::{CallRole, CallSignaling, SignalingEvent};
pub use poll::{PollSignaling, PollTuning};
pub use push::PushSignaling;
pub use records::{
    CallRecord, CallStatus, CandidateDirection, IceCandidateRecord, SignalingEnvelope,
};
pub use store::{CallPaths, MemoryStore, SignalingError, SignalingStore, StoreChange, StorePath};
