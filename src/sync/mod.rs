//! Multi-device synchronization.
//!
//! Two or more devices each hold a full local replica. They rendezvous in an
//! ephemeral relay session and reconcile directly through it:
//!
//! - `registry`: relay-side session bookkeeping (join, leave, broadcast, expiry)
//! - `protocol`: wire envelope, payloads, and the metadata diff
//! - `engine`: per-device state machine driving one sync
//! - `merge`: last-write-wins record merge
//! - `batch`: chunked SYNC_DATA transfer and reassembly tracking
//! - `pairing`: out-of-band pairing codes
//! - `client`: WebSocket transport for the engine

pub mod batch;
pub mod client;
pub mod engine;
pub mod error;
pub mod merge;
pub mod pairing;
pub mod protocol;
pub mod registry;

pub use client::{run_sync, ClientOptions};
pub use engine::{EngineOptions, SyncEngine, SyncProgress, SyncState};
pub use error::SyncError;
pub use merge::{lww_resolve, merge_record, MergeReport};
pub use pairing::PairingPayload;
pub use protocol::{MessageType, ProtocolError, SyncMessage, SyncPlan};
pub use registry::{RegistryError, SessionHandle, SessionRegistry};
