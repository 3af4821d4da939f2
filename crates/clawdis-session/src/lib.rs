//! Session identity and persistence.
//!
//! Maps normalized envelopes to stable session keys, stores durable
//! per-session metadata in a single atomically-replaced snapshot file, and
//! appends per-session transcripts.

pub mod session_key;
pub mod session_store;
pub mod session_transcript;

pub use session_key::{group_display_name, resolve_session_key, GLOBAL_SESSION_KEY};
pub use session_store::{
    SessionEntry, SessionPatch, SessionStore, SessionUsageDelta, SESSION_STORE_SCHEMA_VERSION,
};
pub use session_transcript::{append_transcript, read_transcript, TranscriptRecord};
