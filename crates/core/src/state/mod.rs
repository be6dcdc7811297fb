//! # State
//!
//! Session data model and persistence.
//!
//! - `session` - `GenerationSession` and its stage results
//! - `store` - versioned key/value contract and backend selection
//! - `remote_store`, `sqlite_store`, `memory_store` - the backends, in priority order
//! - `repository` - typed read-modify-write access with conflict retries

pub mod memory_store;
pub mod remote_store;
pub mod repository;
pub mod session;
pub mod sqlite_store;
pub mod store;

pub use memory_store::MemorySessionStore;
pub use remote_store::RemoteSessionStore;
pub use repository::{session_key, SessionRepository};
pub use session::{
    ConversationEntry, EntryRole, GenerationSession, QualityProfile, RankedSelection, SessionInput,
    StagePayload, StageResult, StoryboardFrame, VideoClip,
};
pub use sqlite_store::SqliteSessionStore;
pub use store::{
    open_session_store, Deployment, PutOutcome, SessionStore, StoreBackend, StoreConfig,
    StoredRecord,
};
