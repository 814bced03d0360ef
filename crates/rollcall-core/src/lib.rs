//! rollcall-core: face identity matching and per-day attendance ledger.
//!
//! Probe embeddings are matched against an in-memory embedding store by
//! Euclidean distance. Recognized identities are marked at most once per
//! day and category in a write-through, day-sharded ledger, and a roster of
//! present/total counters is kept in step with it.

pub mod absence;
pub mod category;
pub mod config;
pub mod engine;
pub mod extractor;
pub mod ledger;
pub mod matcher;
pub mod persistence;
pub mod references;
pub mod report;
pub mod roster;
pub mod service;
pub mod store;
pub mod types;

pub use category::{Category, CategorySet};
pub use config::Config;
pub use engine::{spawn_extractor, ExtractorHandle};
pub use extractor::{EmbeddingExtractor, ExtractedReference, ExtractionError, ReferenceImage};
pub use ledger::{AttendanceLedger, DayKey, DayLedger, MarkOutcome, MarkTime};
pub use matcher::{EuclideanMatcher, Matcher};
pub use persistence::{JsonDirectory, MemoryPersistence, Persistence, PersistenceError};
pub use roster::{Retirements, Roster, RosterEntry, RosterError, Standing};
pub use service::{AttendanceError, AttendanceService, Recognition};
pub use store::{EmbeddingStore, RebuildReport};
pub use types::{
    BoundingBox, Embedding, EmbeddingError, Enrollment, FaceEmbedding, Identity, MatchOutcome,
    MatchResult, RawImage,
};
