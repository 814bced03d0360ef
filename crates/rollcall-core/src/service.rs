//! Attendance service: the operations callers use, composed from the
//! store, matcher, ledger and roster.
//!
//! Locking:
//! - the embedding store sits behind an `RwLock`;
//! - ledger and roster share one `Mutex`, so a mark, its roster update and
//!   both writes happen as one step.
//!
//! When both are needed the store lock is taken first. `recognize_and_mark`
//! keeps its store read guard until every mark is committed, so a removal
//! cannot slip between a match and its mark.

use crate::absence;
use crate::category::CategorySet;
use crate::config::Config;
use crate::engine::ExtractorHandle;
use crate::extractor::{
    extract_all, EmbeddingExtractor, ExtractedReference, ExtractionError, ReferenceImage,
};
use crate::ledger::{AttendanceLedger, DayKey, DayLedger, LedgerError, MarkOutcome};
use crate::matcher::{match_all, EuclideanMatcher, Matcher};
use crate::persistence::{Gallery, JsonDirectory, Persistence, PersistenceError};
use crate::report::{self, CategoryReport, IdentityReport};
use crate::roster::{Retirements, Roster, Standing};
use crate::store::{EmbeddingStore, RebuildReport};
use crate::types::{BoundingBox, Embedding, EmbeddingError, Enrollment, FaceEmbedding, Identity, MatchResult};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("invalid category: {0}")]
    InvalidCategory(String),
    #[error("identity key is empty")]
    EmptyIdentity,
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("service state lock poisoned")]
    LockPoisoned,
}

impl From<LedgerError> for AttendanceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidCategory(c) => Self::InvalidCategory(c),
            LedgerError::EmptyIdentity => Self::EmptyIdentity,
            LedgerError::Persistence(e) => Self::Persistence(e),
        }
    }
}

/// One face of a frame after matching and, if recognized, marking.
#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub region: BoundingBox,
    #[serde(rename = "match")]
    pub result: MatchResult,
    pub mark: Option<MarkOutcome>,
}

/// Ledger, roster and retired cells, mutated together.
struct Books {
    ledger: AttendanceLedger,
    roster: Roster,
    retired: Retirements,
}

pub struct AttendanceService {
    persistence: Arc<dyn Persistence>,
    categories: CategorySet,
    matcher: Box<dyn Matcher>,
    store: RwLock<EmbeddingStore>,
    books: Mutex<Books>,
}

impl AttendanceService {
    /// Open the service over JSON files in the configured directories.
    pub fn open_dir(config: &Config) -> Result<Self, AttendanceError> {
        let persistence = Arc::new(JsonDirectory::new(&config.data_dir, &config.records_dir));
        Self::open(config, persistence)
    }

    /// Load the gallery and roster, and reconcile the roster with ledger history.
    ///
    /// The replay (minus retired cells) is authoritative: drifted counters
    /// are overwritten and the repaired roster is saved.
    pub fn open(config: &Config, persistence: Arc<dyn Persistence>) -> Result<Self, AttendanceError> {
        let store = match persistence.load_gallery()? {
            Some(gallery) => load_store(config.embedding_dim, gallery)?,
            None => EmbeddingStore::new(config.embedding_dim),
        };

        let mut ledger = AttendanceLedger::open(persistence.clone(), config.categories.clone())?;
        let retired = persistence.load_retired()?;
        let roster = Roster::replay(ledger.history()?, &retired);

        match persistence.load_roster()? {
            None => {
                if roster != Roster::new() {
                    tracing::info!("no roster file; rebuilt from ledger history");
                    persistence.save_roster(&roster)?;
                }
            }
            Some(persisted) => {
                let drifted = persisted.diff_identities(&roster);
                if !drifted.is_empty() {
                    for identity in &drifted {
                        tracing::warn!(identity = %identity, "roster counters differ from ledger replay");
                    }
                    tracing::warn!(identities = drifted.len(), "roster drifted from ledger; replayed counters restored");
                    persistence.save_roster(&roster)?;
                }
            }
        }

        tracing::info!(
            identities = store.len(),
            dimension = store.dimension(),
            threshold = config.match_threshold,
            categories = config.categories.len(),
            "attendance service opened"
        );

        Ok(Self {
            persistence,
            categories: config.categories.clone(),
            matcher: Box::new(EuclideanMatcher::new(config.match_threshold)),
            store: RwLock::new(store),
            books: Mutex::new(Books {
                ledger,
                roster,
                retired,
            }),
        })
    }

    /// Replace the default Euclidean matcher.
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn categories(&self) -> &CategorySet {
        &self.categories
    }

    fn read_store(&self) -> Result<RwLockReadGuard<'_, EmbeddingStore>, AttendanceError> {
        self.store.read().map_err(|_| AttendanceError::LockPoisoned)
    }

    fn write_store(&self) -> Result<RwLockWriteGuard<'_, EmbeddingStore>, AttendanceError> {
        self.store.write().map_err(|_| AttendanceError::LockPoisoned)
    }

    fn lock_books(&self) -> Result<MutexGuard<'_, Books>, AttendanceError> {
        self.books.lock().map_err(|_| AttendanceError::LockPoisoned)
    }

    fn save_gallery(&self, store: &EmbeddingStore) -> Result<(), PersistenceError> {
        self.persistence.save_gallery(&Gallery {
            dimension: store.dimension(),
            enrollments: store.all().to_vec(),
        })
    }

    /// Register or replace an identity's embedding. Returns the replaced enrollment.
    pub fn register_identity(
        &self,
        identity: Identity,
        embedding: Embedding,
    ) -> Result<Option<Enrollment>, AttendanceError> {
        if identity.key.trim().is_empty() {
            return Err(AttendanceError::EmptyIdentity);
        }
        let mut store = self.write_store()?;
        let key = identity.key.clone();
        let slot = store.position(&key);
        let previous = store.register(identity, embedding)?;

        if let Err(err) = self.save_gallery(&store) {
            tracing::error!(identity = %key, error = %err, "gallery write failed; registration undone");
            match (slot, previous) {
                (Some(idx), Some(prev)) => store.restore(idx, prev),
                _ => {
                    store.remove(&key);
                }
            }
            return Err(err.into());
        }

        tracing::info!(identity = %key, replaced = previous.is_some(), "identity registered");
        Ok(previous)
    }

    /// Remove an identity's embedding and roster counters. Day ledgers are kept.
    ///
    /// The identity's current ledger cells are retired, so neither a reopen
    /// nor `rebuild_roster` counts them again if the key comes back.
    /// Returns false when there was nothing to remove.
    pub fn remove_identity(&self, key: &str) -> Result<bool, AttendanceError> {
        let mut store = self.write_store()?;
        let mut guard = self.lock_books()?;
        let books = &mut *guard;

        if store.position(key).is_none() && !books.roster.contains(key) {
            return Ok(false);
        }

        let mut retired = books.retired.clone();
        let newly_retired = retired.retire(key, books.ledger.history()?);
        let slot = store.position(key);
        let removed = store.remove(key);
        let counters = books.roster.remove(key);

        let written = self.persist_removal(
            removed.is_some().then_some(&*store),
            newly_retired.then_some(&retired),
            counters.is_some().then_some(&books.roster),
        );
        if let Err(err) = written {
            tracing::error!(identity = key, error = %err, "removal write failed; removal undone");
            if let Some(counters) = counters {
                books.roster.insert(key, counters);
            }
            if newly_retired {
                if let Err(err) = self.persistence.save_retired(&books.retired) {
                    tracing::error!(identity = key, error = %err, "retired cells restore failed");
                }
            }
            if let (Some(idx), Some(enrollment)) = (slot, removed) {
                store.restore(idx, enrollment);
                if let Err(err) = self.save_gallery(&store) {
                    tracing::error!(identity = key, error = %err, "gallery restore failed");
                }
            }
            return Err(err.into());
        }

        books.retired = retired;
        tracing::info!(identity = key, retired = newly_retired, "identity removed");
        Ok(true)
    }

    /// Gallery, retired cells, then roster; each only when it changed.
    fn persist_removal(
        &self,
        store: Option<&EmbeddingStore>,
        retired: Option<&Retirements>,
        roster: Option<&Roster>,
    ) -> Result<(), PersistenceError> {
        if let Some(store) = store {
            self.save_gallery(store)?;
        }
        if let Some(retired) = retired {
            self.persistence.save_retired(retired)?;
        }
        if let Some(roster) = roster {
            self.persistence.save_roster(roster)?;
        }
        Ok(())
    }

    /// Registered identities in enumeration order.
    pub fn identities(&self) -> Result<Vec<Identity>, AttendanceError> {
        Ok(self
            .read_store()?
            .all()
            .iter()
            .map(|e| e.identity.clone())
            .collect())
    }

    /// Match every probe embedding of a frame, in input order.
    pub fn match_frame(&self, probes: &[Embedding]) -> Result<Vec<MatchResult>, AttendanceError> {
        let store = self.read_store()?;
        for probe in probes {
            probe.check_dimension(store.dimension())?;
        }
        Ok(match_all(self.matcher.as_ref(), probes, store.all()))
    }

    /// Mark attendance for one identity and category at `now`.
    pub fn mark_attendance(
        &self,
        identity: &str,
        category: &str,
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, AttendanceError> {
        let mut books = self.lock_books()?;
        self.commit_mark(&mut books, identity, category, now)
    }

    /// Ledger mark plus roster update as one unit; rolls the ledger back if
    /// the roster cannot be persisted.
    fn commit_mark(
        &self,
        books: &mut Books,
        identity: &str,
        category: &str,
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, AttendanceError> {
        let outcome = books.ledger.mark(identity, category, now)?;
        if !outcome.newly_marked {
            tracing::debug!(identity, category, day = %outcome.day, time = %outcome.time, "already marked");
            return Ok(outcome);
        }

        books.roster.on_mark(identity, &outcome.category, true);
        if let Err(err) = self.persistence.save_roster(&books.roster) {
            tracing::error!(identity, category, day = %outcome.day, error = %err, "roster write failed; rolling back mark");
            books.roster.revert_mark(identity, &outcome.category);
            if let Err(rollback) = books.ledger.revert(&outcome) {
                tracing::error!(identity, category, day = %outcome.day, error = %rollback, "ledger rollback failed; roster will be repaired on next open");
            }
            return Err(err.into());
        }

        tracing::info!(identity, category, day = %outcome.day, time = %outcome.time, "attendance marked");
        Ok(outcome)
    }

    /// Match each face of a frame and mark every recognized identity.
    ///
    /// The category is checked before anything is matched. Faces are handled
    /// in order; a persistence failure stops processing, leaving earlier
    /// faces' marks committed.
    pub fn recognize_and_mark(
        &self,
        faces: &[FaceEmbedding],
        category: &str,
        now: NaiveDateTime,
    ) -> Result<Vec<Recognition>, AttendanceError> {
        if !self.categories.contains(category) {
            return Err(AttendanceError::InvalidCategory(category.to_string()));
        }

        let store = self.read_store()?;
        for face in faces {
            face.embedding.check_dimension(store.dimension())?;
        }
        let probes: Vec<Embedding> = faces.iter().map(|f| f.embedding.clone()).collect();
        let results = match_all(self.matcher.as_ref(), &probes, store.all());

        let mut books = self.lock_books()?;
        let mut recognitions = Vec::with_capacity(faces.len());
        for (face, result) in faces.iter().zip(results) {
            let mark = match result.identity() {
                Some(identity) => Some(self.commit_mark(&mut books, identity, category, now)?),
                None => None,
            };
            recognitions.push(Recognition {
                region: face.region,
                result,
                mark,
            });
        }
        Ok(recognitions)
    }

    /// Per-category counters for one identity.
    pub fn roster_snapshot(&self, identity: &str) -> Result<Vec<Standing>, AttendanceError> {
        Ok(self.lock_books()?.roster.snapshot(identity))
    }

    /// Days, ascending, on which `identity` has no mark for `category`.
    pub fn absent_dates(&self, identity: &str, category: &str) -> Result<Vec<DayKey>, AttendanceError> {
        if !self.categories.contains(category) {
            return Err(AttendanceError::InvalidCategory(category.to_string()));
        }
        let mut books = self.lock_books()?;
        let history = books.ledger.history()?;
        Ok(absence::absent_dates(identity, category, history))
    }

    /// The ledger for one day; empty when nothing was recorded.
    pub fn day_attendance(&self, day: DayKey) -> Result<DayLedger, AttendanceError> {
        Ok(self.lock_books()?.ledger.day(day)?)
    }

    /// Replace the roster with a replay of ledger history.
    pub fn rebuild_roster(&self) -> Result<(), AttendanceError> {
        let mut guard = self.lock_books()?;
        let books = &mut *guard;
        let replayed = Roster::replay(books.ledger.history()?, &books.retired);
        self.persistence.save_roster(&replayed)?;
        books.roster = replayed;
        tracing::info!("roster rebuilt from ledger history");
        Ok(())
    }

    /// Rebuild the store from reference images with a synchronous extractor.
    ///
    /// Extraction finishes before the store is locked; matching and
    /// registration are not blocked while it runs.
    pub fn rebuild_store(
        &self,
        sources: &[ReferenceImage],
        extractor: &mut dyn EmbeddingExtractor,
    ) -> Result<RebuildReport, AttendanceError> {
        let batch = extract_all(sources, extractor)?;
        self.replace_gallery(batch)
    }

    /// Rebuild the store through the extraction worker.
    pub async fn rebuild_store_with(
        &self,
        extractor: &ExtractorHandle,
        sources: Vec<ReferenceImage>,
    ) -> Result<RebuildReport, AttendanceError> {
        let batch = extractor.extract_references(sources).await?;
        self.replace_gallery(batch)
    }

    /// Apply an already extracted batch as the new store contents.
    pub fn replace_gallery(&self, batch: Vec<ExtractedReference>) -> Result<RebuildReport, AttendanceError> {
        let mut store = self.write_store()?;
        let backup = store.clone();
        let report = store.apply_extractions(batch);
        if let Err(err) = self.save_gallery(&store) {
            *store = backup;
            return Err(err.into());
        }
        Ok(report)
    }

    /// Standing in every configured category, with absences.
    pub fn identity_report(&self, identity: &str) -> Result<IdentityReport, AttendanceError> {
        let store = self.read_store()?;
        let mut books = self.lock_books()?;
        let display_name = store.get(identity).map(|e| e.identity.display_name.clone());
        if display_name.is_none() && !books.roster.contains(identity) {
            return Err(AttendanceError::UnknownIdentity(identity.to_string()));
        }

        let Books { ledger, roster, .. } = &mut *books;
        let history = ledger.history()?;
        Ok(report::identity_report(identity, display_name, &self.categories, roster, history))
    }

    /// Every registered identity's standing in one category, with `today`'s marks.
    pub fn category_report(&self, category: &str, today: DayKey) -> Result<CategoryReport, AttendanceError> {
        let category = self
            .categories
            .resolve(category)
            .cloned()
            .ok_or_else(|| AttendanceError::InvalidCategory(category.to_string()))?;
        let members = self.identities()?;

        let mut books = self.lock_books()?;
        let Books { ledger, roster, .. } = &mut *books;
        let history = ledger.history()?;
        Ok(report::category_report(&category, today, &members, roster, history))
    }
}

fn load_store(dimension: usize, gallery: Gallery) -> Result<EmbeddingStore, PersistenceError> {
    if gallery.dimension != dimension {
        return Err(PersistenceError::Malformed {
            what: "gallery".into(),
            reason: format!(
                "stored dimension {} does not match configured {dimension}",
                gallery.dimension
            ),
        });
    }
    EmbeddingStore::from_enrollments(dimension, gallery.enrollments).map_err(|e| {
        PersistenceError::Malformed {
            what: "gallery".into(),
            reason: e.to_string(),
        }
    })
}
