//! In-memory embedding store: one embedding per identity, in registration order.
//!
//! Enumeration order is the order identities were first registered. The
//! matcher breaks distance ties by this order, so re-registering an
//! identity replaces its embedding in place rather than moving it.

use crate::extractor::{
    extract_all, EmbeddingExtractor, ExtractedReference, ExtractionError, ReferenceImage,
};
use crate::types::{Embedding, EmbeddingError, Enrollment, Identity};
use serde::Serialize;

/// Counts from one rebuild. Skipped images are listed by identity key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub enrolled: usize,
    pub skipped_no_face: Vec<String>,
    pub skipped_multiple_faces: Vec<String>,
    pub skipped_invalid: Vec<String>,
}

impl RebuildReport {
    pub fn skipped(&self) -> usize {
        self.skipped_no_face.len() + self.skipped_multiple_faces.len() + self.skipped_invalid.len()
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    dimension: usize,
    entries: Vec<Enrollment>,
}

impl EmbeddingStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
        }
    }

    /// Build a store from persisted enrollments, keeping their order.
    pub fn from_enrollments(
        dimension: usize,
        enrollments: Vec<Enrollment>,
    ) -> Result<Self, EmbeddingError> {
        let mut store = Self::new(dimension);
        for enrollment in enrollments {
            store.register(enrollment.identity, enrollment.embedding)?;
        }
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Register or replace the embedding for an identity.
    ///
    /// Returns the previous enrollment when one was replaced.
    pub fn register(
        &mut self,
        identity: Identity,
        embedding: Embedding,
    ) -> Result<Option<Enrollment>, EmbeddingError> {
        embedding.check_dimension(self.dimension)?;

        let enrollment = Enrollment {
            identity,
            embedding,
        };
        match self.position(&enrollment.identity.key) {
            Some(idx) => Ok(Some(std::mem::replace(&mut self.entries[idx], enrollment))),
            None => {
                self.entries.push(enrollment);
                Ok(None)
            }
        }
    }

    /// Remove an identity's embedding. No-op when absent.
    pub fn remove(&mut self, key: &str) -> Option<Enrollment> {
        self.position(key).map(|idx| self.entries.remove(idx))
    }

    /// Put a previously removed or replaced enrollment back at `index`.
    pub(crate) fn restore(&mut self, index: usize, enrollment: Enrollment) {
        match self.position(&enrollment.identity.key) {
            Some(idx) => self.entries[idx] = enrollment,
            None => {
                let index = index.min(self.entries.len());
                self.entries.insert(index, enrollment);
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&Enrollment> {
        self.entries.iter().find(|e| e.identity.key == key)
    }

    pub fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.identity.key == key)
    }

    /// Current enrollments in enumeration order.
    pub fn all(&self) -> &[Enrollment] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rebuild the store from labeled reference images.
    ///
    /// All images are extracted before the store is touched; an extraction
    /// error leaves the current contents intact.
    pub fn rebuild(
        &mut self,
        sources: &[ReferenceImage],
        extractor: &mut dyn EmbeddingExtractor,
    ) -> Result<RebuildReport, ExtractionError> {
        let batch = extract_all(sources, extractor)?;
        Ok(self.apply_extractions(batch))
    }

    /// Replace the store contents with the single-face results of `batch`.
    ///
    /// Images with zero faces, several faces, or an embedding of the wrong
    /// dimension are skipped and reported, never registered.
    pub fn apply_extractions(&mut self, batch: Vec<ExtractedReference>) -> RebuildReport {
        let mut fresh = Self::new(self.dimension);
        let mut report = RebuildReport::default();

        for reference in batch {
            let key = reference.identity.key.clone();
            let mut faces = reference.faces;
            match faces.len() {
                0 => {
                    tracing::warn!(identity = %key, "enroll: no face in reference image, skipping");
                    report.skipped_no_face.push(key);
                }
                1 => {
                    let face = faces.remove(0);
                    match fresh.register(reference.identity, face.embedding) {
                        Ok(_) => tracing::debug!(identity = %key, "enroll: registered"),
                        Err(err) => {
                            tracing::warn!(identity = %key, error = %err, "enroll: unusable embedding, skipping");
                            report.skipped_invalid.push(key);
                        }
                    }
                }
                n => {
                    tracing::warn!(identity = %key, faces = n, "enroll: multiple faces in reference image, skipping");
                    report.skipped_multiple_faces.push(key);
                }
            }
        }

        report.enrolled = fresh.len();
        self.entries = fresh.entries;

        tracing::info!(
            enrolled = report.enrolled,
            skipped = report.skipped(),
            "embedding store rebuilt"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, FaceEmbedding, RawImage};

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    fn face(values: &[f32]) -> FaceEmbedding {
        FaceEmbedding {
            region: BoundingBox { x: 0.0, y: 0.0, width: 10.0, height: 10.0, confidence: None },
            embedding: emb(values),
        }
    }

    fn image(tag: u8) -> RawImage {
        RawImage { data: vec![tag; 3], width: 1, height: 1, source: None }
    }

    /// Returns the faces configured for each image, keyed by the first pixel byte.
    struct TableExtractor {
        table: Vec<Vec<FaceEmbedding>>,
    }

    impl EmbeddingExtractor for TableExtractor {
        fn extract(&mut self, image: &RawImage) -> Result<Vec<FaceEmbedding>, ExtractionError> {
            Ok(self.table[image.data[0] as usize].clone())
        }
    }

    struct FailingExtractor;

    impl EmbeddingExtractor for FailingExtractor {
        fn extract(&mut self, _image: &RawImage) -> Result<Vec<FaceEmbedding>, ExtractionError> {
            Err(ExtractionError::Failure("model crashed".into()))
        }
    }

    #[test]
    fn test_register_rejects_wrong_dimension() {
        let mut store = EmbeddingStore::new(3);
        let err = store.register(Identity::new("alice", "Alice"), emb(&[1.0, 2.0])).unwrap_err();
        assert_eq!(err, EmbeddingError::InvalidEmbedding { expected: 3, actual: 2 });
        assert!(store.is_empty());
    }

    #[test]
    fn test_reregister_overwrites_in_place() {
        let mut store = EmbeddingStore::new(2);
        store.register(Identity::new("alice", "Alice"), emb(&[1.0, 0.0])).unwrap();
        store.register(Identity::new("bob", "Bob"), emb(&[0.0, 1.0])).unwrap();
        let previous = store.register(Identity::new("alice", "Alice B"), emb(&[0.5, 0.5])).unwrap();

        assert_eq!(previous.unwrap().embedding.values(), &[1.0, 0.0]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.all()[0].identity.key, "alice");
        assert_eq!(store.all()[0].identity.display_name, "Alice B");
        assert_eq!(store.all()[0].embedding.values(), &[0.5, 0.5]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut store = EmbeddingStore::new(2);
        assert!(store.remove("nobody").is_none());
        store.register(Identity::new("alice", "Alice"), emb(&[1.0, 0.0])).unwrap();
        assert!(store.remove("alice").is_some());
        assert!(store.get("alice").is_none());
    }

    #[test]
    fn test_restore_returns_to_original_slot() {
        let mut store = EmbeddingStore::new(1);
        for key in ["a", "b", "c"] {
            store.register(Identity::new(key, key), emb(&[0.0])).unwrap();
        }
        let idx = store.position("b").unwrap();
        let removed = store.remove("b").unwrap();
        store.restore(idx, removed);
        let keys: Vec<_> = store.all().iter().map(|e| e.identity.key.as_str()).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn test_rebuild_skips_ambiguous_images() {
        let mut extractor = TableExtractor {
            table: vec![
                vec![face(&[1.0, 0.0])],
                vec![],
                vec![face(&[0.0, 1.0]), face(&[1.0, 1.0])],
                vec![face(&[1.0, 2.0, 3.0])],
            ],
        };
        let sources: Vec<ReferenceImage> = ["alice", "bob", "carol", "dave"]
            .iter()
            .enumerate()
            .map(|(i, key)| ReferenceImage {
                identity: Identity::from_file_stem(key),
                image: image(i as u8),
            })
            .collect();

        let mut store = EmbeddingStore::new(2);
        store.register(Identity::new("stale", "Stale"), emb(&[9.0, 9.0])).unwrap();
        let report = store.rebuild(&sources, &mut extractor).unwrap();

        assert_eq!(report.enrolled, 1);
        assert_eq!(report.skipped_no_face, vec!["bob".to_string()]);
        assert_eq!(report.skipped_multiple_faces, vec!["carol".to_string()]);
        assert_eq!(report.skipped_invalid, vec!["dave".to_string()]);
        assert_eq!(store.len(), 1);
        assert!(store.get("alice").is_some());
        assert!(store.get("stale").is_none());
    }

    #[test]
    fn test_rebuild_failure_leaves_store_untouched() {
        let mut store = EmbeddingStore::new(2);
        store.register(Identity::new("alice", "Alice"), emb(&[1.0, 0.0])).unwrap();
        let sources = vec![ReferenceImage { identity: Identity::new("bob", "Bob"), image: image(0) }];

        let err = store.rebuild(&sources, &mut FailingExtractor).unwrap_err();
        assert!(matches!(err, ExtractionError::Failure(_)));
        assert_eq!(store.len(), 1);
        assert!(store.get("alice").is_some());
    }
}
