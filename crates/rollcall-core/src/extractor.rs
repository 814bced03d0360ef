//! Embedding extractor capability.
//!
//! Turning pixels into embeddings happens outside this crate; callers plug
//! in a model through [`EmbeddingExtractor`].

use crate::types::{FaceEmbedding, Identity, RawImage};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("embedding extraction timed out after {0:?}")]
    Timeout(Duration),
    #[error("embedding extraction failed: {0}")]
    Failure(String),
}

/// Produces zero or more face embeddings for an image.
///
/// Results must come back in a stable order for a given call; they are
/// aligned one-to-one with the face regions they describe.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, image: &RawImage) -> Result<Vec<FaceEmbedding>, ExtractionError>;
}

impl<E: EmbeddingExtractor + ?Sized> EmbeddingExtractor for Box<E> {
    fn extract(&mut self, image: &RawImage) -> Result<Vec<FaceEmbedding>, ExtractionError> {
        (**self).extract(image)
    }
}

/// A reference photo labeled with the identity it enrolls.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub identity: Identity,
    pub image: RawImage,
}

/// Extractor output for one reference photo, before store policy is applied.
#[derive(Debug, Clone)]
pub struct ExtractedReference {
    pub identity: Identity,
    pub faces: Vec<FaceEmbedding>,
}

/// Extract every reference in order, stopping at the first error.
pub fn extract_all(
    sources: &[ReferenceImage],
    extractor: &mut dyn EmbeddingExtractor,
) -> Result<Vec<ExtractedReference>, ExtractionError> {
    sources
        .iter()
        .map(|source| {
            Ok(ExtractedReference {
                identity: source.identity.clone(),
                faces: extractor.extract(&source.image)?,
            })
        })
        .collect()
}
