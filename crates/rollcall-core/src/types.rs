use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("invalid embedding: expected {expected} dimensions, got {actual}")]
    InvalidEmbedding { expected: usize, actual: usize },
    #[error("invalid embedding: component {index} is not finite")]
    NonFinite { index: usize },
    #[error("invalid embedding: vector is empty")]
    Empty,
}

/// Bounding box for a detected face region, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence, when the extractor reports one.
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Face embedding vector (128-dimensional under the default configuration).
///
/// Components are guaranteed finite. The vector is immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, EmbeddingError> {
        if values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(EmbeddingError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Fail with `InvalidEmbedding` unless this vector has `expected` components.
    pub fn check_dimension(&self, expected: usize) -> Result<(), EmbeddingError> {
        if self.values.len() == expected {
            Ok(())
        } else {
            Err(EmbeddingError::InvalidEmbedding {
                expected,
                actual: self.values.len(),
            })
        }
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Callers compare equal-length vectors; extra components of the longer
    /// vector are ignored.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = EmbeddingError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Embedding::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

/// An enrolled individual. The key is the stable identifier used by the
/// ledger and roster; it never changes after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub key: String,
    pub display_name: String,
    #[serde(default)]
    pub external_id: Option<String>,
}

impl Identity {
    pub fn new(key: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            display_name: display_name.into(),
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Identity derived from a reference image file stem: `jane_doe` is
    /// displayed as `Jane Doe`.
    pub fn from_file_stem(stem: &str) -> Self {
        let display_name = stem
            .split('_')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => {
                        first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                    }
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(stem, display_name)
    }
}

/// A stored identity together with its single embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub identity: Identity,
    pub embedding: Embedding,
}

/// Decoded RGB8 image handed to an embedding extractor.
#[derive(Debug, Clone)]
pub struct RawImage {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// File the image was read from, if any.
    pub source: Option<std::path::PathBuf>,
}

/// One face found by an extractor: where it is, and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// Outcome of matching one probe embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MatchOutcome {
    Known { identity: String, display_name: String },
    Unknown,
}

/// Result of matching a probe embedding against the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub outcome: MatchOutcome,
    /// Euclidean distance to the closest stored embedding; `+inf` when the
    /// store is empty.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            outcome: MatchOutcome::Unknown,
            distance,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match &self.outcome {
            MatchOutcome::Known { identity, .. } => Some(identity),
            MatchOutcome::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self.outcome, MatchOutcome::Known { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec()).unwrap()
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = emb(&[0.1, 0.2, 0.3]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_embedding_rejects_non_finite() {
        assert_eq!(
            Embedding::new(vec![0.0, f32::NAN]),
            Err(EmbeddingError::NonFinite { index: 1 })
        );
        assert_eq!(Embedding::new(vec![]), Err(EmbeddingError::Empty));
    }

    #[test]
    fn test_check_dimension() {
        let a = emb(&[1.0, 2.0, 3.0]);
        assert!(a.check_dimension(3).is_ok());
        assert_eq!(
            a.check_dimension(128),
            Err(EmbeddingError::InvalidEmbedding { expected: 128, actual: 3 })
        );
    }

    #[test]
    fn test_embedding_deserialize_validates() {
        let ok: Embedding = serde_json::from_str("[0.5, -0.25]").unwrap();
        assert_eq!(ok.values(), &[0.5, -0.25]);
        assert!(serde_json::from_str::<Embedding>("[]").is_err());
    }

    #[test]
    fn test_identity_from_file_stem() {
        let id = Identity::from_file_stem("jane_SMITH");
        assert_eq!(id.key, "jane_SMITH");
        assert_eq!(id.display_name, "Jane Smith");
        assert_eq!(id.external_id, None);
    }
}
