//! Extraction worker: runs the embedding extractor on a dedicated OS thread.
//!
//! Async callers talk to the worker over a bounded channel and wait on a
//! oneshot reply with a deadline. A request that misses the deadline fails
//! with [`ExtractionError::Timeout`]; the worker finishes it in the
//! background and its result is dropped.

use crate::extractor::{EmbeddingExtractor, ExtractedReference, ExtractionError, ReferenceImage};
use crate::types::{FaceEmbedding, RawImage};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Messages sent from async callers to the worker thread.
enum ExtractRequest {
    Extract {
        image: RawImage,
        reply: oneshot::Sender<Result<Vec<FaceEmbedding>, ExtractionError>>,
    },
}

/// Clone-safe handle to the extraction worker.
#[derive(Clone)]
pub struct ExtractorHandle {
    tx: mpsc::Sender<ExtractRequest>,
    timeout: Duration,
}

impl ExtractorHandle {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Extract face embeddings from one image.
    pub async fn extract(&self, image: RawImage) -> Result<Vec<FaceEmbedding>, ExtractionError> {
        let timeout = self.timeout;
        let request = async {
            let (reply_tx, reply_rx) = oneshot::channel();
            self.tx
                .send(ExtractRequest::Extract {
                    image,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| ExtractionError::Failure("extraction worker exited".into()))?;
            reply_rx
                .await
                .map_err(|_| ExtractionError::Failure("extraction worker exited".into()))?
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "extraction timed out");
                Err(ExtractionError::Timeout(timeout))
            }
        }
    }

    /// Extract every reference image in order, stopping at the first error.
    ///
    /// The returned batch is meant for `EmbeddingStore::apply_extractions`.
    pub async fn extract_references(
        &self,
        sources: Vec<ReferenceImage>,
    ) -> Result<Vec<ExtractedReference>, ExtractionError> {
        let mut batch = Vec::with_capacity(sources.len());
        for source in sources {
            let faces = self.extract(source.image).await.map_err(|err| {
                tracing::error!(identity = %source.identity.key, error = %err, "reference extraction failed");
                err
            })?;
            batch.push(ExtractedReference {
                identity: source.identity,
                faces,
            });
        }
        Ok(batch)
    }
}

/// Spawn the extraction worker on a dedicated OS thread.
///
/// Each request waits at most `timeout` for its reply.
pub fn spawn_extractor<E>(mut extractor: E, timeout: Duration) -> Result<ExtractorHandle, ExtractionError>
where
    E: EmbeddingExtractor + 'static,
{
    let (tx, mut rx) = mpsc::channel::<ExtractRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-extractor".into())
        .spawn(move || {
            tracing::info!("extraction worker started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    ExtractRequest::Extract { image, reply } => {
                        let result = extractor.extract(&image);
                        if let Ok(faces) = &result {
                            tracing::debug!(faces = faces.len(), "extracted");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("extraction worker exiting");
        })
        .map_err(|e| ExtractionError::Failure(format!("failed to spawn extraction worker: {e}")))?;

    Ok(ExtractorHandle { tx, timeout })
}
