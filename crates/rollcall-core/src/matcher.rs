//! Probe-to-gallery matching.
//!
//! Distance is Euclidean over the raw embedding components. A candidate is
//! accepted only when its distance is strictly below the threshold.

use crate::types::{Embedding, Enrollment, MatchOutcome, MatchResult};

/// Default acceptance threshold for 128-dimensional embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.5;

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher: Send + Sync {
    fn compare(&self, probe: &Embedding, gallery: &[Enrollment]) -> MatchResult;
}

/// Nearest-neighbour matcher using Euclidean distance.
///
/// Iterates the whole gallery. On an exact distance tie the earlier gallery
/// entry wins.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &[Enrollment]) -> MatchResult {
        let mut best_dist = f32::INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, enrollment) in gallery.iter().enumerate() {
            let dist = probe.euclidean_distance(&enrollment.embedding);
            // Strict comparison keeps the earliest entry on ties.
            if best_idx.is_none() || dist < best_dist {
                best_dist = dist;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_dist < self.threshold => MatchResult {
                outcome: MatchOutcome::Known {
                    identity: gallery[idx].identity.key.clone(),
                    display_name: gallery[idx].identity.display_name.clone(),
                },
                distance: best_dist,
            },
            _ => MatchResult::unknown(best_dist),
        }
    }
}

/// Match each probe independently, preserving input order.
pub fn match_all(
    matcher: &dyn Matcher,
    probes: &[Embedding],
    gallery: &[Enrollment],
) -> Vec<MatchResult> {
    probes.iter().map(|probe| matcher.compare(probe, gallery)).collect()
}
