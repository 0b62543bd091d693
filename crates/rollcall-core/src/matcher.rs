//! Nearest-match search over the embedding gallery.

use crate::distance::DistanceMetric;
use crate::types::{Embedding, Gallery, MatchCandidate};

/// Strategy for resolving a query embedding to an enrolled identity.
///
/// Callers only see this trait, so an indexed implementation can replace the
/// linear scan without touching the recognition pipeline.
pub trait MatchResolver: Send + Sync {
    fn metric(&self) -> DistanceMetric;

    fn find_best_match(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchCandidate;

    /// Resolve each query independently against the same gallery.
    fn batch_find_matches(
        &self,
        queries: &[Embedding],
        gallery: &Gallery,
        threshold: f32,
    ) -> Vec<MatchCandidate> {
        queries
            .iter()
            .map(|q| self.find_best_match(q, gallery, threshold))
            .collect()
    }
}

/// Exhaustive scan: O(identities × dimensions) per query.
///
/// Fine for a classroom-sized gallery (tens to a few hundred identities);
/// larger galleries need an approximate nearest-neighbour index.
pub struct LinearScanResolver {
    metric: DistanceMetric,
}

impl LinearScanResolver {
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric }
    }
}

impl MatchResolver for LinearScanResolver {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn find_best_match(&self, query: &Embedding, gallery: &Gallery, threshold: f32) -> MatchCandidate {
        if gallery.is_empty() {
            tracing::warn!("gallery is empty, no identities to match against");
            return MatchCandidate::rejected(f32::INFINITY);
        }

        let mut best_distance = f32::INFINITY;
        let mut best_identity: Option<&str> = None;

        // Strict `<`: on ties the first identity in gallery order wins.
        for (identity, embedding) in gallery {
            let d = self.metric.distance(query.as_slice(), embedding.as_slice());
            if d < best_distance {
                best_distance = d;
                best_identity = Some(identity.as_str());
            }
        }

        match best_identity {
            Some(identity) if best_distance <= threshold => {
                tracing::debug!(
                    identity,
                    distance = best_distance,
                    confidence = 1.0 - best_distance,
                    "best match accepted"
                );
                MatchCandidate::matched(identity, best_distance)
            }
            _ => {
                tracing::debug!(distance = best_distance, threshold, "best distance exceeds threshold");
                MatchCandidate::rejected(best_distance)
            }
        }
    }
}
