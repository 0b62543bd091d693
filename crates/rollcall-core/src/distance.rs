//! Embedding distance metrics. Lower = more similar.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown distance metric: {0} (expected cosine, euclidean or euclidean_l2)")]
pub struct UnknownMetric(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`, in [0, 2].
    Cosine,
    /// L2 norm of `a - b`.
    Euclidean,
    /// L2 norm of `a - b` divided by the vector length.
    ///
    /// Not the usual "euclidean on L2-normalized vectors": thresholds tuned
    /// for existing deployments depend on this exact scaling.
    EuclideanL2,
}

impl DistanceMetric {
    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        }
    }

    /// Distance between `a` and `b` under this metric.
    ///
    /// Fails closed: vectors of different length, and zero vectors under
    /// cosine, yield `+inf` so they can never pass a threshold.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            tracing::warn!(
                left = a.len(),
                right = b.len(),
                metric = self.name(),
                "embedding dimension mismatch"
            );
            return f32::INFINITY;
        }

        match self {
            DistanceMetric::Cosine => cosine(a, b),
            DistanceMetric::Euclidean => euclidean(a, b),
            DistanceMetric::EuclideanL2 => {
                if a.is_empty() {
                    0.0
                } else {
                    euclidean(a, b) / a.len() as f32
                }
            }
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistanceMetric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "euclidean_l2" => Ok(DistanceMetric::EuclideanL2),
            other => Err(UnknownMetric(other.to_string())),
        }
    }
}

/// Distance under a metric given by name.
///
/// An unrecognized name logs an error and returns `+inf`.
pub fn distance_by_name(a: &[f32], b: &[f32], metric: &str) -> f32 {
    match metric.parse::<DistanceMetric>() {
        Ok(m) => m.distance(a, b),
        Err(e) => {
            tracing::error!(error = %e, "cannot compare embeddings");
            f32::INFINITY
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return f32::INFINITY;
    }

    (1.0 - dot / denom).clamp(0.0, 2.0) as f32
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}
