//! Distance metrics and the approximate nearest-neighbor machinery built on them.

use std::str::FromStr;

use num_traits::Float;

use crate::error::SearchError;

pub mod heap_utils; // Bounded per-point candidate heaps
pub mod sampling;
pub mod rp_tree; // Random projection trees and forests
pub mod graph;
pub mod nn_descent;
pub mod pairwise;

/// Built-in distance functions, selectable by name.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Metric {
    Euclidean,
    SquaredEuclidean,
    Manhattan,
    Chebyshev,
    Minkowski { p: u32 }, // p is the order for Minkowski distance
    Cosine,
    Correlation,
    /// Number of coordinates differing by more than `threshold`.
    Hamming { threshold: f32 },
    /// The input matrix already holds pairwise distances; nothing is computed.
    Precomputed,
}

/// A pluggable distance function over two equal-length vectors.
///
/// Implementations must be symmetric, non-negative and return a finite value for
/// finite input. NaN or infinite results are reported as faults by the search.
pub trait Distance: Send + Sync {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;

    /// `true` for the sentinel meaning "the matrix is the distance table".
    fn is_precomputed(&self) -> bool {
        false
    }

    /// `true` when only the direction of a vector matters. Random projection trees
    /// normalize their hyperplanes for these metrics.
    fn is_angular(&self) -> bool {
        false
    }
}

impl Distance for Metric {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match *self {
            Metric::Euclidean => euclidean(a, b),
            Metric::SquaredEuclidean => squared_euclidean(a, b),
            Metric::Manhattan => manhattan(a, b),
            Metric::Chebyshev => chebyshev(a, b),
            Metric::Minkowski { p } => minkowski(a, b, p),
            Metric::Cosine => cosine(a, b),
            Metric::Correlation => correlation(a, b),
            Metric::Hamming { threshold } => hamming(a, b, threshold),
            Metric::Precomputed => {
                if cfg!(debug_assertions) {
                    panic!("Precomputed distances are read from the matrix; Metric::distance must not be called.");
                }
                // Release builds report the misuse through the fault path.
                f32::NAN
            }
        }
    }

    fn is_precomputed(&self) -> bool {
        matches!(self, Metric::Precomputed)
    }

    fn is_angular(&self) -> bool {
        matches!(self, Metric::Cosine | Metric::Correlation)
    }
}

/// Any thread-safe closure `(a, b) -> f32` can be used as a metric.
impl<D> Distance for D
where
    D: Fn(&[f32], &[f32]) -> f32 + Send + Sync,
{
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        self(a, b)
    }
}

impl FromStr for Metric {
    type Err = SearchError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            "sqeuclidean" | "squared_euclidean" => Ok(Metric::SquaredEuclidean),
            "manhattan" | "l1" | "taxicab" => Ok(Metric::Manhattan),
            "chebyshev" | "linf" | "linfinity" => Ok(Metric::Chebyshev),
            "minkowski" => Ok(Metric::Minkowski { p: 2 }),
            "cosine" => Ok(Metric::Cosine),
            "correlation" => Ok(Metric::Correlation),
            "hamming" => Ok(Metric::Hamming { threshold: 0.0 }),
            "precomputed" => Ok(Metric::Precomputed),
            _ => Err(SearchError::UnknownMetric(name.to_string())),
        }
    }
}

// --- Distance kernels ---

pub fn squared_euclidean<F: Float>(a: &[F], b: &[F]) -> F {
    a.iter().zip(b.iter()).fold(F::zero(), |acc, (&x, &y)| {
        let diff = x - y;
        acc + diff * diff
    })
}

pub fn euclidean<F: Float>(a: &[F], b: &[F]) -> F {
    squared_euclidean(a, b).sqrt()
}

pub fn manhattan<F: Float>(a: &[F], b: &[F]) -> F {
    a.iter().zip(b.iter()).fold(F::zero(), |acc, (&x, &y)| acc + (x - y).abs())
}

pub fn chebyshev<F: Float>(a: &[F], b: &[F]) -> F {
    a.iter().zip(b.iter()).fold(F::zero(), |acc, (&x, &y)| acc.max((x - y).abs()))
}

/// Minkowski distance of order `p`. Order 0 is the limit case: the number of
/// coordinates that differ.
pub fn minkowski<F: Float>(a: &[F], b: &[F], p: u32) -> F {
    match p {
        0 => hamming(a, b, F::zero()),
        1 => manhattan(a, b),
        2 => euclidean(a, b),
        _ => {
            let sum_of_powers = a
                .iter()
                .zip(b.iter())
                .fold(F::zero(), |acc, (&x, &y)| acc + (x - y).abs().powi(p as i32));
            // p >= 3 here, so the cast cannot fail for any real float type.
            let exponent = F::from(p).map_or(F::one(), |p_f| F::one() / p_f);
            sum_of_powers.powf(exponent)
        }
    }
}

/// 1 - cosine similarity. Two zero vectors are at distance 0, a zero vector and a
/// non-zero vector at distance 1.
pub fn cosine<F: Float>(a: &[F], b: &[F]) -> F {
    let (mut dot, mut norm_a, mut norm_b) = (F::zero(), F::zero(), F::zero());
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot = dot + x * y;
        norm_a = norm_a + x * x;
        norm_b = norm_b + y * y;
    }

    if norm_a == F::zero() && norm_b == F::zero() {
        return F::zero();
    }
    if norm_a == F::zero() || norm_b == F::zero() {
        return F::one();
    }

    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    // Clamp to [-1, 1] against rounding, which also keeps the distance non-negative.
    F::one() - similarity.max(-F::one()).min(F::one())
}

/// Cosine distance between the mean-centered vectors.
pub fn correlation<F: Float>(a: &[F], b: &[F]) -> F {
    if a.is_empty() {
        return F::zero();
    }
    let n = F::from(a.len()).unwrap_or_else(F::one);
    let mean_a = a.iter().fold(F::zero(), |acc, &x| acc + x) / n;
    let mean_b = b.iter().fold(F::zero(), |acc, &x| acc + x) / n;
    let centered_a: Vec<F> = a.iter().map(|&x| x - mean_a).collect();
    let centered_b: Vec<F> = b.iter().map(|&y| y - mean_b).collect();
    cosine(&centered_a, &centered_b)
}

pub fn hamming<F: Float>(a: &[F], b: &[F], threshold: F) -> F {
    let differing = a.iter().zip(b.iter()).filter(|&(&x, &y)| (x - y).abs() > threshold).count();
    F::from(differing).unwrap_or_else(F::zero)
}

pub(crate) fn dot<F: Float>(a: &[F], b: &[F]) -> F {
    a.iter().zip(b.iter()).fold(F::zero(), |acc, (&x, &y)| acc + x * y)
}
