//! Brute-force distances: full pairwise matrices and exact neighbor lists.
//!
//! Used directly for small datasets and precomputed distance tables, and as the
//! reference the approximate search is measured against.

use rayon::prelude::*;

use super::heap_utils::KBestNeighbors;
use super::nn_descent::{IndexedDistances, SearchStats};
use super::Distance;
use crate::common_types::{DenseMatrix, Matrix};
use crate::error::{DistanceFault, Result, SearchError};

/// `n x n` distances between all rows of `x`.
///
/// With the precomputed sentinel, `x` already is the distance table and comes
/// back unchanged; its symmetry is not checked.
pub fn pairwise_distances<M, D>(x: &M, metric: &D) -> Result<DenseMatrix>
where
    M: Matrix + ?Sized,
    D: Distance + ?Sized,
{
    if metric.is_precomputed() {
        return Ok(x.to_dense());
    }
    distance_table(x, x, metric)
}

/// `n x m` distances from every row of `x` to every row of `y`.
pub fn pairwise_distances_between<X, Y, D>(x: &X, y: &Y, metric: &D) -> Result<DenseMatrix>
where
    X: Matrix + ?Sized,
    Y: Matrix + ?Sized,
    D: Distance + ?Sized,
{
    if metric.is_precomputed() {
        return Ok(x.to_dense());
    }
    if x.cols() != y.cols() {
        return Err(SearchError::DimensionMismatch { expected: x.cols(), found: y.cols() });
    }
    distance_table(x, y, metric)
}

fn distance_table<X, Y, D>(x: &X, y: &Y, metric: &D) -> Result<DenseMatrix>
where
    X: Matrix + ?Sized,
    Y: Matrix + ?Sized,
    D: Distance + ?Sized,
{
    let (n, m) = (x.rows(), y.rows());
    // Densify y once so sparse rows are not rebuilt n times.
    let y_rows: Vec<Vec<f32>> = (0..m).map(|j| y.row(j).into_owned()).collect();
    let data: Vec<f32> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            let a = x.row(i);
            y_rows.iter().map(move |b| metric.distance(&a, b)).collect::<Vec<_>>()
        })
        .collect();
    DenseMatrix::from_vec(n, m, data)
}

/// Exact k-nearest-neighbor lists for every row of `data`, excluding the row
/// itself. With the precomputed sentinel, entry `(i, j)` is read as `d(i, j)`.
///
/// Non-finite distances are skipped and reported through
/// [`IndexedDistances::faults`].
pub fn exact_nearest_neighbors<M, D>(data: &M, metric: &D, k: usize) -> Result<IndexedDistances>
where
    M: Matrix + ?Sized,
    D: Distance + ?Sized,
{
    check_k(data, k)?;
    if metric.is_precomputed() && data.rows() != data.cols() {
        return Err(SearchError::PrecomputedNotSquare { rows: data.rows(), cols: data.cols() });
    }
    Ok(brute_force(data, data, metric, k, true))
}

/// Exact k-nearest-neighbor lists in `reference` for every row of `queries`. With
/// the precomputed sentinel, row `i` of `queries` holds the distances from query
/// `i` to each reference point.
pub fn exact_neighbors_between<Q, M, D>(queries: &Q, reference: &M, metric: &D, k: usize) -> Result<IndexedDistances>
where
    Q: Matrix + ?Sized,
    M: Matrix + ?Sized,
    D: Distance + ?Sized,
{
    check_k(reference, k)?;
    let expected = if metric.is_precomputed() { reference.rows() } else { reference.cols() };
    if queries.cols() != expected {
        return Err(SearchError::DimensionMismatch { expected, found: queries.cols() });
    }
    Ok(brute_force(queries, reference, metric, k, false))
}

fn check_k<M: Matrix + ?Sized>(data: &M, k: usize) -> Result<()> {
    if data.rows() == 0 || data.cols() == 0 {
        return Err(SearchError::EmptyMatrix);
    }
    if k == 0 || k > data.rows() {
        return Err(SearchError::InvalidK { k, max: data.rows() });
    }
    Ok(())
}

fn brute_force<Q, M, D>(queries: &Q, reference: &M, metric: &D, k: usize, self_mode: bool) -> IndexedDistances
where
    Q: Matrix + ?Sized,
    M: Matrix + ?Sized,
    D: Distance + ?Sized,
{
    let precomputed = metric.is_precomputed();
    let per_point: Vec<(Vec<usize>, Vec<f32>, Vec<DistanceFault>)> = (0..queries.rows())
        .into_par_iter()
        .map(|i| {
            let row = queries.row(i);
            let mut best = KBestNeighbors::new(k);
            let mut faults = Vec::new();
            for j in 0..reference.rows() {
                if self_mode && i == j {
                    continue;
                }
                let distance = if precomputed { row[j] } else { metric.distance(&row, &reference.row(j)) };
                if distance.is_finite() {
                    best.add(distance, j);
                } else {
                    faults.push(DistanceFault { point: i, candidate: j, distance });
                }
            }
            let (distances, indices): (Vec<f32>, Vec<usize>) = best.into_sorted_pairs().into_iter().unzip();
            (indices, distances, faults)
        })
        .collect();

    let pairs_per_point = if self_mode { reference.rows() - 1 } else { reference.rows() };
    let evaluations = queries.rows() * pairs_per_point;
    let mut indices = Vec::with_capacity(per_point.len());
    let mut distances = Vec::with_capacity(per_point.len());
    let mut faults = Vec::new();
    for (point_indices, point_distances, point_faults) in per_point {
        indices.push(point_indices);
        distances.push(point_distances);
        faults.extend(point_faults);
    }
    IndexedDistances::new(indices, distances, None, SearchStats::brute_force(evaluations), faults)
}
