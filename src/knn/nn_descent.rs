//! Approximate k-nearest-neighbor search: forest-seeded candidates refined by
//! "neighbor of my neighbor" graph descent.
//!
//! A search runs in three phases over per-point [`NeighborHeap`]s:
//!
//! 1. tree seeding: every tree in the forest contributes the leaf bucket the point
//!    falls into;
//! 2. random seeding: k indices drawn without replacement from the whole dataset;
//! 3. refinement: each point repeatedly expands its closest unexpanded candidate,
//!    offering that candidate's graph neighbors as new candidates.
//!
//! Points never touch each other's heaps, so every phase runs in parallel over
//! points with rayon.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::graph::SearchGraph;
use super::heap_utils::{CandidateState, NeighborHeap};
use super::pairwise;
use super::rp_tree::{default_n_trees, Forest};
use super::sampling::{rejection_sample, rejection_sample_excluding, stream_rng};
use super::Distance;
use crate::common_types::Matrix;
use crate::error::{DistanceFault, Result, SearchError};

/// How a result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SearchStrategy {
    /// Every pair evaluated; exact.
    BruteForce,
    /// Forest seeding plus graph refinement; approximate.
    Approximate,
}

/// Tuning knobs for [`NearestNeighborSearch`]. `None` fields are derived from the
/// dataset size when the search starts.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NeighborSearchConfig {
    /// Neighbors per point (k).
    pub n_neighbors: usize,
    /// Defaults to `min(64, 5 + round(sqrt(n) / 20))`.
    pub n_trees: Option<usize>,
    /// Defaults to `max(10, k)`.
    pub leaf_size: Option<usize>,
    /// Refinement rounds over the whole dataset. Defaults to `max(5, round(log2(n)))`.
    pub max_rounds: Option<usize>,
    /// Upper bound on candidate expansions per point across all rounds. Points that
    /// hit it are counted in [`SearchStats::capped_points`]. `None` means unbounded.
    pub max_expansions_per_point: Option<usize>,
    /// Add k random candidates per point after tree seeding.
    pub random_init: bool,
    /// Datasets with fewer points are searched exactly.
    pub brute_force_threshold: usize,
    /// Turn non-finite distances into an error instead of attaching them to the result.
    pub fail_on_non_finite: bool,
}

impl NeighborSearchConfig {
    pub const DEFAULT_N_NEIGHBORS: usize = 15;
    pub const DEFAULT_MIN_LEAF_SIZE: usize = 10;
    pub const DEFAULT_MIN_ROUNDS: usize = 5;
    pub const DEFAULT_BRUTE_FORCE_THRESHOLD: usize = 1000; // If N < this, use brute-force

    pub fn new(n_neighbors: usize) -> Self {
        NeighborSearchConfig { n_neighbors, ..Default::default() }
    }

    /// Rejects settings that can never produce a search. `n_neighbors` is checked
    /// against the dataset when the search starts.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("n_trees", self.n_trees),
            ("leaf_size", self.leaf_size),
            ("max_rounds", self.max_rounds),
            ("max_expansions_per_point", self.max_expansions_per_point),
        ];
        for (name, value) in positive {
            if value == Some(0) {
                return Err(SearchError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn resolved_n_trees(&self, n_points: usize) -> usize {
        self.n_trees.unwrap_or_else(|| default_n_trees(n_points))
    }

    pub fn resolved_leaf_size(&self) -> usize {
        self.leaf_size.unwrap_or(Self::DEFAULT_MIN_LEAF_SIZE.max(self.n_neighbors))
    }

    pub fn resolved_max_rounds(&self, n_points: usize) -> usize {
        self.max_rounds
            .unwrap_or_else(|| Self::DEFAULT_MIN_ROUNDS.max((n_points.max(1) as f64).log2().round() as usize))
    }
}

impl Default for NeighborSearchConfig {
    fn default() -> Self {
        NeighborSearchConfig {
            n_neighbors: Self::DEFAULT_N_NEIGHBORS,
            n_trees: None,
            leaf_size: None,
            max_rounds: None,
            max_expansions_per_point: None,
            random_init: true,
            brute_force_threshold: Self::DEFAULT_BRUTE_FORCE_THRESHOLD,
            fail_on_non_finite: true,
        }
    }
}

/// Counters describing how a result was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SearchStats {
    pub strategy: SearchStrategy,
    pub n_trees: usize,
    /// Refinement rounds actually run.
    pub rounds: usize,
    pub expansions: usize,
    pub distance_evaluations: usize,
    /// Points whose expansion budget ran out while candidates were still
    /// unexpanded. Their lists may have lower recall.
    pub capped_points: usize,
}

impl SearchStats {
    pub(crate) fn brute_force(distance_evaluations: usize) -> Self {
        SearchStats {
            strategy: SearchStrategy::BruteForce,
            n_trees: 0,
            rounds: 0,
            expansions: 0,
            distance_evaluations,
            capped_points: 0,
        }
    }
}

/// Finished neighbor lists: row `i` of `indices`/`distances` holds the neighbors of
/// point `i`, closest first. Read-only once assembled.
#[derive(Debug, Clone)]
pub struct IndexedDistances {
    indices: Vec<Vec<usize>>,
    distances: Vec<Vec<f32>>,
    forest: Option<Arc<Forest>>,
    stats: SearchStats,
    faults: Vec<DistanceFault>,
}

impl IndexedDistances {
    pub(crate) fn new(
        indices: Vec<Vec<usize>>,
        distances: Vec<Vec<f32>>,
        forest: Option<Arc<Forest>>,
        stats: SearchStats,
        faults: Vec<DistanceFault>,
    ) -> Self {
        debug_assert_eq!(indices.len(), distances.len());
        IndexedDistances { indices, distances, forest, stats, faults }
    }

    fn from_heaps(heaps: Vec<NeighborHeap>, forest: Option<Arc<Forest>>, stats: SearchStats, faults: Vec<DistanceFault>) -> Self {
        let (indices, distances): (Vec<Vec<usize>>, Vec<Vec<f32>>) =
            heaps.into_iter().map(NeighborHeap::into_sorted).unzip();
        Self::new(indices, distances, forest, stats, faults)
    }

    pub fn indices(&self) -> &[Vec<usize>] {
        &self.indices
    }

    pub fn distances(&self) -> &[Vec<f32>] {
        &self.distances
    }

    /// `(indices, distances)` for one point.
    pub fn neighbors(&self, point: usize) -> (&[usize], &[f32]) {
        (&self.indices[point], &self.distances[point])
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The forest used for seeding, if any, for reuse by later queries.
    pub fn forest(&self) -> Option<&Arc<Forest>> {
        self.forest.as_ref()
    }

    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Candidate pairs skipped because the metric returned NaN or infinity.
    pub fn faults(&self) -> &[DistanceFault] {
        &self.faults
    }

    pub fn into_parts(self) -> (Vec<Vec<usize>>, Vec<Vec<f32>>) {
        (self.indices, self.distances)
    }
}

/// Per-point counters, summed after each parallel phase.
#[derive(Debug, Default)]
struct PointTally {
    evaluations: usize,
    accepted: usize,
    expansions: usize,
    capped: bool,
    faults: Vec<DistanceFault>,
}

impl PointTally {
    fn merge(mut self, other: PointTally) -> PointTally {
        self.evaluations += other.evaluations;
        self.accepted += other.accepted;
        self.expansions += other.expansions;
        self.capped |= other.capped;
        self.faults.extend(other.faults);
        self
    }
}

/// Distances from query rows to reference rows for one search. In self mode the
/// two matrices are the same and a point is never its own candidate.
struct PointDistances<'a, Q: ?Sized, M: ?Sized, D: ?Sized> {
    queries: &'a Q,
    reference: &'a M,
    metric: &'a D,
    self_mode: bool,
}

impl<Q, M, D> PointDistances<'_, Q, M, D>
where
    Q: Matrix + ?Sized,
    M: Matrix + ?Sized,
    D: Distance + ?Sized,
{
    /// Computes `d(point, candidate)` and offers it to the heap. Non-finite
    /// distances are recorded instead of pushed.
    fn offer(
        &self,
        point: usize,
        row: &[f32],
        candidate: usize,
        state: CandidateState,
        heap: &mut NeighborHeap,
        tally: &mut PointTally,
    ) {
        let distance = self.metric.distance(row, &self.reference.row(candidate));
        tally.evaluations += 1;
        if !distance.is_finite() {
            tally.faults.push(DistanceFault { point, candidate, distance });
            return;
        }
        if heap.push(candidate, distance, state) {
            tally.accepted += 1;
        }
    }

    fn seed_from_trees(&self, point: usize, heap: &mut NeighborHeap, forest: &Forest, base_seed: u64) -> PointTally {
        let mut rng = stream_rng(base_seed, point as u64);
        let mut tally = PointTally::default();
        let row = self.queries.row(point);
        for candidate in forest.leaf_candidates(&row, &mut rng) {
            if (self.self_mode && candidate == point) || heap.contains(candidate) {
                continue;
            }
            self.offer(point, &row, candidate, CandidateState::Unseen, heap, &mut tally);
        }
        tally
    }

    fn seed_randomly(&self, point: usize, heap: &mut NeighborHeap, base_seed: u64) -> PointTally {
        let mut rng = stream_rng(base_seed, point as u64);
        let mut tally = PointTally::default();
        let row = self.queries.row(point);
        let pool = self.reference.rows();
        let sample = if self.self_mode {
            rejection_sample_excluding(heap.capacity(), pool, point, &mut rng)
        } else {
            rejection_sample(heap.capacity(), pool, &mut rng)
        };
        for candidate in sample {
            if heap.contains(candidate) {
                continue;
            }
            self.offer(point, &row, candidate, CandidateState::Unseen, heap, &mut tally);
        }
        tally
    }

    /// Best-first expansion until no flagged candidate remains or `budget`
    /// expansions have been spent.
    fn refine(&self, point: usize, heap: &mut NeighborHeap, graph: &SearchGraph, budget: Option<usize>) -> PointTally {
        let mut tally = PointTally::default();
        let row = self.queries.row(point);
        let mut tried: HashSet<usize> = heap.neighbor_indices().collect();
        if self.self_mode {
            tried.insert(point);
        }

        loop {
            if budget.is_some_and(|budget| tally.expansions >= budget) {
                tally.capped = heap.has_flagged();
                break;
            }
            let Some(vertex) = heap.take_smallest_flagged() else {
                break; // converged
            };
            tally.expansions += 1;

            for &candidate in graph.neighbors(vertex) {
                if candidate == vertex || !tried.insert(candidate) {
                    continue;
                }
                self.offer(point, &row, candidate, CandidateState::Frontier, heap, &mut tally);
            }
        }
        tally
    }
}

/// Approximate k-nearest-neighbor search driven by a [`NeighborSearchConfig`].
#[derive(Debug, Clone, Default)]
pub struct NearestNeighborSearch {
    config: NeighborSearchConfig,
}

impl NearestNeighborSearch {
    pub fn new(config: NeighborSearchConfig) -> Self {
        NearestNeighborSearch { config }
    }

    pub fn config(&self) -> &NeighborSearchConfig {
        &self.config
    }

    /// k-nearest-neighbor lists for every row of `data`, excluding the row itself.
    ///
    /// Small datasets and precomputed distance tables are searched exactly;
    /// everything else goes through a freshly built forest.
    pub fn fit<M, D, R>(&self, data: &M, metric: &D, rng: &mut R) -> Result<IndexedDistances>
    where
        M: Matrix,
        D: Distance + ?Sized,
        R: Rng + ?Sized,
    {
        self.fit_inner(data, metric, None, rng)
    }

    /// Like [`fit`](Self::fit), but seeds from an existing forest built over `data`.
    /// The approximate path is always taken.
    pub fn fit_with_forest<M, D, R>(&self, data: &M, metric: &D, forest: Arc<Forest>, rng: &mut R) -> Result<IndexedDistances>
    where
        M: Matrix,
        D: Distance + ?Sized,
        R: Rng + ?Sized,
    {
        self.fit_inner(data, metric, Some(forest), rng)
    }

    fn fit_inner<M, D, R>(&self, data: &M, metric: &D, forest: Option<Arc<Forest>>, rng: &mut R) -> Result<IndexedDistances>
    where
        M: Matrix,
        D: Distance + ?Sized,
        R: Rng + ?Sized,
    {
        self.config.validate()?;
        let (n, k) = (data.rows(), self.config.n_neighbors);
        validate_dataset(data, k)?;

        if metric.is_precomputed() {
            if data.rows() != data.cols() {
                return Err(SearchError::PrecomputedNotSquare { rows: data.rows(), cols: data.cols() });
            }
            debug!(n, k, "precomputed distances, reading neighbors from the table");
            return self.surface_faults(pairwise::exact_nearest_neighbors(data, metric, k)?);
        }
        if forest.is_none() && n < self.config.brute_force_threshold {
            debug!(n, threshold = self.config.brute_force_threshold, "small dataset, using brute force");
            return self.surface_faults(pairwise::exact_nearest_neighbors(data, metric, k)?);
        }

        let forest = match forest {
            Some(forest) => {
                check_forest(&forest, data)?;
                forest
            }
            None => Arc::new(Forest::build(
                data,
                metric,
                self.config.resolved_n_trees(n),
                self.config.resolved_leaf_size(),
                rng,
            )?),
        };

        info!(n, k, n_trees = forest.n_trees(), "starting approximate neighbor search");
        let distances = PointDistances { queries: data, reference: data, metric, self_mode: true };
        let mut heaps: Vec<NeighborHeap> = (0..n).map(|_| NeighborHeap::new(k)).collect();

        let mut tally = self.seed(&distances, &mut heaps, &forest, rng);
        let max_rounds = self.config.resolved_max_rounds(n);
        let mut budgets: Vec<Option<usize>> = vec![self.config.max_expansions_per_point; n];
        let mut capped = vec![false; n];
        let mut rounds = 0;

        while rounds < max_rounds {
            // Every point reads the same snapshot of the current lists.
            let lists: Vec<Vec<usize>> = heaps.iter().map(|h| h.neighbor_indices().collect()).collect();
            let graph = SearchGraph::from_neighbor_lists(&lists, true);

            let outcomes: Vec<PointTally> = heaps
                .par_iter_mut()
                .zip(budgets.par_iter())
                .enumerate()
                .map(|(i, (heap, &budget))| distances.refine(i, heap, &graph, budget))
                .collect();
            rounds += 1;

            for (i, outcome) in outcomes.iter().enumerate() {
                capped[i] |= outcome.capped;
                if let Some(budget) = budgets[i].as_mut() {
                    *budget = budget.saturating_sub(outcome.expansions);
                }
            }
            let round_tally = outcomes.into_iter().fold(PointTally::default(), PointTally::merge);
            let updates = round_tally.accepted;
            tally = tally.merge(round_tally);
            debug!(round = rounds, updates, "refinement round finished");
            if updates == 0 {
                break;
            }

            // Candidates whose neighborhood grew are worth expanding again.
            let changed = changed_vertices(&lists, &heaps);
            let reflagged: usize = heaps.par_iter_mut().map(|h| h.reflag(|v| changed[v])).sum();
            if reflagged == 0 {
                break;
            }
        }

        let stats = SearchStats {
            strategy: SearchStrategy::Approximate,
            n_trees: forest.n_trees(),
            rounds,
            expansions: tally.expansions,
            distance_evaluations: tally.evaluations,
            capped_points: capped.iter().filter(|&&c| c).count(),
        };
        self.finish(heaps, Some(forest), stats, tally.faults)
    }

    /// Neighbors in `reference` for every row of `queries`.
    ///
    /// `reference_graph` is the adjacency explored during refinement, typically
    /// [`SearchGraph::from_indexed`] over a previous [`fit`](Self::fit) of
    /// `reference`. A forest is reused when given, otherwise one is built over
    /// `reference`. With a precomputed metric, row `i` of `queries` must hold the
    /// distances from query `i` to every reference point; the lists are then exact.
    pub fn query<Q, M, D, R>(
        &self,
        queries: &Q,
        reference: &M,
        metric: &D,
        reference_graph: &SearchGraph,
        forest: Option<Arc<Forest>>,
        rng: &mut R,
    ) -> Result<IndexedDistances>
    where
        Q: Matrix,
        M: Matrix,
        D: Distance + ?Sized,
        R: Rng + ?Sized,
    {
        self.config.validate()?;
        let k = self.config.n_neighbors;
        validate_dataset(reference, k)?;
        if queries.rows() == 0 || queries.cols() == 0 {
            return Err(SearchError::EmptyMatrix);
        }
        if !queries.is_finite() {
            return Err(SearchError::NonFiniteInput);
        }

        if metric.is_precomputed() {
            if queries.cols() != reference.rows() {
                return Err(SearchError::DimensionMismatch { expected: reference.rows(), found: queries.cols() });
            }
            return self.surface_faults(pairwise::exact_neighbors_between(queries, reference, metric, k)?);
        }
        if queries.cols() != reference.cols() {
            return Err(SearchError::DimensionMismatch { expected: reference.cols(), found: queries.cols() });
        }
        if reference_graph.n_vertices() != reference.rows() {
            return Err(SearchError::InvalidConfig(format!(
                "search graph has {} vertices but the reference set has {} points",
                reference_graph.n_vertices(),
                reference.rows()
            )));
        }
        if let Some((v, u)) = reference_graph.dangling_edge() {
            return Err(SearchError::InvalidConfig(format!(
                "search graph edge {} -> {} points outside the {} reference points",
                v,
                u,
                reference.rows()
            )));
        }

        let forest = match forest {
            Some(forest) => {
                check_forest(&forest, reference)?;
                forest
            }
            None => Arc::new(Forest::build(
                reference,
                metric,
                self.config.resolved_n_trees(reference.rows()),
                self.config.resolved_leaf_size(),
                rng,
            )?),
        };

        info!(n_queries = queries.rows(), n_reference = reference.rows(), k, "querying reference set");
        let distances = PointDistances { queries, reference, metric, self_mode: false };
        let mut heaps: Vec<NeighborHeap> = (0..queries.rows()).map(|_| NeighborHeap::new(k)).collect();
        let seeded = self.seed(&distances, &mut heaps, &forest, rng);

        // The reference graph never changes, so one pass reaches the fixed point.
        let budget = self.config.max_expansions_per_point;
        let refined = heaps
            .par_iter_mut()
            .enumerate()
            .map(|(i, heap)| distances.refine(i, heap, reference_graph, budget))
            .collect::<Vec<_>>();
        let capped_points = refined.iter().filter(|t| t.capped).count();
        let tally = refined.into_iter().fold(seeded, PointTally::merge);

        let stats = SearchStats {
            strategy: SearchStrategy::Approximate,
            n_trees: forest.n_trees(),
            rounds: 1,
            expansions: tally.expansions,
            distance_evaluations: tally.evaluations,
            capped_points,
        };
        self.finish(heaps, Some(forest), stats, tally.faults)
    }

    /// Tree seeding followed by random seeding, each parallel over points.
    fn seed<Q, M, D, R>(
        &self,
        distances: &PointDistances<'_, Q, M, D>,
        heaps: &mut [NeighborHeap],
        forest: &Forest,
        rng: &mut R,
    ) -> PointTally
    where
        Q: Matrix + ?Sized,
        M: Matrix + ?Sized,
        D: Distance + ?Sized,
        R: Rng + ?Sized,
    {
        let tree_seed = rng.r#gen::<u64>();
        let random_seed = rng.r#gen::<u64>();

        let from_trees = heaps
            .par_iter_mut()
            .enumerate()
            .map(|(i, heap)| distances.seed_from_trees(i, heap, forest, tree_seed))
            .reduce(PointTally::default, PointTally::merge);
        debug!(evaluations = from_trees.evaluations, accepted = from_trees.accepted, "tree seeding finished");

        if !self.config.random_init {
            return from_trees;
        }
        let from_sampling = heaps
            .par_iter_mut()
            .enumerate()
            .map(|(i, heap)| distances.seed_randomly(i, heap, random_seed))
            .reduce(PointTally::default, PointTally::merge);
        debug!(
            evaluations = from_sampling.evaluations,
            accepted = from_sampling.accepted,
            "random seeding finished"
        );
        from_trees.merge(from_sampling)
    }

    fn finish(
        &self,
        heaps: Vec<NeighborHeap>,
        forest: Option<Arc<Forest>>,
        stats: SearchStats,
        faults: Vec<DistanceFault>,
    ) -> Result<IndexedDistances> {
        if stats.capped_points > 0 {
            warn!(
                capped_points = stats.capped_points,
                cap = self.config.max_expansions_per_point,
                "expansion cap reached before convergence, recall may be reduced"
            );
        }
        info!(
            rounds = stats.rounds,
            expansions = stats.expansions,
            evaluations = stats.distance_evaluations,
            "neighbor search finished"
        );
        self.surface_faults(IndexedDistances::from_heaps(heaps, forest, stats, faults))
    }

    /// Logs non-finite distances and, unless configured otherwise, turns them into
    /// an error. Every point has been processed by the time this runs.
    fn surface_faults(&self, mut result: IndexedDistances) -> Result<IndexedDistances> {
        if result.faults.is_empty() {
            return Ok(result);
        }
        result.faults.sort_by_key(|f| (f.point, f.candidate));
        result.faults.dedup_by_key(|f| (f.point, f.candidate));
        warn!(count = result.faults.len(), first = %result.faults[0], "metric returned non-finite distances");
        if self.config.fail_on_non_finite {
            return Err(SearchError::NonFiniteDistances(result.faults));
        }
        Ok(result)
    }
}

/// Vertices whose adjacency in the next round's symmetrized graph gains an edge:
/// every point whose list took a new member, and every new member, which gains
/// the reverse edge.
fn changed_vertices(before: &[Vec<usize>], heaps: &[NeighborHeap]) -> Vec<bool> {
    let mut changed = vec![false; heaps.len()];
    for (i, (old, heap)) in before.iter().zip(heaps).enumerate() {
        for j in heap.neighbor_indices().filter(|j| !old.contains(j)) {
            changed[i] = true;
            changed[j] = true;
        }
    }
    changed
}

/// Boundary checks shared by every entry point: at least one feature, `1 <= k <= n`,
/// finite values.
fn validate_dataset<M: Matrix + ?Sized>(data: &M, k: usize) -> Result<()> {
    if data.rows() == 0 || data.cols() == 0 {
        return Err(SearchError::EmptyMatrix);
    }
    if k == 0 || k > data.rows() {
        return Err(SearchError::InvalidK { k, max: data.rows() });
    }
    if !data.is_finite() {
        return Err(SearchError::NonFiniteInput);
    }
    Ok(())
}

fn check_forest<M: Matrix + ?Sized>(forest: &Forest, data: &M) -> Result<()> {
    if forest.n_points() != data.rows() {
        return Err(SearchError::InvalidConfig(format!(
            "forest was built over {} points but the dataset has {}",
            forest.n_points(),
            data.rows()
        )));
    }
    if forest.dim() != data.cols() {
        return Err(SearchError::DimensionMismatch { expected: forest.dim(), found: data.cols() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common_types::{CsrMatrix, DenseMatrix};
    use crate::knn::Metric;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// `n_clusters` tight blobs whose centers are 20 apart on every axis.
    fn clustered_points(n_clusters: usize, per_cluster: usize, dim: usize, seed: u64) -> DenseMatrix {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows = Vec::with_capacity(n_clusters * per_cluster);
        for c in 0..n_clusters {
            for _ in 0..per_cluster {
                rows.push((0..dim).map(|_| c as f32 * 20.0 + rng.gen_range(-1.0..1.0)).collect());
            }
        }
        DenseMatrix::from_rows(rows).unwrap()
    }

    fn graph_lists(graph: &SearchGraph) -> Vec<Vec<usize>> {
        (0..graph.n_vertices()).map(|v| graph.neighbors(v).to_vec()).collect()
    }

    fn approximate_config(k: usize) -> NeighborSearchConfig {
        NeighborSearchConfig { brute_force_threshold: 0, ..NeighborSearchConfig::new(k) }
    }

    fn assert_well_formed(result: &IndexedDistances, k: usize, self_mode: bool) {
        for (i, (indices, distances)) in result.indices().iter().zip(result.distances()).enumerate() {
            assert!(indices.len() <= k, "Point {} has {} neighbors", i, indices.len());
            assert_eq!(indices.len(), distances.len());
            let unique: HashSet<_> = indices.iter().collect();
            assert_eq!(unique.len(), indices.len(), "Duplicate neighbor for point {}", i);
            if self_mode {
                assert!(!indices.contains(&i), "Point {} lists itself", i);
            }
            assert!(distances.windows(2).all(|w| w[0] <= w[1]), "Unsorted list for point {}", i);
        }
    }

    #[test]
    fn test_config_defaults_and_resolution() {
        let config = NeighborSearchConfig::default();
        assert_eq!(config.n_neighbors, 15);
        assert!(config.random_init);
        assert!(config.fail_on_non_finite);
        assert_eq!(config.resolved_leaf_size(), 15);
        assert_eq!(NeighborSearchConfig::new(3).resolved_leaf_size(), 10);
        assert_eq!(config.resolved_max_rounds(10), 5);
        assert_eq!(config.resolved_max_rounds(1 << 12), 12);
        assert_eq!(config.resolved_n_trees(400), 6);

        let bad = NeighborSearchConfig { n_trees: Some(0), ..NeighborSearchConfig::new(3) };
        assert!(matches!(bad.validate(), Err(SearchError::InvalidConfig(_))));
        let bad = NeighborSearchConfig { max_expansions_per_point: Some(0), ..NeighborSearchConfig::new(3) };
        assert!(matches!(bad.validate(), Err(SearchError::InvalidConfig(_))));
    }

    #[test]
    fn test_two_clusters_of_three() {
        let data = DenseMatrix::from_rows(vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![10.0, 10.0],
            vec![11.0, 10.0],
            vec![10.0, 11.0],
        ])
        .unwrap();

        for config in [NeighborSearchConfig::new(2), approximate_config(2)] {
            let mut rng = StdRng::seed_from_u64(42);
            let result = NearestNeighborSearch::new(config).fit(&data, &Metric::Euclidean, &mut rng).unwrap();
            assert_eq!(result.len(), 6);
            assert_well_formed(&result, 2, true);
            for (i, (indices, distances)) in result.indices().iter().zip(result.distances()).enumerate() {
                assert_eq!(indices.len(), 2);
                assert!(distances.iter().all(|&d| d < 14.1));
                assert!(indices.iter().all(|&j| j / 3 == i / 3), "Point {} crossed clusters: {:?}", i, indices);
            }
        }
    }

    #[test]
    fn test_small_dataset_uses_brute_force() {
        let data = clustered_points(2, 10, 3, 1);
        let mut rng = StdRng::seed_from_u64(0);
        let result = NearestNeighborSearch::new(NeighborSearchConfig::new(4))
            .fit(&data, &Metric::Euclidean, &mut rng)
            .unwrap();
        assert_eq!(result.stats().strategy, SearchStrategy::BruteForce);
        assert!(result.forest().is_none());
    }

    #[test]
    fn test_approximate_search_invariants() {
        let data = clustered_points(4, 60, 5, 3);
        let k = 8;
        let mut rng = StdRng::seed_from_u64(42);
        let result = NearestNeighborSearch::new(approximate_config(k))
            .fit(&data, &Metric::Euclidean, &mut rng)
            .unwrap();

        assert_eq!(result.stats().strategy, SearchStrategy::Approximate);
        assert!(result.stats().rounds >= 1);
        assert!(result.forest().is_some());
        assert!(result.faults().is_empty());
        assert_well_formed(&result, k, true);
        for (i, (indices, distances)) in result.indices().iter().zip(result.distances()).enumerate() {
            assert_eq!(indices.len(), k, "Random seeding fills every list");
            for (&j, &d) in indices.iter().zip(distances) {
                assert_eq!(d, Metric::Euclidean.distance(&data.row(i), &data.row(j)), "Stored distance for ({}, {})", i, j);
            }
        }
    }

    #[test]
    fn test_recall_against_exact_search() {
        let data = clustered_points(5, 80, 4, 9);
        let k = 10;
        let mut rng = StdRng::seed_from_u64(42);
        let approximate = NearestNeighborSearch::new(approximate_config(k))
            .fit(&data, &Metric::Euclidean, &mut rng)
            .unwrap();
        let exact = pairwise::exact_nearest_neighbors(&data, &Metric::Euclidean, k).unwrap();

        let agreeing = approximate
            .indices()
            .iter()
            .zip(exact.indices())
            .filter(|(a, e)| a[0] == e[0])
            .count();
        let recall = agreeing as f64 / data.rows() as f64;
        assert!(recall >= 0.95, "1-NN agreement too low: {:.3}", recall);
    }

    #[test]
    fn test_angular_and_sparse_inputs() {
        let dense = clustered_points(3, 50, 6, 5);
        let sparse = CsrMatrix::from_dense(&dense);
        let mut rng = StdRng::seed_from_u64(7);
        let search = NearestNeighborSearch::new(approximate_config(5));

        let cosine = search.fit(&dense, &Metric::Cosine, &mut rng).unwrap();
        assert_well_formed(&cosine, 5, true);

        let from_sparse = search.fit(&sparse, &Metric::Euclidean, &mut rng).unwrap();
        assert_well_formed(&from_sparse, 5, true);
        assert!(from_sparse.indices().iter().enumerate().all(|(i, row)| row.iter().all(|&j| j / 50 == i / 50)));
    }

    #[test]
    fn test_rejects_bad_input() {
        let data = clustered_points(1, 5, 2, 0);
        let mut rng = StdRng::seed_from_u64(0);
        let fit = |k: usize, rng: &mut StdRng| NearestNeighborSearch::new(approximate_config(k)).fit(&data, &Metric::Euclidean, rng);

        assert!(matches!(fit(0, &mut rng), Err(SearchError::InvalidK { k: 0, max: 5 })));
        assert!(matches!(fit(6, &mut rng), Err(SearchError::InvalidK { k: 6, max: 5 })));

        let with_nan = DenseMatrix::from_rows(vec![vec![0.0, 1.0], vec![f32::NAN, 2.0], vec![3.0, 4.0]]).unwrap();
        let search = NearestNeighborSearch::new(approximate_config(1));
        assert!(matches!(search.fit(&with_nan, &Metric::Euclidean, &mut rng), Err(SearchError::NonFiniteInput)));

        let zero_rounds = NeighborSearchConfig { max_rounds: Some(0), ..approximate_config(2) };
        assert!(matches!(
            NearestNeighborSearch::new(zero_rounds).fit(&data, &Metric::Euclidean, &mut rng),
            Err(SearchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_expansion_cap_is_reported() {
        let data = clustered_points(2, 100, 3, 4);
        let config = NeighborSearchConfig { max_expansions_per_point: Some(1), ..approximate_config(5) };
        let mut rng = StdRng::seed_from_u64(1);
        let result = NearestNeighborSearch::new(config).fit(&data, &Metric::Euclidean, &mut rng).unwrap();

        assert!(result.stats().capped_points > 0);
        assert!(result.stats().expansions <= data.rows(), "At most one expansion per point");
        assert_well_formed(&result, 5, true);
    }

    #[test]
    fn test_non_finite_distances_are_surfaced() {
        let mut data = clustered_points(2, 30, 2, 6);
        data.set(0, 0, -100.0);
        // Every pair touching point 0 is broken
        let broken = |a: &[f32], b: &[f32]| {
            if a[0] < -50.0 || b[0] < -50.0 { f32::NAN } else { Metric::Euclidean.distance(a, b) }
        };

        let mut rng = StdRng::seed_from_u64(2);
        let strict = NearestNeighborSearch::new(approximate_config(4)).fit(&data, &broken, &mut rng);
        match strict {
            Err(SearchError::NonFiniteDistances(faults)) => {
                assert!(!faults.is_empty());
                assert!(faults.iter().all(|f| f.point == 0 || f.candidate == 0));
                assert!(faults.windows(2).all(|w| (w[0].point, w[0].candidate) < (w[1].point, w[1].candidate)));
            }
            other => panic!("Expected NonFiniteDistances, got {:?}", other.map(|r| r.stats().clone())),
        }

        let lenient = NeighborSearchConfig { fail_on_non_finite: false, ..approximate_config(4) };
        let result = NearestNeighborSearch::new(lenient).fit(&data, &broken, &mut rng).unwrap();
        assert!(!result.faults().is_empty());
        assert!(result.indices()[0].is_empty(), "Point 0 has no finite distance to anyone");
        assert!(result.indices().iter().skip(1).all(|row| !row.contains(&0) && !row.is_empty()));
    }

    #[test]
    fn test_brute_force_path_honors_fault_setting() {
        let data = clustered_points(1, 6, 2, 8);
        let nan_everywhere = |_: &[f32], _: &[f32]| f32::NAN;
        let mut rng = StdRng::seed_from_u64(0);

        let strict = NearestNeighborSearch::new(NeighborSearchConfig::new(2)).fit(&data, &nan_everywhere, &mut rng);
        assert!(matches!(strict, Err(SearchError::NonFiniteDistances(ref faults)) if faults.len() == 30));

        let lenient = NeighborSearchConfig { fail_on_non_finite: false, ..NeighborSearchConfig::new(2) };
        let result = NearestNeighborSearch::new(lenient).fit(&data, &nan_everywhere, &mut rng).unwrap();
        assert_eq!(result.faults().len(), 30);
        assert!(result.indices().iter().all(|row| row.is_empty()));
    }

    #[test]
    fn test_forest_reuse() {
        let data = clustered_points(3, 40, 3, 10);
        let mut rng = StdRng::seed_from_u64(3);
        let forest = Arc::new(Forest::build(&data, &Metric::Euclidean, 3, 10, &mut rng).unwrap());

        // Forest given, so the approximate path runs despite the default threshold
        let search = NearestNeighborSearch::new(NeighborSearchConfig::new(5));
        let result = search.fit_with_forest(&data, &Metric::Euclidean, forest.clone(), &mut rng).unwrap();
        assert_eq!(result.stats().strategy, SearchStrategy::Approximate);
        assert_eq!(result.stats().n_trees, 3);
        assert!(Arc::ptr_eq(result.forest().unwrap(), &forest));
        assert_well_formed(&result, 5, true);

        let other = clustered_points(3, 10, 3, 10);
        assert!(matches!(
            search.fit_with_forest(&other, &Metric::Euclidean, forest, &mut rng),
            Err(SearchError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_query_against_reference() {
        let reference = clustered_points(4, 50, 3, 12);
        let k = 5;
        let mut rng = StdRng::seed_from_u64(4);
        let search = NearestNeighborSearch::new(approximate_config(k));
        let fitted = search.fit(&reference, &Metric::Euclidean, &mut rng).unwrap();
        let graph = SearchGraph::from_indexed(&fitted, true);

        let mut query_rows: Vec<Vec<f32>> = (0..4).map(|c| vec![c as f32 * 20.0 + 0.3; 3]).collect();
        query_rows.push(reference.row(17).into_owned());
        let queries = DenseMatrix::from_rows(query_rows).unwrap();

        let result = search
            .query(&queries, &reference, &Metric::Euclidean, &graph, fitted.forest().cloned(), &mut rng)
            .unwrap();
        assert_eq!(result.len(), 5);
        assert_eq!(result.stats().rounds, 1);
        assert_well_formed(&result, k, false);

        let exact = pairwise::exact_neighbors_between(&queries, &reference, &Metric::Euclidean, k).unwrap();
        for (i, (found, expected)) in result.indices().iter().zip(exact.indices()).enumerate() {
            assert_eq!(found.len(), k);
            assert!(found.iter().all(|&j| j / 50 == i.min(3)) || i == 4, "Query {} left its cluster", i);
            assert_eq!(found[0], expected[0], "Nearest reference point for query {}", i);
        }
        assert_eq!(result.distances()[4][0], 0.0, "A reference point matches itself");

        let wrong_graph = SearchGraph::from_neighbor_lists(&[vec![1usize], vec![0]], true);
        assert!(matches!(
            search.query(&queries, &reference, &Metric::Euclidean, &wrong_graph, None, &mut rng),
            Err(SearchError::InvalidConfig(_))
        ));
        let mut dangling_lists: Vec<Vec<usize>> = graph_lists(&graph);
        dangling_lists[0].push(reference.rows() + 7);
        let dangling = SearchGraph::from_neighbor_lists(&dangling_lists, false);
        assert!(matches!(
            search.query(&queries, &reference, &Metric::Euclidean, &dangling, None, &mut rng),
            Err(SearchError::InvalidConfig(message)) if message.contains("outside")
        ));
        let narrow = DenseMatrix::from_rows(vec![vec![0.0, 0.0]]).unwrap();
        assert!(matches!(
            search.query(&narrow, &reference, &Metric::Euclidean, &graph, None, &mut rng),
            Err(SearchError::DimensionMismatch { expected: 3, found: 2 })
        ));
    }

    #[test]
    fn test_changed_vertices_include_reverse_edges() {
        let mut heaps: Vec<NeighborHeap> = (0..4).map(|_| NeighborHeap::new(2)).collect();
        heaps[0].push(1, 1.0, CandidateState::Unseen);
        heaps[1].push(0, 1.0, CandidateState::Unseen);
        let before: Vec<Vec<usize>> = heaps.iter().map(|h| h.neighbor_indices().collect()).collect();

        // Point 0 picks up point 3; point 3's own list is untouched
        heaps[0].push(3, 0.5, CandidateState::Frontier);
        assert_eq!(changed_vertices(&before, &heaps), vec![true, false, false, true]);
    }

    #[test]
    fn test_query_rejects_out_of_range_graph_edges() {
        let reference = DenseMatrix::from_rows(vec![vec![0.0], vec![1.0], vec![2.0]]).unwrap();
        let graph = SearchGraph::from_neighbor_lists(&[vec![7usize], vec![0], vec![1]], false);
        let queries = DenseMatrix::from_rows(vec![vec![0.5]]).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let result = NearestNeighborSearch::new(approximate_config(1)).query(
            &queries,
            &reference,
            &Metric::Euclidean,
            &graph,
            None,
            &mut rng,
        );
        assert!(matches!(result, Err(SearchError::InvalidConfig(_))));
    }

    #[test]
    fn test_precomputed_distances() {
        let points = clustered_points(2, 4, 2, 13);
        let table = pairwise::pairwise_distances(&points, &Metric::Euclidean).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let search = NearestNeighborSearch::new(approximate_config(2));

        let from_table = search.fit(&table, &Metric::Precomputed, &mut rng).unwrap();
        let direct = pairwise::exact_nearest_neighbors(&points, &Metric::Euclidean, 2).unwrap();
        assert_eq!(from_table.stats().strategy, SearchStrategy::BruteForce);
        assert_eq!(from_table.indices(), direct.indices());

        assert!(matches!(
            search.fit(&points, &Metric::Precomputed, &mut rng),
            Err(SearchError::PrecomputedNotSquare { rows: 8, cols: 2 })
        ));

        let to_reference = pairwise::pairwise_distances_between(&points, &points, &Metric::Euclidean).unwrap();
        let graph = SearchGraph::from_indexed(&from_table, true);
        let queried = search
            .query(&to_reference, &points, &Metric::Precomputed, &graph, None, &mut rng)
            .unwrap();
        assert!(queried.indices().iter().enumerate().all(|(i, row)| row[0] == i));
    }

    #[test]
    fn test_fixed_seed_is_deterministic() {
        let data = clustered_points(3, 60, 4, 21);
        let search = NearestNeighborSearch::new(approximate_config(6));
        let run = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            search.fit(&data, &Metric::Euclidean, &mut rng).unwrap()
        };
        let (a, b) = (run(99), run(99));
        assert_eq!(a.indices(), b.indices());
        assert_eq!(a.distances(), b.distances());
        assert_eq!(a.stats(), b.stats());
        assert_eq!(a.forest().map(|f| f.as_ref()), b.forest().map(|f| f.as_ref()));
    }
}
