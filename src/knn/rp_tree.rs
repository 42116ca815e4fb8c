//! Random projection trees, flattened into arrays, and forests of them.
//!
//! Each internal node splits its points with a random hyperplane through the
//! midpoint of two randomly chosen points. Leaves hold small buckets of point
//! indices that are likely to be near each other.

use rand::seq::SliceRandom; // For the balanced fallback split
use rand::Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use super::sampling::stream_rng;
use super::{dot, Distance};
use crate::common_types::Matrix;
use crate::error::{Result, SearchError};

/// Margins closer to zero than this are ties, broken with a coin flip.
pub const MARGIN_EPSILON: f32 = 1e-8;
/// Fills leaf buckets up to the length of the largest bucket in the tree.
pub const LEAF_PADDING: isize = -1;
/// Recursion stops here even if the node holds more than `leaf_size` points.
pub const MAX_DEPTH: usize = 200;

/// Which child a point descends into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Left for `margin <= 0`, right otherwise. Near-zero margins flip a fair coin.
pub fn select_side<R: Rng + ?Sized>(margin: f32, rng: &mut R) -> Side {
    if margin.abs() < MARGIN_EPSILON {
        if rng.gen_bool(0.5) { Side::Right } else { Side::Left }
    } else if margin <= 0.0 {
        Side::Left
    } else {
        Side::Right
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HyperplaneShape {
    Dense { dim: usize },
    Sparse { nnz: usize },
}

/// A separating hyperplane. Sparse hyperplanes only carry weights for `indices`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hyperplane {
    data: Vec<f32>,
    indices: Option<Vec<usize>>,
}

impl Hyperplane {
    pub fn dense(data: Vec<f32>) -> Self {
        Hyperplane { data, indices: None }
    }

    /// `indices[i]` is the column weighted by `data[i]`.
    pub fn sparse(indices: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(indices.len(), data.len());
        Hyperplane { data, indices: Some(indices) }
    }

    /// Placeholder stored at leaf nodes.
    fn empty() -> Self {
        Hyperplane { data: Vec::new(), indices: None }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn indices(&self) -> Option<&[usize]> {
        self.indices.as_deref()
    }

    pub fn shape(&self) -> HyperplaneShape {
        match &self.indices {
            None => HyperplaneShape::Dense { dim: self.data.len() },
            Some(indices) => HyperplaneShape::Sparse { nnz: indices.len() },
        }
    }

    /// `offset + <hyperplane, point>` for a dense point.
    pub fn margin(&self, offset: f32, point: &[f32]) -> f32 {
        let projection = match &self.indices {
            None => dot(&self.data, point),
            Some(indices) => indices.iter().zip(self.data.iter()).map(|(&col, &w)| w * point[col]).sum(),
        };
        offset + projection
    }
}

/// A random projection tree stored as parallel arrays indexed by node.
///
/// A node is a leaf iff `children[node][0] <= 0`; `-children[node][0]` is then the
/// position of its bucket in `indices`. Buckets are padded with [`LEAF_PADDING`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlatTree {
    hyperplanes: Vec<Hyperplane>,
    offsets: Vec<f32>,
    children: Vec<[isize; 2]>,
    indices: Vec<Vec<isize>>,
}

impl FlatTree {
    /// Assembles a tree from raw arrays, rejecting any that break the leaf/internal
    /// encoding.
    pub fn from_parts(
        hyperplanes: Vec<Hyperplane>,
        offsets: Vec<f32>,
        children: Vec<[isize; 2]>,
        indices: Vec<Vec<isize>>,
    ) -> Result<Self> {
        let tree = FlatTree { hyperplanes, offsets, children, indices };
        tree.check_invariants()?;
        Ok(tree)
    }

    pub fn n_nodes(&self) -> usize {
        self.children.len()
    }

    pub fn n_leaves(&self) -> usize {
        self.indices.len()
    }

    pub fn hyperplanes(&self) -> &[Hyperplane] {
        &self.hyperplanes
    }

    pub fn offsets(&self) -> &[f32] {
        &self.offsets
    }

    pub fn children(&self) -> &[[isize; 2]] {
        &self.children
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        self.children[node][0] <= 0
    }

    /// Bucket for leaf number `leaf`, padding included.
    pub fn leaf_bucket(&self, leaf: usize) -> &[isize] {
        &self.indices[leaf]
    }

    /// Descends from the root to a leaf and returns its bucket verbatim, padding
    /// included. Ties on a splitting plane are broken with `rng`.
    pub fn search<R: Rng + ?Sized>(&self, point: &[f32], rng: &mut R) -> &[isize] {
        let mut node = 0;
        while !self.is_leaf(node) {
            let margin = self.hyperplanes[node].margin(self.offsets[node], point);
            let child = match select_side(margin, rng) {
                Side::Left => self.children[node][0],
                Side::Right => self.children[node][1],
            };
            node = child as usize;
        }
        &self.indices[(-self.children[node][0]) as usize]
    }

    /// Structural checks: array lengths agree, internal children point at later
    /// nodes, leaf codes name existing buckets, and no bucket is pure padding.
    pub fn check_invariants(&self) -> Result<()> {
        let n_nodes = self.children.len();
        if n_nodes == 0 {
            return Err(SearchError::MalformedTree("tree has no nodes".to_string()));
        }
        if self.hyperplanes.len() != n_nodes || self.offsets.len() != n_nodes {
            return Err(SearchError::MalformedTree(format!(
                "{} nodes but {} hyperplanes and {} offsets",
                n_nodes,
                self.hyperplanes.len(),
                self.offsets.len()
            )));
        }

        let mut leaf_seen = vec![false; self.indices.len()];
        for (node, &[left, right]) in self.children.iter().enumerate() {
            if left <= 0 {
                let leaf = (-left) as usize;
                if leaf >= self.indices.len() {
                    return Err(SearchError::MalformedTree(format!("node {} names missing leaf {}", node, leaf)));
                }
                if std::mem::replace(&mut leaf_seen[leaf], true) {
                    return Err(SearchError::MalformedTree(format!("leaf {} is shared by two nodes", leaf)));
                }
            } else {
                for child in [left, right] {
                    if child as usize <= node || child as usize >= n_nodes {
                        return Err(SearchError::MalformedTree(format!(
                            "node {} has out-of-order child {}",
                            node, child
                        )));
                    }
                }
            }
        }

        if let Some(leaf) = leaf_seen.iter().position(|seen| !seen) {
            return Err(SearchError::MalformedTree(format!("leaf {} is unreachable", leaf)));
        }
        if let Some(leaf) = self.indices.iter().position(|bucket| bucket.iter().all(|&i| i < 0)) {
            return Err(SearchError::MalformedTree(format!("leaf {} is empty", leaf)));
        }
        Ok(())
    }

    /// `true` when every index in `0..n_points` sits in exactly one bucket.
    pub fn covers_exactly(&self, n_points: usize) -> bool {
        let mut seen = vec![false; n_points];
        for &index in self.indices.iter().flatten() {
            if index == LEAF_PADDING {
                continue;
            }
            if index < 0 || index as usize >= n_points || std::mem::replace(&mut seen[index as usize], true) {
                return false;
            }
        }
        seen.into_iter().all(|s| s)
    }
}

/// Node of a tree under construction, before flattening.
enum BuildNode {
    Split { hyperplane: Hyperplane, offset: f32, left: usize, right: usize },
    Leaf { points: Vec<usize> },
}

/// Builds one random projection tree over every row of `data`.
pub fn build_tree<M, R>(data: &M, angular: bool, leaf_size: usize, rng: &mut R) -> FlatTree
where
    M: Matrix + ?Sized,
    R: Rng + ?Sized,
{
    let mut nodes = Vec::new();
    build_recursive(data, (0..data.rows()).collect(), angular, leaf_size, 0, rng, &mut nodes);
    flatten(nodes)
}

/// Pushes the subtree for `points` in pre-order and returns its root position.
fn build_recursive<M, R>(
    data: &M,
    points: Vec<usize>,
    angular: bool,
    leaf_size: usize,
    depth: usize,
    rng: &mut R,
    nodes: &mut Vec<BuildNode>,
) -> usize
where
    M: Matrix + ?Sized,
    R: Rng + ?Sized,
{
    let position = nodes.len();
    if points.len() <= leaf_size || points.len() < 2 || depth >= MAX_DEPTH {
        nodes.push(BuildNode::Leaf { points });
        return position;
    }

    let (hyperplane, offset, left_points, right_points) = split_points(data, &points, angular, rng);

    // Reserve this node's slot; children follow it in pre-order.
    nodes.push(BuildNode::Leaf { points: Vec::new() });
    let left = build_recursive(data, left_points, angular, leaf_size, depth + 1, rng, nodes);
    let right = build_recursive(data, right_points, angular, leaf_size, depth + 1, rng, nodes);
    nodes[position] = BuildNode::Split { hyperplane, offset, left, right };
    position
}

/// Splits `points` (at least two) by the hyperplane between two random pivots.
/// Both halves are guaranteed non-empty.
fn split_points<M, R>(
    data: &M,
    points: &[usize],
    angular: bool,
    rng: &mut R,
) -> (Hyperplane, f32, Vec<usize>, Vec<usize>)
where
    M: Matrix + ?Sized,
    R: Rng + ?Sized,
{
    // Two distinct positions within `points`
    let left_pos = rng.gen_range(0..points.len());
    let mut right_pos = rng.gen_range(0..points.len() - 1);
    if right_pos >= left_pos {
        right_pos += 1;
    }
    let (left_pivot, right_pivot) = (points[left_pos], points[right_pos]);
    let left_row = data.row(left_pivot);
    let right_row = data.row(right_pivot);

    let (hyperplane, offset) = if angular {
        angular_hyperplane(&left_row, &right_row)
    } else {
        euclidean_hyperplane(&left_row, &right_row)
    };

    // Sparse rows get a hyperplane restricted to the union of the pivots' columns.
    let hyperplane = match (data.row_support(left_pivot), data.row_support(right_pivot)) {
        (Some(mut support), Some(other)) => {
            support.extend(other);
            support.sort_unstable();
            support.dedup();
            let weights = support.iter().map(|&col| hyperplane[col]).collect();
            Hyperplane::sparse(support, weights)
        }
        _ => Hyperplane::dense(hyperplane),
    };

    let mut left_points = Vec::with_capacity(points.len() / 2 + 1);
    let mut right_points = Vec::with_capacity(points.len() / 2 + 1);
    for &p in points {
        let margin = hyperplane.margin(offset, &data.row(p));
        match select_side(margin, rng) {
            Side::Left => left_points.push(p),
            Side::Right => right_points.push(p),
        }
    }

    if left_points.is_empty() || right_points.is_empty() {
        // The hyperplane failed to separate anything: fall back to a random half split.
        let mut shuffled = points.to_vec();
        shuffled.shuffle(rng);
        right_points = shuffled.split_off(shuffled.len() / 2);
        left_points = shuffled;
    }

    (hyperplane, offset, left_points, right_points)
}

/// Normal `left - right` through the midpoint of the pivots.
fn euclidean_hyperplane(left: &[f32], right: &[f32]) -> (Vec<f32>, f32) {
    let normal: Vec<f32> = left.iter().zip(right.iter()).map(|(l, r)| l - r).collect();
    let offset = -normal
        .iter()
        .zip(left.iter().zip(right.iter()))
        .map(|(w, (l, r))| w * (l + r) / 2.0)
        .sum::<f32>();
    (normal, offset)
}

/// Normal between the unit-length pivots, through the origin.
fn angular_hyperplane(left: &[f32], right: &[f32]) -> (Vec<f32>, f32) {
    let norm = |v: &[f32]| {
        let n = dot(v, v).sqrt();
        if n > 0.0 { n } else { 1.0 }
    };
    let (left_norm, right_norm) = (norm(left), norm(right));
    let mut normal: Vec<f32> = left
        .iter()
        .zip(right.iter())
        .map(|(l, r)| l / left_norm - r / right_norm)
        .collect();
    let normal_norm = norm(&normal);
    normal.iter_mut().for_each(|w| *w /= normal_norm);
    (normal, 0.0)
}

/// Converts pre-order build nodes into the array layout. Node 0 is the root, so an
/// internal node's children are always positive.
fn flatten(nodes: Vec<BuildNode>) -> FlatTree {
    let n_nodes = nodes.len();
    let mut hyperplanes = Vec::with_capacity(n_nodes);
    let mut offsets = Vec::with_capacity(n_nodes);
    let mut children = Vec::with_capacity(n_nodes);
    let mut buckets: Vec<Vec<usize>> = Vec::new();

    for node in nodes {
        match node {
            BuildNode::Split { hyperplane, offset, left, right } => {
                hyperplanes.push(hyperplane);
                offsets.push(offset);
                children.push([left as isize, right as isize]);
            }
            BuildNode::Leaf { points } => {
                hyperplanes.push(Hyperplane::empty());
                offsets.push(0.0);
                children.push([-(buckets.len() as isize), -1]);
                buckets.push(points);
            }
        }
    }

    let width = buckets.iter().map(Vec::len).max().unwrap_or(0);
    let indices = buckets
        .into_iter()
        .map(|bucket| {
            let mut padded: Vec<isize> = bucket.into_iter().map(|p| p as isize).collect();
            padded.resize(width, LEAF_PADDING);
            padded
        })
        .collect();

    FlatTree { hyperplanes, offsets, children, indices }
}

/// `min(64, 5 + round(sqrt(n) / 20))` trees.
pub fn default_n_trees(n_points: usize) -> usize {
    (5 + ((n_points as f64).sqrt() / 20.0).round() as usize).min(64)
}

/// An ensemble of independently built trees over one dataset. Read-only once
/// built, and shared across searches through an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Forest {
    trees: Vec<FlatTree>,
    n_points: usize,
    dim: usize,
}

impl Forest {
    /// Builds `n_trees` trees in parallel. Each tree draws from its own stream
    /// derived from one seed taken from `rng`.
    pub fn build<M, D, R>(data: &M, metric: &D, n_trees: usize, leaf_size: usize, rng: &mut R) -> Result<Self>
    where
        M: Matrix,
        D: Distance + ?Sized,
        R: Rng + ?Sized,
    {
        if metric.is_precomputed() {
            return Err(SearchError::InvalidConfig(
                "random projection trees need feature vectors, not precomputed distances".to_string(),
            ));
        }
        if n_trees == 0 || leaf_size == 0 {
            return Err(SearchError::InvalidConfig(format!(
                "n_trees and leaf_size must be positive, got {} and {}",
                n_trees, leaf_size
            )));
        }
        if data.rows() == 0 || data.cols() == 0 {
            return Err(SearchError::EmptyMatrix);
        }

        let angular = metric.is_angular();
        let base_seed = rng.r#gen::<u64>();
        let trees: Vec<FlatTree> = (0..n_trees)
            .into_par_iter()
            .map(|t| {
                let mut tree_rng = stream_rng(base_seed, t as u64);
                build_tree(data, angular, leaf_size, &mut tree_rng)
            })
            .collect();

        for (t, tree) in trees.iter().enumerate() {
            debug_assert!(tree.check_invariants().is_ok(), "tree {} broke the flat layout", t);
            debug_assert!(tree.covers_exactly(data.rows()), "tree {} lost or duplicated points", t);
            debug!(tree = t, nodes = tree.n_nodes(), leaves = tree.n_leaves(), "built tree");
        }
        info!(n_trees, leaf_size, n_points = data.rows(), angular, "built random projection forest");

        Ok(Forest { trees, n_points: data.rows(), dim: data.cols() })
    }

    pub fn trees(&self) -> &[FlatTree] {
        &self.trees
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Number of points the forest was built over.
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Point indices sharing a leaf with `point` in any tree, padding removed.
    /// The same index may come back once per tree.
    pub fn leaf_candidates<R: Rng + ?Sized>(&self, point: &[f32], rng: &mut R) -> Vec<usize> {
        let mut candidates = Vec::new();
        for tree in &self.trees {
            candidates.extend(tree.search(point, rng).iter().filter(|&&i| i >= 0).map(|&i| i as usize));
        }
        candidates
    }
}
