//! Read-only adjacency used to find "neighbors of neighbors" during refinement.

use super::nn_descent::IndexedDistances;

/// Compressed adjacency lists: the neighbors of `v` are
/// `indices[indptr[v]..indptr[v + 1]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchGraph {
    indptr: Vec<usize>,
    indices: Vec<usize>,
}

impl SearchGraph {
    /// Builds the graph from one neighbor list per vertex. With `symmetrize`, every
    /// edge `u -> v` also gets its reverse `v -> u`. Self loops and repeated edges
    /// are dropped.
    pub fn from_neighbor_lists<I>(lists: &[I], symmetrize: bool) -> Self
    where
        I: AsRef<[usize]>,
    {
        let n = lists.len();
        let mut adjacency: Vec<Vec<usize>> = lists.iter().map(|l| l.as_ref().to_vec()).collect();
        if symmetrize {
            for (u, list) in lists.iter().enumerate() {
                for &v in list.as_ref() {
                    if v < n {
                        adjacency[v].push(u);
                    }
                }
            }
        }

        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        indptr.push(0);
        for (v, mut list) in adjacency.into_iter().enumerate() {
            list.sort_unstable();
            list.dedup();
            indices.extend(list.into_iter().filter(|&u| u != v));
            indptr.push(indices.len());
        }
        SearchGraph { indptr, indices }
    }

    /// Graph over the neighbor lists of a finished search.
    pub fn from_indexed(result: &IndexedDistances, symmetrize: bool) -> Self {
        Self::from_neighbor_lists(result.indices(), symmetrize)
    }

    pub fn n_vertices(&self) -> usize {
        self.indptr.len() - 1
    }

    pub fn n_edges(&self) -> usize {
        self.indices.len()
    }

    /// First edge `(v, u)` whose target is not a vertex of this graph. Directed
    /// lists are stored as given, so a caller-built graph can hold such edges.
    pub fn dangling_edge(&self) -> Option<(usize, usize)> {
        let n = self.n_vertices();
        (0..n).find_map(|v| self.neighbors(v).iter().find(|&&u| u >= n).map(|&u| (v, u)))
    }

    /// Neighbors of `v`, ascending. Out-of-range vertices have none.
    pub fn neighbors(&self, v: usize) -> &[usize] {
        if v >= self.n_vertices() {
            return &[];
        }
        &self.indices[self.indptr[v]..self.indptr[v + 1]]
    }
}
