// Declare your algorithm modules
pub mod common_types;
pub mod error;
pub mod knn;

pub use common_types::{CsrMatrix, DenseMatrix, Matrix};
pub use error::{DistanceFault, Result, SearchError};
pub use knn::graph::SearchGraph;
pub use knn::nn_descent::{IndexedDistances, NearestNeighborSearch, NeighborSearchConfig, SearchStats, SearchStrategy};
pub use knn::pairwise::{exact_nearest_neighbors, exact_neighbors_between, pairwise_distances, pairwise_distances_between};
pub use knn::rp_tree::{FlatTree, Forest, Hyperplane};
pub use knn::{Distance, Metric};

#[cfg(feature = "python")]
mod python {
    use std::sync::Arc;

    use pyo3::exceptions::PyValueError;
    use pyo3::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::common_types::DenseMatrix;
    use crate::error::SearchError;
    use crate::knn::graph::SearchGraph;
    use crate::knn::nn_descent::{IndexedDistances, NearestNeighborSearch, NeighborSearchConfig, SearchStrategy};
    use crate::knn::{pairwise, Metric};

    fn to_py_err(err: SearchError) -> PyErr {
        PyErr::new::<PyValueError, _>(err.to_string())
    }

    fn dense_from_py(rows: Vec<Vec<f32>>) -> PyResult<DenseMatrix> {
        DenseMatrix::from_rows(rows).map_err(to_py_err)
    }

    fn parse_metric(name: &str) -> PyResult<Metric> {
        name.parse::<Metric>().map_err(to_py_err)
    }

    /// Python-friendly representation of SearchStrategy
    #[pyclass(name = "SearchStrategy")]
    #[derive(Clone, Debug)]
    enum PySearchStrategy {
        BruteForce,
        Approximate,
    }

    impl From<SearchStrategy> for PySearchStrategy {
        fn from(val: SearchStrategy) -> Self {
            match val {
                SearchStrategy::BruteForce => PySearchStrategy::BruteForce,
                SearchStrategy::Approximate => PySearchStrategy::Approximate,
            }
        }
    }

    /// Neighbor lists over a fitted dataset. Keeps the data, graph and forest
    /// around so new points can be queried against it.
    #[pyclass(name = "NeighborIndex")]
    struct PyNeighborIndex {
        data: DenseMatrix,
        metric: Metric,
        search: NearestNeighborSearch,
        result: IndexedDistances,
        graph: SearchGraph,
        seed: u64,
    }

    #[pymethods]
    impl PyNeighborIndex {
        #[new]
        #[pyo3(signature = (data, n_neighbors = 15, metric = "euclidean", seed = 42, n_trees = None, max_rounds = None))]
        fn new(
            data: Vec<Vec<f32>>,
            n_neighbors: usize,
            metric: &str,
            seed: u64,
            n_trees: Option<usize>,
            max_rounds: Option<usize>,
        ) -> PyResult<Self> {
            let data = dense_from_py(data)?;
            let metric = parse_metric(metric)?;
            let config = NeighborSearchConfig { n_trees, max_rounds, ..NeighborSearchConfig::new(n_neighbors) };
            let search = NearestNeighborSearch::new(config);
            let mut rng = StdRng::seed_from_u64(seed);
            let result = search.fit(&data, &metric, &mut rng).map_err(to_py_err)?;
            let graph = SearchGraph::from_indexed(&result, true);
            Ok(PyNeighborIndex { data, metric, search, result, graph, seed })
        }

        /// Neighbors in the fitted data for each query row, as `(indices, distances)`.
        fn query(&self, queries: Vec<Vec<f32>>) -> PyResult<(Vec<Vec<usize>>, Vec<Vec<f32>>)> {
            let queries = dense_from_py(queries)?;
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
            let forest = self.result.forest().map(Arc::clone);
            let found = self
                .search
                .query(&queries, &self.data, &self.metric, &self.graph, forest, &mut rng)
                .map_err(to_py_err)?;
            Ok(found.into_parts())
        }

        #[getter]
        fn indices(&self) -> Vec<Vec<usize>> {
            self.result.indices().to_vec()
        }

        #[getter]
        fn distances(&self) -> Vec<Vec<f32>> {
            self.result.distances().to_vec()
        }

        #[getter]
        fn search_strategy(&self) -> PySearchStrategy {
            self.result.stats().strategy.into()
        }
    }

    /// k-nearest-neighbor lists for every row of `data`, as `(indices, distances)`.
    #[pyfunction]
    #[pyo3(signature = (data, n_neighbors, metric = "euclidean", seed = 42, n_trees = None))]
    fn nearest_neighbors(
        data: Vec<Vec<f32>>,
        n_neighbors: usize,
        metric: &str,
        seed: u64,
        n_trees: Option<usize>,
    ) -> PyResult<(Vec<Vec<usize>>, Vec<Vec<f32>>)> {
        let data = dense_from_py(data)?;
        let metric = parse_metric(metric)?;
        let config = NeighborSearchConfig { n_trees, ..NeighborSearchConfig::new(n_neighbors) };
        let mut rng = StdRng::seed_from_u64(seed);
        let result = NearestNeighborSearch::new(config).fit(&data, &metric, &mut rng).map_err(to_py_err)?;
        Ok(result.into_parts())
    }

    /// Full distance matrix between the rows of `x`, or between `x` and `y`.
    #[pyfunction]
    #[pyo3(signature = (x, y = None, metric = "euclidean"))]
    fn pairwise_distances(x: Vec<Vec<f32>>, y: Option<Vec<Vec<f32>>>, metric: &str) -> PyResult<Vec<Vec<f32>>> {
        let x = dense_from_py(x)?;
        let metric = parse_metric(metric)?;
        let table = match y {
            Some(y) => pairwise::pairwise_distances_between(&x, &dense_from_py(y)?, &metric),
            None => pairwise::pairwise_distances(&x, &metric),
        }
        .map_err(to_py_err)?;
        Ok(table.to_rows())
    }

    /// A Python module implemented in Rust. The name of this function must match
    /// the `lib.name` in `Cargo.toml`.
    #[pymodule]
    fn approximate_neighbors(_py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_function(wrap_pyfunction!(nearest_neighbors, m)?)?;
        m.add_function(wrap_pyfunction!(pairwise_distances, m)?)?;
        m.add_class::<PySearchStrategy>()?;
        m.add_class::<PyNeighborIndex>()?;
        Ok(())
    }
}
