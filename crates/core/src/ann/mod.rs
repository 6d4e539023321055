//! Approximate nearest neighbor indexes.
//!
//! Two backends share the [`Ann`] contract:
//! - [`hnsw::Hnsw`]: incremental graph index. Supports `append` and logical
//!   (tombstoned) `delete`.
//! - [`forest::Forest`]: static random-hyperplane forest. Bulk built only;
//!   `append` and `delete` return [`Error::UnsupportedOperation`].
//!
//! Labels are dense `u32` values assigned in input order starting at the
//! current offset. Vectors are normalized on the way in so cosine similarity
//! reduces to an inner product, and every backend reports scores where
//! **higher is more similar**.

/// Static random-hyperplane forest.
pub mod forest;
/// Incremental HNSW graph index.
pub mod hnsw;
/// Atomic, checksummed blob persistence shared by the backends.
pub mod persistence;

use crate::config::{Backend, IndexConfig};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A ranked search hit: `(label, score)`.
pub type Neighbor = (u32, f32);

/// Similarity space of an index. Always derived by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Inner-product distance `1 - dot(a, b)`, converted back to a score on output.
    Ip,
    /// Raw dot product, returned unmodified.
    Dot,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::Ip => f.write_str("ip"),
            Metric::Dot => f.write_str("dot"),
        }
    }
}

/// Operations a backend supports beyond build/search/save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub append: bool,
    pub delete: bool,
}

/// Common interface over ANN backends.
///
/// Instances are single-owner: no internal locking is done, callers that
/// share an index across threads serialize access themselves.
pub trait Ann: Send {
    /// Backend implementing this index.
    fn backend(&self) -> Backend;

    /// Which optional operations are available.
    fn capabilities(&self) -> Capabilities;

    /// Configuration, including the derived dimensions and metric.
    fn config(&self) -> &IndexConfig;

    /// Builds the index from scratch. Labels `0..n` are assigned in input order.
    fn index(&mut self, vectors: &[Vec<f32>]) -> Result<()>;

    /// Adds vectors with labels `offset..offset + m`.
    fn append(&mut self, _vectors: &[Vec<f32>]) -> Result<()> {
        Err(Error::unsupported("append", self.backend()))
    }

    /// Tombstones labels. Unknown or already-deleted labels are ignored.
    /// Returns the number of labels actually removed.
    fn delete(&mut self, _labels: &[u32]) -> Result<usize> {
        Err(Error::unsupported("delete", self.backend()))
    }

    /// Returns up to `limit` neighbors per query, best first.
    fn search(&self, queries: &[Vec<f32>], limit: usize) -> Result<Vec<Vec<Neighbor>>>;

    /// Number of live entries.
    fn count(&self) -> usize;

    /// Next label to assign.
    fn offset(&self) -> u32;

    /// Persists the index to `path`, replacing any existing file.
    fn save(&self, path: &Path) -> Result<()>;
}

/// Creates an empty index for the configured backend.
pub fn create(config: IndexConfig) -> Box<dyn Ann> {
    match config.backend {
        Backend::Hnsw => Box::new(hnsw::Hnsw::new(config)),
        Backend::Annoy => Box::new(forest::Forest::new(config)),
    }
}

/// Loads a persisted index for the configured backend.
///
/// Fails with [`Error::ConfigMismatch`] when the stored dimensions or metric
/// disagree with `config`, and [`Error::CorruptIndex`] when the blob is unreadable.
pub fn load(config: IndexConfig, path: &Path) -> Result<Box<dyn Ann>> {
    Ok(match config.backend {
        Backend::Hnsw => Box::new(hnsw::Hnsw::load(config, path)?),
        Backend::Annoy => Box::new(forest::Forest::load(config, path)?),
    })
}

/// Compute dot product between two vectors.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vectors must have same dimension");
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Normalize a vector to unit length (for cosine similarity via dot product).
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        v.to_vec()
    } else {
        v.iter().map(|x| x / norm).collect()
    }
}

/// Sorts hits by descending score, breaking ties by ascending label, then truncates.
pub fn rank(hits: &mut Vec<Neighbor>, limit: usize) {
    hits.sort_unstable_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    hits.truncate(limit);
}

/// Resolves the index dimension from configuration and the first vector,
/// rejecting vectors of any other width.
///
/// An empty set with no configured width resolves to 0 and leaves
/// `config.dimensions` unset, so the next non-empty build picks its width.
pub(crate) fn check_dimensions(config: &mut IndexConfig, vectors: &[Vec<f32>]) -> Result<usize> {
    let dimension = match (config.dimensions, vectors.first()) {
        (Some(d), _) => d,
        (None, Some(v)) => v.len(),
        (None, None) => return Ok(0),
    };
    for v in vectors {
        if v.len() != dimension {
            return Err(Error::DimensionMismatch {
                expected: dimension,
                found: v.len(),
            });
        }
    }
    config.dimensions = Some(dimension);
    Ok(dimension)
}

/// Verifies that a stored index matches the configured dimensions and metric,
/// then records the stored values in `config`. A stored width of 0 comes from
/// an index built over no vectors and matches any configuration.
pub(crate) fn check_stored(
    config: &mut IndexConfig,
    dimension: usize,
    metric: Metric,
) -> Result<()> {
    if let Some(expected) = config.dimensions {
        if dimension != 0 && expected != dimension {
            return Err(Error::ConfigMismatch {
                field: "dimensions",
                expected: expected.to_string(),
                found: dimension.to_string(),
            });
        }
    }
    if let Some(expected) = config.metric {
        if expected != metric {
            return Err(Error::ConfigMismatch {
                field: "metric",
                expected: expected.to_string(),
                found: metric.to_string(),
            });
        }
    }
    if dimension != 0 {
        config.dimensions = Some(dimension);
    }
    config.metric = Some(metric);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_unit_length() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_rank_ties_by_label() {
        let mut hits = vec![(5, 0.5), (2, 0.9), (1, 0.5), (7, 0.1)];
        rank(&mut hits, 3);
        assert_eq!(hits, vec![(2, 0.9), (1, 0.5), (5, 0.5)]);
    }

    #[test]
    fn test_check_dimensions_mismatch() {
        let mut config = IndexConfig::default();
        let err = check_dimensions(&mut config, &[vec![1.0, 0.0], vec![1.0]]).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                found: 1
            }
        ));
    }

    #[test]
    fn test_check_dimensions_empty_leaves_width_unset() {
        let mut config = IndexConfig::default();
        assert_eq!(check_dimensions(&mut config, &[]).unwrap(), 0);
        assert_eq!(config.dimensions, None);

        assert_eq!(check_dimensions(&mut config, &[vec![1.0; 3]]).unwrap(), 3);
        assert_eq!(config.dimensions, Some(3));
    }

    #[test]
    fn test_check_stored_empty_index_matches_any_width() {
        let mut config = IndexConfig {
            dimensions: Some(8),
            ..IndexConfig::default()
        };
        check_stored(&mut config, 0, Metric::Ip).unwrap();
        assert_eq!(config.dimensions, Some(8));

        let mut config = IndexConfig::default();
        check_stored(&mut config, 0, Metric::Ip).unwrap();
        assert_eq!(config.dimensions, None);
        assert_eq!(config.metric, Some(Metric::Ip));
    }

    #[test]
    fn test_check_stored_metric_mismatch() {
        let mut config = IndexConfig {
            metric: Some(Metric::Dot),
            ..IndexConfig::default()
        };
        let err = check_stored(&mut config, 4, Metric::Ip).unwrap_err();
        assert!(matches!(err, Error::ConfigMismatch { field: "metric", .. }));
    }

    #[test]
    fn test_static_backend_capabilities() {
        let index = create(IndexConfig::new(Backend::Annoy));
        assert!(!index.capabilities().append);
        assert!(!index.capabilities().delete);
        let index = create(IndexConfig::new(Backend::Hnsw));
        assert!(index.capabilities().append);
        assert!(index.capabilities().delete);
    }
}
