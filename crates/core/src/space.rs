//! Space: the binding of a distance metric to a quantization level.
//!
//! A [`Space`] selects the concrete distance and similarity kernels once at
//! construction and carries the parameter block the graph layer needs. It is
//! immutable after construction and cheap to clone, so a single space is
//! shared freely between the graph, the brute-force path, and the engine.

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{Error, Result};
use crate::quantization::{self, DistFn, DistParams, QuantLevel, QuantizerDispatch};

/// Distance metric served by a space. Distances are "lower is better".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared Euclidean distance.
    L2,
    /// Negative inner product.
    Ip,
    /// Cosine distance `1 - cos`.
    Cosine,
}

impl Metric {
    /// Canonical string form used in metadata records.
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Ip => "ip",
            Metric::Cosine => "cosine",
        }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "l2" => Ok(Metric::L2),
            "ip" => Ok(Metric::Ip),
            "cosine" => Ok(Metric::Cosine),
            other => Err(Error::InvalidArgument(format!("unknown metric '{other}'"))),
        }
    }
}

/// A `(metric, dim, quant_level)` binding with its selected kernels.
#[derive(Clone)]
pub struct Space {
    metric: Metric,
    level: QuantLevel,
    data_size: usize,
    dist: DistFn,
    sim: DistFn,
    params: DistParams,
}

impl std::fmt::Debug for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Space")
            .field("metric", &self.metric)
            .field("dim", &self.params.dim)
            .field("level", &self.level)
            .field("data_size", &self.data_size)
            .finish()
    }
}

impl Space {
    /// Bind a metric and quantization level for `dim`-component vectors.
    ///
    /// Fails with `InvalidArgument` for a zero or oversized dimension;
    /// every `(metric, level)` pair this crate ships is supported, so the
    /// failure surface is validated up front, before any insert.
    pub fn new(metric: Metric, dim: usize, level: QuantLevel) -> Result<Self> {
        if dim == 0 || dim > config::MAX_DIMENSION {
            return Err(Error::InvalidArgument(format!(
                "dimension {dim} outside 1..={}",
                config::MAX_DIMENSION
            )));
        }
        let dispatch = QuantizerDispatch::for_level(level);
        let (dist, sim) = match metric {
            Metric::L2 => (dispatch.dist_l2, dispatch.sim_l2),
            Metric::Ip => (dispatch.dist_ip, dispatch.sim_ip),
            Metric::Cosine => (dispatch.dist_cosine, dispatch.sim_cosine),
        };
        Ok(Self {
            metric,
            level,
            data_size: level.storage_size(dim),
            dist,
            sim,
            params: DistParams { dim, level },
        })
    }

    /// Bytes per stored vector at this space's level.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.params.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn quant_level(&self) -> QuantLevel {
        self.level
    }

    /// Kernel parameter block (dimension + level).
    pub fn params(&self) -> &DistParams {
        &self.params
    }

    /// Distance between two encoded vectors. Lower is better.
    #[inline]
    pub fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
        (self.dist)(a, b, &self.params)
    }

    /// Similarity between two encoded vectors. Higher is better.
    #[inline]
    pub fn similarity(&self, a: &[u8], b: &[u8]) -> f32 {
        (self.sim)(a, b, &self.params)
    }

    /// Convert a distance produced by this space into a similarity score.
    pub fn similarity_from_distance(&self, dist: f32) -> f32 {
        match self.metric {
            Metric::L2 => 1.0 / (1.0 + dist.max(0.0)),
            Metric::Ip => -dist,
            Metric::Cosine => 1.0 - dist,
        }
    }

    /// Encode a float vector for storage, validating its dimension.
    pub fn quantize(&self, vector: &[f32]) -> Result<Vec<u8>> {
        if vector.len() != self.params.dim {
            return Err(Error::InvalidArgument(format!(
                "vector dimension {} does not match space dimension {}",
                vector.len(),
                self.params.dim
            )));
        }
        Ok(quantization::quantize(self.level, vector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_strings() {
        for m in [Metric::L2, Metric::Ip, Metric::Cosine] {
            assert_eq!(Metric::parse(m.as_str()).unwrap(), m);
        }
        assert!(Metric::parse("euclid").is_err());
    }

    #[test]
    fn test_rejects_bad_dimension() {
        assert!(Space::new(Metric::L2, 0, QuantLevel::Int8).is_err());
        assert!(Space::new(Metric::L2, config::MAX_DIMENSION + 1, QuantLevel::F32).is_err());
    }

    #[test]
    fn test_quantize_checks_dimension() {
        let space = Space::new(Metric::L2, 4, QuantLevel::Int8).unwrap();
        assert!(space.quantize(&[1.0, 2.0]).is_err());
        assert_eq!(space.quantize(&[1.0; 4]).unwrap().len(), space.data_size());
    }

    #[test]
    fn test_distance_and_similarity_agree() {
        let space = Space::new(Metric::Cosine, 3, QuantLevel::F32).unwrap();
        let a = space.quantize(&[1.0, 0.0, 0.0]).unwrap();
        let b = space.quantize(&[0.0, 1.0, 0.0]).unwrap();
        let d = space.distance(&a, &b);
        let s = space.similarity(&a, &b);
        assert!((d - (1.0 - s)).abs() < 1e-6);
        assert!((space.similarity_from_distance(d) - s).abs() < 1e-6);
    }

    #[test]
    fn test_l2_similarity_from_distance() {
        let space = Space::new(Metric::L2, 2, QuantLevel::F32).unwrap();
        assert!((space.similarity_from_distance(0.0) - 1.0).abs() < 1e-6);
        assert!(space.similarity_from_distance(3.0) < 0.5);
    }
}
