//! Per-repository configuration.

use everstore_index::Metric;
use everstore_storage::{SnapshotCadence, VectorIndexConfig};

use crate::chunker::ChunkerConfig;
use crate::error::{EngineError, Result};

/// Which chunker preset a repository's chunkable entities use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkingPreset {
    Parent,
    Child,
    Custom(ChunkerConfig),
}

impl ChunkingPreset {
    pub fn config(&self) -> ChunkerConfig {
        match self {
            ChunkingPreset::Parent => ChunkerConfig::parent(),
            ChunkingPreset::Child => ChunkerConfig::child(),
            ChunkingPreset::Custom(config) => *config,
        }
    }
}

/// Recognized options for one entity repository.
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    /// Embedding dimension `D`; the reference value is 384.
    pub dimension: usize,
    pub metric: Metric,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Overrides the entity's declared cadence when set.
    pub snapshot_cadence: Option<SnapshotCadence>,
    pub chunking_preset: ChunkingPreset,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            metric: Metric::Cosine,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            snapshot_cadence: None,
            chunking_preset: ChunkingPreset::Parent,
        }
    }
}

impl RepositoryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(EngineError::config("dimension must be positive"));
        }
        if self.m == 0 {
            return Err(EngineError::config("M must be positive"));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(EngineError::config("ef parameters must be positive"));
        }
        if let Some(SnapshotCadence::Every(0)) = self.snapshot_cadence {
            return Err(EngineError::config("snapshot cadence must be positive"));
        }
        self.chunking_preset.config().validate()?;
        Ok(())
    }

    pub fn vector_index(&self) -> VectorIndexConfig {
        VectorIndexConfig {
            dimension: self.dimension,
            metric: self.metric,
            m: self.m,
            ef_construction: self.ef_construction,
            ef_search: self.ef_search,
        }
    }

    pub fn chunker(&self) -> ChunkerConfig {
        self.chunking_preset.config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RepositoryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dimension, 384);
        assert_eq!(config.metric, Metric::Cosine);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let config = RepositoryConfig {
            dimension: 0,
            ..RepositoryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let config = RepositoryConfig {
            snapshot_cadence: Some(SnapshotCadence::Every(0)),
            ..RepositoryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vector_index_conversion() {
        let config = RepositoryConfig::default();
        let index = config.vector_index();
        assert_eq!(index.dimension, 384);
        assert_eq!(index.m, 16);
    }
}
