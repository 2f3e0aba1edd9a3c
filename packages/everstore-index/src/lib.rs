//! In-process HNSW vector index for approximate nearest-neighbor search.
//!
//! Pure Rust, no native dependency, usable on any target. The index is
//! platform-independent and serializes to a compact little-endian blob so
//! that storage adapters can persist it next to the entities it covers.
//!
//! # Examples
//!
//! ```rust
//! use everstore_index::{HnswConfig, HnswIndex, Metric};
//!
//! let mut index = HnswIndex::new(HnswConfig::new(3, Metric::Cosine));
//! index.insert(1, &[1.0, 0.0, 0.0]).unwrap();
//! index.insert(2, &[0.0, 1.0, 0.0]).unwrap();
//!
//! let hits = index.search(&[1.0, 0.1, 0.0], 1, None).unwrap();
//! assert_eq!(hits[0].id, 1);
//! ```

mod distance;
mod error;
mod hnsw;

pub use distance::{distance, Metric};
pub use error::{IndexError, Result};
pub use hnsw::{HnswConfig, HnswIndex, Neighbor};
