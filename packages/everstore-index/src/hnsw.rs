//! Hierarchical Navigable Small World graph.
//!
//! Layered proximity graph over fixed-dimension vectors. Inserts place each
//! node at a geometrically distributed level; searches descend greedily to
//! layer 1 and run a beam search at layer 0. Average insert and search cost
//! is `O(log N)`; memory is `O(N·M) + O(N·D)`.
//!
//! Structural invariants:
//! - every stored id is unique
//! - the entry point exists whenever the index is non-empty and sits at the
//!   highest occupied level
//! - no edge points to an absent id

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::distance::{distance, Metric};
use crate::error::{IndexError, Result};

/// Hard cap on node levels; the geometric distribution makes anything this
/// deep astronomically unlikely, but the serialized form uses a u32.
const MAX_LEVEL_CAP: usize = 64;

/// Construction parameters for one index instance.
#[derive(Debug, Clone, Copy)]
pub struct HnswConfig {
    /// Vector dimensionality `D`; every inserted vector must match.
    pub dimensions: usize,
    /// Max connections per node per layer (`M`); layer 0 allows `2·M`.
    pub m: usize,
    /// Beam width during insert.
    pub ef_construction: usize,
    /// Default beam width during search when the caller passes none.
    pub ef_search: usize,
    pub metric: Metric,
}

impl HnswConfig {
    pub fn new(dimensions: usize, metric: Metric) -> Self {
        Self {
            dimensions,
            m: 16,
            ef_construction: 200,
            ef_search: 50,
            metric,
        }
    }

    pub fn with_m(mut self, m: usize) -> Self {
        self.m = m;
        self
    }

    pub fn with_ef(mut self, ef_construction: usize, ef_search: usize) -> Self {
        self.ef_construction = ef_construction;
        self.ef_search = ef_search;
        self
    }

    fn max_connections(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m * 2
        } else {
            self.m
        }
    }
}

/// A search hit: node id plus its distance from the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: u64,
    pub distance: f64,
}

#[derive(Debug)]
struct Node {
    id: u64,
    vector: Vec<f32>,
    /// `neighbors[l]` holds the adjacency list at layer `l`; the node's top
    /// layer is `neighbors.len() - 1`.
    neighbors: Vec<Vec<u64>>,
}

impl Node {
    fn max_layer(&self) -> usize {
        self.neighbors.len() - 1
    }
}

/// Candidate ordered by distance; max-heap by default, wrap in `Reverse`
/// for min-heap behavior.
#[derive(PartialEq)]
struct Candidate {
    dist: f64,
    id: u64,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .partial_cmp(&other.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// In-memory HNSW index over `f32` vectors.
#[derive(Debug)]
pub struct HnswIndex {
    config: HnswConfig,
    nodes: HashMap<u64, Node>,
    entry_point: Option<u64>,
    max_level: usize,
    level_norm: f64,
    rng: StdRng,
}

impl HnswIndex {
    pub fn new(config: HnswConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Deterministic level assignment for reproducible tests.
    pub fn with_seed(config: HnswConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: HnswConfig, rng: StdRng) -> Self {
        let level_norm = 1.0 / (config.m as f64).ln();
        Self {
            config,
            nodes: HashMap::new(),
            entry_point: None,
            max_level: 0,
            level_norm,
            rng,
        }
    }

    pub fn config(&self) -> &HnswConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get_vector(&self, id: u64) -> Option<&[f32]> {
        self.nodes.get(&id).map(|n| n.vector.as_slice())
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.nodes.keys().copied()
    }

    /// `level = floor(-ln(U(0,1)) · 1/ln M)`
    fn random_level(&mut self) -> usize {
        let u: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        let level = (-u.ln() * self.level_norm).floor() as usize;
        level.min(MAX_LEVEL_CAP)
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    fn dist_to(&self, query: &[f32], id: u64) -> f64 {
        distance(self.config.metric, query, &self.nodes[&id].vector)
    }

    /// Insert a vector under a fresh id.
    pub fn insert(&mut self, id: u64, vector: &[f32]) -> Result<()> {
        self.check_dimensions(vector)?;
        if self.nodes.contains_key(&id) {
            return Err(IndexError::DuplicateId(id));
        }

        let level = self.random_level();

        let Some(entry) = self.entry_point else {
            self.nodes.insert(
                id,
                Node {
                    id,
                    vector: vector.to_vec(),
                    neighbors: vec![Vec::new(); level + 1],
                },
            );
            self.entry_point = Some(id);
            self.max_level = level;
            return Ok(());
        };

        // Phase 1: greedy descent through the layers above the insertion
        // level, carrying a single entry point down.
        let mut ep = entry;
        if self.max_level > level {
            for layer in ((level + 1)..=self.max_level).rev() {
                ep = self.greedy_closest(vector, ep, layer);
            }
        }

        // Phase 2: beam search per layer from min(level, maxLevel) down to 0,
        // collecting the connection set for the new node.
        let top = level.min(self.max_level);
        let mut eps = vec![ep];
        let mut links: Vec<Vec<u64>> = vec![Vec::new(); level + 1];
        for layer in (0..=top).rev() {
            let candidates =
                self.search_layer(vector, &eps, self.config.ef_construction, layer);
            let cap = self.config.max_connections(layer);
            links[layer] = candidates.iter().take(cap).map(|c| c.id).collect();
            eps = candidates.iter().map(|c| c.id).collect();
        }

        self.nodes.insert(
            id,
            Node {
                id,
                vector: vector.to_vec(),
                neighbors: links.clone(),
            },
        );

        // Back-links, pruning any neighbor that ends up over its cap.
        for (layer, layer_links) in links.iter().enumerate() {
            for &neighbor_id in layer_links {
                let cap = self.config.max_connections(layer);
                let node = self.nodes.get_mut(&neighbor_id).expect("linked id exists");
                node.neighbors[layer].push(id);
                if node.neighbors[layer].len() > cap {
                    self.prune_neighbors(neighbor_id, layer, cap);
                }
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
        Ok(())
    }

    /// Keep only the `cap` closest neighbors of `id` at `layer`.
    fn prune_neighbors(&mut self, id: u64, layer: usize, cap: usize) {
        let base = self.nodes[&id].vector.clone();
        let mut ranked: Vec<(f64, u64)> = self.nodes[&id].neighbors[layer]
            .iter()
            .map(|&n| (distance(self.config.metric, &base, &self.nodes[&n].vector), n))
            .collect();
        ranked.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        ranked.truncate(cap);
        let kept: Vec<u64> = ranked.into_iter().map(|(_, n)| n).collect();
        self.nodes.get_mut(&id).expect("id exists").neighbors[layer] = kept;
    }

    /// Single-step greedy walk at one layer (beam of 1).
    fn greedy_closest(&self, query: &[f32], start: u64, layer: usize) -> u64 {
        let mut current = start;
        let mut current_dist = self.dist_to(query, current);
        loop {
            let mut improved = false;
            let neighbors = &self.nodes[&current].neighbors;
            if layer < neighbors.len() {
                for &n in &neighbors[layer] {
                    let d = self.dist_to(query, n);
                    if d < current_dist {
                        current = n;
                        current_dist = d;
                        improved = true;
                    }
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Beam search at one layer; returns up to `ef` candidates sorted by
    /// ascending distance.
    fn search_layer(&self, query: &[f32], eps: &[u64], ef: usize, layer: usize) -> Vec<Neighbor> {
        let mut visited: HashSet<u64> = HashSet::new();
        // Min-heap of nodes still to expand.
        let mut frontier: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::new();
        // Max-heap of the current best `ef` results.
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in eps {
            if !visited.insert(ep) {
                continue;
            }
            let d = self.dist_to(query, ep);
            frontier.push(std::cmp::Reverse(Candidate { dist: d, id: ep }));
            results.push(Candidate { dist: d, id: ep });
        }

        while let Some(std::cmp::Reverse(closest)) = frontier.pop() {
            let worst = results.peek().map(|c| c.dist).unwrap_or(f64::INFINITY);
            if closest.dist > worst && results.len() >= ef {
                break;
            }
            let neighbors = &self.nodes[&closest.id].neighbors;
            if layer >= neighbors.len() {
                continue;
            }
            for &n in &neighbors[layer] {
                if !visited.insert(n) {
                    continue;
                }
                let d = self.dist_to(query, n);
                let worst = results.peek().map(|c| c.dist).unwrap_or(f64::INFINITY);
                if results.len() < ef || d < worst {
                    frontier.push(std::cmp::Reverse(Candidate { dist: d, id: n }));
                    results.push(Candidate { dist: d, id: n });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Neighbor> = results
            .into_iter()
            .map(|c| Neighbor {
                id: c.id,
                distance: c.dist,
            })
            .collect();
        out.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        out
    }

    /// Return the `k` nearest stored vectors by ascending distance.
    ///
    /// `ef` overrides the configured search beam; it is clamped to at
    /// least `k`.
    pub fn search(&self, query: &[f32], k: usize, ef: Option<usize>) -> Result<Vec<Neighbor>> {
        self.check_dimensions(query)?;
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };

        let mut ep = entry;
        for layer in (1..=self.max_level).rev() {
            ep = self.greedy_closest(query, ep, layer);
        }

        let ef = ef.unwrap_or(self.config.ef_search).max(k);
        let mut hits = self.search_layer(query, &[ep], ef, 0);
        hits.truncate(k);
        Ok(hits)
    }

    /// Remove a node and every edge pointing at it. The surrounding graph is
    /// not rebalanced; heavy delete traffic degrades recall until the owner
    /// rebuilds the index.
    pub fn delete(&mut self, id: u64) -> bool {
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        for node in self.nodes.values_mut() {
            for layer in node.neighbors.iter_mut() {
                layer.retain(|&n| n != id);
            }
        }
        if self.entry_point == Some(id) {
            // Highest surviving level wins; lowest id breaks ties so the
            // choice is deterministic.
            let new_entry = self
                .nodes
                .values()
                .map(|n| (n.max_layer(), std::cmp::Reverse(n.id)))
                .max()
                .map(|(level, std::cmp::Reverse(id))| (level, id));
            match new_entry {
                Some((level, id)) => {
                    self.entry_point = Some(id);
                    self.max_level = level;
                }
                None => {
                    self.entry_point = None;
                    self.max_level = 0;
                }
            }
        }
        true
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Serialization
    // ═══════════════════════════════════════════════════════════════════════
    //
    // Little-endian layout:
    //   header: dimensions u32, m u32, metric u8, node_count u64,
    //           max_level u32, entry_point_id u64
    //   node:   id u64, max_layer u32, vector D×f64,
    //           per layer 0..=max_layer: neighbor_count u32, ids u64...
    //
    // `ef_construction`/`ef_search` are tuning knobs, not structure; the
    // caller supplies them again on deserialize.

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            29 + self.nodes.len() * (12 + self.config.dimensions * 8),
        );
        buf.extend_from_slice(&(self.config.dimensions as u32).to_le_bytes());
        buf.extend_from_slice(&(self.config.m as u32).to_le_bytes());
        buf.push(self.config.metric.to_tag());
        buf.extend_from_slice(&(self.nodes.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(self.max_level as u32).to_le_bytes());
        buf.extend_from_slice(&self.entry_point.unwrap_or(u64::MAX).to_le_bytes());

        let mut ids: Vec<u64> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let node = &self.nodes[&id];
            buf.extend_from_slice(&node.id.to_le_bytes());
            buf.extend_from_slice(&(node.max_layer() as u32).to_le_bytes());
            for &v in &node.vector {
                buf.extend_from_slice(&(v as f64).to_le_bytes());
            }
            for layer in &node.neighbors {
                buf.extend_from_slice(&(layer.len() as u32).to_le_bytes());
                for &n in layer {
                    buf.extend_from_slice(&n.to_le_bytes());
                }
            }
        }
        buf
    }

    pub fn deserialize(bytes: &[u8], ef_construction: usize, ef_search: usize) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let dimensions = reader.read_u32()? as usize;
        let m = reader.read_u32()? as usize;
        if m == 0 {
            return Err(IndexError::corrupt("m must be positive"));
        }
        let metric = Metric::from_tag(reader.read_u8()?)?;
        let node_count = reader.read_u64()? as usize;
        let max_level = reader.read_u32()? as usize;
        let entry_raw = reader.read_u64()?;

        let mut nodes = HashMap::with_capacity(node_count);
        for _ in 0..node_count {
            let id = reader.read_u64()?;
            let max_layer = reader.read_u32()? as usize;
            if max_layer > MAX_LEVEL_CAP {
                return Err(IndexError::corrupt(format!(
                    "node {} claims layer {}",
                    id, max_layer
                )));
            }
            let mut vector = Vec::with_capacity(dimensions);
            for _ in 0..dimensions {
                vector.push(reader.read_f64()? as f32);
            }
            let mut neighbors = Vec::with_capacity(max_layer + 1);
            for _ in 0..=max_layer {
                let count = reader.read_u32()? as usize;
                let mut layer = Vec::with_capacity(count);
                for _ in 0..count {
                    layer.push(reader.read_u64()?);
                }
                neighbors.push(layer);
            }
            if nodes
                .insert(
                    id,
                    Node {
                        id,
                        vector,
                        neighbors,
                    },
                )
                .is_some()
            {
                return Err(IndexError::corrupt(format!("duplicate node id {}", id)));
            }
        }

        let entry_point = if node_count == 0 {
            None
        } else if entry_raw == u64::MAX || !nodes.contains_key(&entry_raw) {
            return Err(IndexError::corrupt("entry point missing from node set"));
        } else {
            Some(entry_raw)
        };

        // Every edge must land on a stored node.
        for node in nodes.values() {
            for layer in &node.neighbors {
                for n in layer {
                    if !nodes.contains_key(n) {
                        return Err(IndexError::corrupt(format!(
                            "node {} links to absent id {}",
                            node.id, n
                        )));
                    }
                }
            }
        }

        let config = HnswConfig {
            dimensions,
            m,
            ef_construction,
            ef_search,
            metric,
        };
        let level_norm = 1.0 / (m as f64).ln();
        Ok(Self {
            config,
            nodes,
            entry_point,
            max_level,
            level_norm,
            rng: StdRng::from_entropy(),
        })
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(IndexError::corrupt("unexpected end of index blob"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_2d(metric: Metric) -> HnswIndex {
        HnswIndex::with_seed(HnswConfig::new(2, metric), 7)
    }

    #[test]
    fn test_insert_and_get_vector() {
        let mut index = index_2d(Metric::Euclidean);
        index.insert(1, &[0.25, 0.5]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get_vector(1), Some([0.25f32, 0.5].as_slice()));
        assert_eq!(index.get_vector(2), None);
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut index = index_2d(Metric::Euclidean);
        let err = index.insert(1, &[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_insert_duplicate_id() {
        let mut index = index_2d(Metric::Euclidean);
        index.insert(1, &[0.0, 0.0]).unwrap();
        let err = index.insert(1, &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, IndexError::DuplicateId(1)));
    }

    #[test]
    fn test_search_empty() {
        let index = index_2d(Metric::Euclidean);
        assert!(index.search(&[0.0, 0.0], 5, None).unwrap().is_empty());
    }

    #[test]
    fn test_search_self_retrieval() {
        let mut index = index_2d(Metric::Euclidean);
        for i in 0..20u64 {
            index.insert(i, &[i as f32, (i * 2) as f32]).unwrap();
        }
        for i in 0..20u64 {
            let hits = index.search(&[i as f32, (i * 2) as f32], 1, None).unwrap();
            assert_eq!(hits[0].id, i);
            assert!(hits[0].distance < 1e-4);
        }
    }

    #[test]
    fn test_euclidean_axis_ordering() {
        // Four points on the X axis; query at the origin must rank them by x.
        let mut index = index_2d(Metric::Euclidean);
        index.insert(1, &[0.5, 0.0]).unwrap();
        index.insert(2, &[1.0, 0.0]).unwrap();
        index.insert(3, &[2.0, 0.0]).unwrap();
        index.insert(4, &[3.0, 0.0]).unwrap();

        let hits = index.search(&[0.0, 0.0], 4, None).unwrap();
        let ids: Vec<u64> = hits.iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!((hits[0].distance - 0.5).abs() < 1e-6);
        assert!((hits[3].distance - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_colinear_and_antipodal() {
        let mut index = HnswIndex::with_seed(HnswConfig::new(3, Metric::Cosine), 7);
        index.insert(1, &[1.0, 1.0, 0.0]).unwrap();
        index.insert(2, &[2.0, 2.0, 0.0]).unwrap();

        let hits = index.search(&[1.0, 1.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        for hit in &hits {
            assert!(hit.distance.abs() < 1e-4);
        }

        let hits = index.search(&[-1.0, -1.0, 0.0], 2, None).unwrap();
        for hit in &hits {
            assert!((hit.distance - 2.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_delete_reelects_entry_point() {
        let mut index = index_2d(Metric::Euclidean);
        for i in 0..50u64 {
            index.insert(i, &[i as f32, 0.0]).unwrap();
        }
        let entry = index.entry_point.unwrap();
        assert!(index.delete(entry));
        assert!(!index.contains(entry));
        assert_eq!(index.len(), 49);

        // Entry point must exist and sit at the highest surviving level.
        let new_entry = index.entry_point.unwrap();
        assert_eq!(index.nodes[&new_entry].max_layer(), index.max_level);

        // No dangling edges remain.
        for node in index.nodes.values() {
            for layer in &node.neighbors {
                assert!(!layer.contains(&entry));
            }
        }

        let hits = index.search(&[10.0, 0.0], 5, None).unwrap();
        assert!(!hits.iter().any(|h| h.id == entry));
    }

    #[test]
    fn test_delete_missing_returns_false() {
        let mut index = index_2d(Metric::Euclidean);
        assert!(!index.delete(99));
    }

    #[test]
    fn test_delete_last_node_empties_index() {
        let mut index = index_2d(Metric::Euclidean);
        index.insert(1, &[1.0, 1.0]).unwrap();
        assert!(index.delete(1));
        assert!(index.is_empty());
        assert_eq!(index.entry_point, None);
        assert!(index.search(&[1.0, 1.0], 1, None).unwrap().is_empty());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut index = HnswIndex::with_seed(HnswConfig::new(4, Metric::Cosine), 42);
        for i in 0..100u64 {
            let v = [
                (i % 7) as f32,
                (i % 5) as f32 + 0.5,
                (i % 3) as f32,
                1.0,
            ];
            index.insert(i, &v).unwrap();
        }

        let blob = index.serialize();
        let restored = HnswIndex::deserialize(&blob, 200, 50).unwrap();

        assert_eq!(restored.len(), index.len());
        assert_eq!(restored.entry_point, index.entry_point);
        assert_eq!(restored.max_level, index.max_level);
        assert_eq!(restored.config.metric, Metric::Cosine);

        let query = [3.0, 2.5, 1.0, 1.0];
        let before = index.search(&query, 10, Some(100)).unwrap();
        let after = restored.search(&query, 10, Some(100)).unwrap();
        let ids_before: Vec<u64> = before.iter().map(|h| h.id).collect();
        let ids_after: Vec<u64> = after.iter().map(|h| h.id).collect();
        assert_eq!(ids_before, ids_after);
    }

    #[test]
    fn test_deserialize_truncated_blob() {
        let mut index = index_2d(Metric::Euclidean);
        index.insert(1, &[1.0, 2.0]).unwrap();
        let blob = index.serialize();
        let err = HnswIndex::deserialize(&blob[..blob.len() - 3], 200, 50).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)));
    }

    #[test]
    fn test_deserialize_empty_index() {
        let index = index_2d(Metric::Euclidean);
        let blob = index.serialize();
        let restored = HnswIndex::deserialize(&blob, 200, 50).unwrap();
        assert!(restored.is_empty());
        assert_eq!(restored.entry_point, None);
    }
}
