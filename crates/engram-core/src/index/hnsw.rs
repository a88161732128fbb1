//! HNSW wrapper over USearch
//!
//! Vectors enter as the stored int8 projection (bytes + scale/offset)
//! and are dequantized at this boundary; the index itself re-quantizes
//! internally with the same I8 scalar kind, so the persisted blob stays
//! aligned with the row store's quantization.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::vector::dequantize_int8;

use super::{IndexError, Result, Snapshot};

/// HNSW connectivity parameter (higher = better recall, more memory)
const CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
const EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search
const EXPANSION_SEARCH: usize = 64;

/// HNSW index over int8 engram embeddings.
pub struct VectorIndex {
    index: Index,
    dimensions: usize,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
    dirty: bool,
    last_saved_at: Option<DateTime<Utc>>,
}

impl VectorIndex {
    fn options(dimensions: usize) -> IndexOptions {
        IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::I8,
            connectivity: CONNECTIVITY,
            expansion_add: EXPANSION_ADD,
            expansion_search: EXPANSION_SEARCH,
            multi: false,
        }
    }

    /// Create an empty index.
    pub fn new(dimensions: usize) -> Result<Self> {
        let index = Index::new(&Self::options(dimensions))
            .map_err(|e| IndexError::Creation(e.to_string()))?;
        Ok(Self {
            index,
            dimensions,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
            dirty: false,
            last_saved_at: None,
        })
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether unsaved changes are pending.
    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Reserve capacity ahead of a batch of adds. USearch requires
    /// reserved capacity before add().
    pub fn reserve(&self, capacity: usize) -> Result<()> {
        self.index
            .reserve(capacity)
            .map_err(|e| IndexError::Creation(format!("reserve failed: {}", e)))
    }

    /// Add (or replace) an engram's vector.
    pub fn add(&mut self, key: &str, bytes: &[i8], scale: f32, offset: f32) -> Result<()> {
        if bytes.len() != self.dimensions {
            return Err(IndexError::InvalidDimensions(self.dimensions, bytes.len()));
        }
        let vector = dequantize_int8(bytes, scale, offset);

        if let Some(&existing) = self.key_to_id.get(key) {
            self.index
                .remove(existing)
                .map_err(|e| IndexError::Mutation(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(existing, &vector)
                .map_err(|e| IndexError::Mutation(e.to_string()))?;
            self.dirty = true;
            return Ok(());
        }

        if self.index.size() >= self.index.capacity() {
            let grown = std::cmp::max(self.index.capacity() * 2, 16);
            self.reserve(grown)?;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.index
            .add(id, &vector)
            .map_err(|e| IndexError::Mutation(e.to_string()))?;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        self.dirty = true;
        Ok(())
    }

    /// Remove an engram's vector. Returns whether it was present.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        match self.key_to_id.remove(key) {
            Some(id) => {
                self.id_to_key.remove(&id);
                self.index
                    .remove(id)
                    .map_err(|e| IndexError::Mutation(e.to_string()))?;
                self.dirty = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether an engram is indexed.
    pub fn contains(&self, key: &str) -> bool {
        self.key_to_id.contains_key(key)
    }

    /// Approximate nearest neighbors: `(engram_id, distance)` pairs,
    /// nearest first. Distances are advisory; callers recompute cosine
    /// on the stored int8 bytes.
    pub fn search(
        &self,
        bytes: &[i8],
        scale: f32,
        offset: f32,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        if bytes.len() != self.dimensions {
            return Err(IndexError::InvalidDimensions(self.dimensions, bytes.len()));
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        let vector = dequantize_int8(bytes, scale, offset);
        let results = self
            .index
            .search(&vector, limit)
            .map_err(|e| IndexError::Search(e.to_string()))?;

        let mut hits = Vec::with_capacity(results.keys.len());
        for (key, distance) in results.keys.iter().zip(results.distances.iter()) {
            if let Some(engram_id) = self.id_to_key.get(key) {
                hits.push((engram_id.clone(), *distance));
            }
        }
        Ok(hits)
    }

    /// Persist the index blob plus the key-mapping sidecar.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .ok_or_else(|| IndexError::Persistence("invalid path".to_string()))?;
        self.index
            .save(path_str)
            .map_err(|e| IndexError::Persistence(e.to_string()))?;

        let mappings_path = path.with_extension("mappings.json");
        let mappings = serde_json::json!({
            "key_to_id": self.key_to_id,
            "next_id": self.next_id,
        });
        let encoded = serde_json::to_string(&mappings)
            .map_err(|e| IndexError::Persistence(e.to_string()))?;
        std::fs::write(&mappings_path, encoded)
            .map_err(|e| IndexError::Persistence(e.to_string()))?;

        self.dirty = false;
        self.last_saved_at = Some(Utc::now());
        Ok(())
    }

    /// Load a previously saved index and its sidecar.
    pub fn load(path: &Path, dimensions: usize) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| IndexError::Persistence("invalid path".to_string()))?;

        let index = Index::new(&Self::options(dimensions))
            .map_err(|e| IndexError::Creation(e.to_string()))?;
        index
            .load(path_str)
            .map_err(|e| IndexError::Persistence(e.to_string()))?;

        let mappings_path = path.with_extension("mappings.json");
        let raw = std::fs::read_to_string(&mappings_path)
            .map_err(|e| IndexError::Persistence(e.to_string()))?;
        let mappings: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| IndexError::Persistence(e.to_string()))?;

        let key_to_id: HashMap<String, u64> = serde_json::from_value(mappings["key_to_id"].clone())
            .map_err(|e| IndexError::Persistence(e.to_string()))?;
        let next_id = mappings["next_id"]
            .as_u64()
            .ok_or_else(|| IndexError::Persistence("invalid next_id".to_string()))?;
        let id_to_key = key_to_id.iter().map(|(k, &v)| (v, k.clone())).collect();

        Ok(Self {
            index,
            dimensions,
            key_to_id,
            id_to_key,
            next_id,
            dirty: false,
            last_saved_at: None,
        })
    }

    /// State snapshot.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            size: self.len(),
            capacity: self.index.capacity(),
            dimensions: self.dimensions,
            dirty: self.dirty,
            last_saved_at: self.last_saved_at,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::quantize_int8;
    use tempfile::TempDir;

    const DIM: usize = 64;

    fn quantized(seed: u64) -> (Vec<i8>, f32, f32) {
        let v: Vec<f32> = (0..DIM)
            .map(|i| ((i as f32 + seed as f32 * 13.7) * 0.37).sin())
            .collect();
        quantize_int8(&v).unwrap()
    }

    #[test]
    fn test_add_and_search() {
        let mut index = VectorIndex::new(DIM).unwrap();
        for seed in 0..5u64 {
            let (bytes, scale, offset) = quantized(seed);
            index.add(&format!("engram-{}", seed), &bytes, scale, offset).unwrap();
        }
        assert_eq!(index.len(), 5);
        assert!(index.contains("engram-0"));
        assert!(index.dirty());

        let (bytes, scale, offset) = quantized(2);
        let hits = index.search(&bytes, scale, offset, 3).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0, "engram-2");
    }

    #[test]
    fn test_re_add_replaces() {
        let mut index = VectorIndex::new(DIM).unwrap();
        let (a, sa, oa) = quantized(1);
        let (b, sb, ob) = quantized(2);
        index.add("engram-x", &a, sa, oa).unwrap();
        index.add("engram-x", &b, sb, ob).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut index = VectorIndex::new(DIM).unwrap();
        let (bytes, scale, offset) = quantized(1);
        index.add("engram-1", &bytes, scale, offset).unwrap();
        assert!(index.remove("engram-1").unwrap());
        assert!(!index.contains("engram-1"));
        assert!(!index.remove("engram-1").unwrap());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = VectorIndex::new(DIM).unwrap();
        let short = vec![1i8; 8];
        assert!(matches!(
            index.add("bad", &short, 1.0, 0.0),
            Err(IndexError::InvalidDimensions(_, _))
        ));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.usearch");

        let mut index = VectorIndex::new(DIM).unwrap();
        for seed in 0..4u64 {
            let (bytes, scale, offset) = quantized(seed);
            index.add(&format!("engram-{}", seed), &bytes, scale, offset).unwrap();
        }
        index.save(&path).unwrap();
        assert!(!index.dirty());

        let loaded = VectorIndex::load(&path, DIM).unwrap();
        assert_eq!(loaded.len(), 4);
        assert!(loaded.contains("engram-3"));

        let (bytes, scale, offset) = quantized(1);
        let hits = loaded.search(&bytes, scale, offset, 2).unwrap();
        assert_eq!(hits[0].0, "engram-1");
    }
}
