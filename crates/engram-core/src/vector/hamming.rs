//! Binary Projection and Hamming Distance
//!
//! The 1-bit projection used by the binary prefilter strategy. The
//! encoding is persisted, so it must match bit-for-bit across versions:
//! bit `i` is 1 iff the int8 byte at `i` is strictly positive, packed
//! big-endian (bit 7 of byte 0 is dimension 0).

use super::{Result, VectorError};

/// Derive the packed binary projection from an int8 vector.
///
/// Bit `i` = 1 iff `v[i] > 0`. The strict threshold is part of the
/// on-disk contract for persisted binary embeddings.
pub fn to_binary(v: &[i8]) -> Result<Vec<u8>> {
    if v.is_empty() {
        return Err(VectorError::Empty);
    }

    let mut bits = vec![0u8; v.len().div_ceil(8)];
    for (i, &b) in v.iter().enumerate() {
        if b > 0 {
            bits[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    Ok(bits)
}

/// Hamming distance between two packed bit vectors.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> Result<u32> {
    if a.is_empty() || b.is_empty() {
        return Err(VectorError::Empty);
    }
    if a.len() != b.len() {
        return Err(VectorError::DimMismatch(a.len() * 8, b.len() * 8));
    }

    Ok(a.iter().zip(b.iter()).map(|(&x, &y)| (x ^ y).count_ones()).sum())
}

/// Top-k nearest corpus entries by Hamming distance.
///
/// Ascending by distance; ties resolve by corpus order (stable sort).
pub fn top_k_hamming(query: &[u8], corpus: &[Vec<u8>], k: usize) -> Result<Vec<(usize, u32)>> {
    if query.is_empty() {
        return Err(VectorError::Empty);
    }

    let mut scored = Vec::with_capacity(corpus.len());
    for (i, bits) in corpus.iter().enumerate() {
        scored.push((i, hamming_distance(query, bits)?));
    }
    scored.sort_by_key(|&(_, d)| d);
    scored.truncate(k);
    Ok(scored)
}

// ============================================================================
// STREAMING TOP-K
// ============================================================================

/// Bounded accumulator for streaming Hamming scans.
///
/// The binary-rescore strategy streams the corpus in chunks and keeps a
/// global top-k without materializing every row. Ties keep earlier
/// entries, matching the stable ordering of [`top_k_hamming`].
pub struct HammingTopK<T> {
    k: usize,
    // Max-heap on (distance, seq) so the worst kept entry is on top.
    heap: std::collections::BinaryHeap<HeapEntry<T>>,
    seq: u64,
}

struct HeapEntry<T> {
    distance: u32,
    seq: u64,
    payload: T,
}

impl<T> PartialEq for HeapEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.seq == other.seq
    }
}

impl<T> Eq for HeapEntry<T> {}

impl<T> PartialOrd for HeapEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for HeapEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance
            .cmp(&other.distance)
            .then(self.seq.cmp(&other.seq))
    }
}

impl<T> HammingTopK<T> {
    /// Create an accumulator keeping the `k` smallest distances.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: std::collections::BinaryHeap::with_capacity(k + 1),
            seq: 0,
        }
    }

    /// Offer one candidate.
    pub fn push(&mut self, distance: u32, payload: T) {
        if self.k == 0 {
            return;
        }
        let entry = HeapEntry {
            distance,
            seq: self.seq,
            payload,
        };
        self.seq += 1;

        if self.heap.len() < self.k {
            self.heap.push(entry);
        } else if let Some(worst) = self.heap.peek() {
            if entry.distance < worst.distance
                || (entry.distance == worst.distance && entry.seq < worst.seq)
            {
                self.heap.pop();
                self.heap.push(entry);
            }
        }
    }

    /// Number of kept candidates so far.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing has been kept.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain into (distance, payload) pairs, ascending by distance.
    pub fn into_sorted(self) -> Vec<(u32, T)> {
        let mut entries: Vec<HeapEntry<T>> = self.heap.into_vec();
        entries.sort_by(|a, b| a.distance.cmp(&b.distance).then(a.seq.cmp(&b.seq)));
        entries.into_iter().map(|e| (e.distance, e.payload)).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
