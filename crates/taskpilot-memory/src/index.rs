//! In-memory vector index with brute-force cosine similarity search.
//!
//! Every entry carries its owner. Searches only ever see the caller's own
//! entries, so recall cannot leak one user's history into another's task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use uuid::Uuid;

use taskpilot_core::error::TaskPilotError;

/// A single hit returned from a vector search.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: Uuid,
    /// Cosine similarity score.
    pub score: f64,
    pub content: String,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
struct VectorEntry {
    owner: Uuid,
    embedding: Vec<f32>,
    content: String,
    metadata: Value,
}

/// Thread-safe via interior RwLock. Cheap to clone; clones share entries.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    entries: Arc<RwLock<HashMap<Uuid, VectorEntry>>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert an entry. Overwrites any existing entry with the same ID.
    pub fn insert(
        &self,
        id: Uuid,
        owner: Uuid,
        embedding: Vec<f32>,
        content: String,
        metadata: Value,
    ) -> Result<(), TaskPilotError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| TaskPilotError::Memory(format!("Lock poisoned: {}", e)))?;
        entries.insert(
            id,
            VectorEntry {
                owner,
                embedding,
                content,
                metadata,
            },
        );
        Ok(())
    }

    /// Top `k` entries of `owner` scoring at least `min_score`, best first.
    pub fn search(
        &self,
        owner: Uuid,
        query: &[f32],
        k: usize,
        min_score: f64,
    ) -> Result<Vec<SearchHit>, TaskPilotError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| TaskPilotError::Memory(format!("Lock poisoned: {}", e)))?;

        let mut scored: Vec<SearchHit> = entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .filter_map(|(id, entry)| {
                let score = cosine_similarity(query, &entry.embedding);
                (score >= min_score).then(|| SearchHit {
                    id: *id,
                    score,
                    content: entry.content.clone(),
                    metadata: entry.metadata.clone(),
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        Ok(scored)
    }

    /// Drop every entry belonging to `owner`. Returns how many were removed.
    pub fn remove_owner(&self, owner: Uuid) -> Result<usize, TaskPilotError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| TaskPilotError::Memory(format!("Lock poisoned: {}", e)))?;
        let before = entries.len();
        entries.retain(|_, entry| entry.owner != owner);
        Ok(before - entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Cosine similarity of two vectors. 0.0 on length mismatch or zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum();

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(dim: usize, at: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[at] = 1.0;
        v
    }

    #[test]
    fn test_search_filters_by_owner() {
        let index = VectorIndex::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        index
            .insert(Uuid::new_v4(), alice, vec![1.0; 8], "alice note".into(), json!({}))
            .unwrap();
        index
            .insert(Uuid::new_v4(), bob, vec![1.0; 8], "bob note".into(), json!({}))
            .unwrap();

        let hits = index.search(alice, &[1.0; 8], 10, 0.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "alice note");
    }

    #[test]
    fn test_search_ordering_and_min_score() {
        let index = VectorIndex::new();
        let owner = Uuid::new_v4();
        let close = Uuid::new_v4();
        let far = Uuid::new_v4();

        index
            .insert(close, owner, vec![1.0, 0.1], "close".into(), json!({}))
            .unwrap();
        index
            .insert(far, owner, vec![0.0, 1.0], "far".into(), json!({}))
            .unwrap();

        let hits = index.search(owner, &[1.0, 0.0], 10, 0.0).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, close);
        assert!(hits[0].score > hits[1].score);

        let strict = index.search(owner, &[1.0, 0.0], 10, 0.5).unwrap();
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].id, close);
    }

    #[test]
    fn test_search_respects_k_limit() {
        let index = VectorIndex::new();
        let owner = Uuid::new_v4();
        for _ in 0..10 {
            index
                .insert(Uuid::new_v4(), owner, vec![1.0; 4], String::new(), json!({}))
                .unwrap();
        }
        assert_eq!(index.search(owner, &[1.0; 4], 3, 0.0).unwrap().len(), 3);
    }

    #[test]
    fn test_insert_overwrites_and_remove_owner() {
        let index = VectorIndex::new();
        let owner = Uuid::new_v4();
        let id = Uuid::new_v4();
        index.insert(id, owner, unit(4, 0), "v1".into(), json!({})).unwrap();
        index.insert(id, owner, unit(4, 1), "v2".into(), json!({})).unwrap();
        assert_eq!(index.len(), 1);

        index
            .insert(Uuid::new_v4(), Uuid::new_v4(), unit(4, 2), "other".into(), json!({}))
            .unwrap();
        assert_eq!(index.remove_owner(owner).unwrap(), 1);
        assert_eq!(index.len(), 1);
        assert!(!index.is_empty());
    }

    #[test]
    fn test_cosine_similarity_edges() {
        assert!((cosine_similarity(&[1.0; 10], &[1.0; 10]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&unit(10, 0), &unit(10, 1)).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0; 10], &[1.0; 10]), 0.0);
        assert_eq!(cosine_similarity(&[1.0; 10], &[1.0; 20]), 0.0);
    }
}
