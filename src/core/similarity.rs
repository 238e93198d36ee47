use rayon::prelude::*;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use crate::core::cluster::ClusterError;
use crate::core::record::{validate_records, ImageRecord, SimilarityPair};

/// Tolerance applied when comparing a similarity against a threshold.
pub const SIMILARITY_EPSILON: f32 = 1e-6;

/// Cosine similarity of two vectors, clamped into `[0, 1]`.
///
/// A zero vector is similar to nothing.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += *x as f64 * *y as f64;
        norm_a += *x as f64 * *x as f64;
        norm_b += *y as f64 * *y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(0.0, 1.0) as f32
}

pub(crate) fn meets_threshold(score: f32, threshold: f32) -> bool {
    score + SIMILARITY_EPSILON >= threshold
}

/// Exact all-pairs similarity over a fixed record set.
///
/// Vectors are L2-normalized once on construction, so a similarity is a plain
/// dot product. Ids are kept sorted; every index-based method refers to that
/// sorted order.
pub struct SimilarityIndex {
    ids: Vec<PathBuf>,
    vectors: Vec<Vec<f32>>,
}

impl SimilarityIndex {
    pub fn new(records: &[ImageRecord]) -> Result<Self, ClusterError> {
        validate_records(records)?;

        let mut sorted: Vec<&ImageRecord> = records.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));

        let ids = sorted.iter().map(|r| r.id.clone()).collect();
        let vectors = sorted.iter().map(|r| normalize(&r.embedding)).collect();
        Ok(Self { ids, vectors })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[PathBuf] {
        &self.ids
    }

    pub fn position(&self, id: &Path) -> Option<usize> {
        self.ids.binary_search_by(|candidate| candidate.as_path().cmp(id)).ok()
    }

    /// Similarity between the records at sorted positions `i` and `j`.
    pub fn similarity_at(&self, i: usize, j: usize) -> f32 {
        if i == j {
            return 1.0;
        }
        let dot: f32 = self.vectors[i]
            .iter()
            .zip(&self.vectors[j])
            .map(|(x, y)| x * y)
            .sum();
        dot.clamp(0.0, 1.0)
    }

    pub fn similarity(&self, a: &Path, b: &Path) -> Option<f32> {
        Some(self.similarity_at(self.position(a)?, self.position(b)?))
    }

    /// Every other record whose similarity to `id` reaches `threshold`,
    /// best match first. Unknown ids have no neighbors.
    pub fn neighbors(&self, id: &Path, threshold: f32) -> Vec<(PathBuf, f32)> {
        let Some(i) = self.position(id) else {
            return Vec::new();
        };

        let mut found: Vec<(PathBuf, f32)> = (0..self.len())
            .filter(|&j| j != i)
            .map(|j| (j, self.similarity_at(i, j)))
            .filter(|(_, score)| meets_threshold(*score, threshold))
            .map(|(j, score)| (self.ids[j].clone(), score))
            .collect();

        found.sort_by(|(id_a, a), (id_b, b)| {
            b.partial_cmp(a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| id_a.cmp(id_b))
        });
        found
    }

    /// Adjacency lists (sorted positions) of the graph whose edges are the
    /// pairs reaching `threshold`. Rows are computed in parallel.
    pub fn adjacency(&self, threshold: f32) -> Vec<Vec<usize>> {
        (0..self.len())
            .into_par_iter()
            .map(|i| {
                (0..self.len())
                    .filter(|&j| j != i && meets_threshold(self.similarity_at(i, j), threshold))
                    .collect()
            })
            .collect()
    }

    /// All unordered pairs reaching `threshold`, ordered by `(a, b)`.
    pub fn pairs_above(&self, threshold: f32) -> Vec<SimilarityPair> {
        let mut pairs = Vec::new();
        for i in 0..self.len() {
            for j in (i + 1)..self.len() {
                let score = self.similarity_at(i, j);
                if meets_threshold(score, threshold) {
                    pairs.push(SimilarityPair {
                        a: self.ids[i].clone(),
                        b: self.ids[j].clone(),
                        score,
                    });
                }
            }
        }
        pairs
    }
}

pub(crate) fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vec![0.0; vector.len()];
    }
    vector.iter().map(|v| v / norm).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, v: &[f32]) -> ImageRecord {
        ImageRecord::new(id, v.to_vec())
    }

    #[test]
    fn test_cosine_bounds() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_similarity_is_symmetric() {
        let index = SimilarityIndex::new(&[
            record("a", &[1.0, 0.2, 0.0]),
            record("b", &[0.3, 1.0, 0.1]),
        ])
        .unwrap();
        let ab = index.similarity(Path::new("a"), Path::new("b")).unwrap();
        let ba = index.similarity(Path::new("b"), Path::new("a")).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_neighbors_sorted_and_filtered() {
        let index = SimilarityIndex::new(&[
            record("q", &[1.0, 0.0]),
            record("close", &[0.99, 0.1]),
            record("closer", &[1.0, 0.01]),
            record("far", &[0.0, 1.0]),
        ])
        .unwrap();

        let found = index.neighbors(Path::new("q"), 0.9);
        let ids: Vec<_> = found.iter().map(|(id, _)| id.to_str().unwrap()).collect();
        assert_eq!(ids, vec!["closer", "close"]);
        assert!(found[0].1 >= found[1].1);
        assert!(index.neighbors(Path::new("missing"), 0.1).is_empty());
    }

    #[test]
    fn test_identical_vectors_reach_threshold_one() {
        let index = SimilarityIndex::new(&[
            record("a", &[0.3, 0.7, 0.1]),
            record("b", &[0.3, 0.7, 0.1]),
        ])
        .unwrap();
        assert_eq!(index.pairs_above(1.0).len(), 1);
    }

    #[test]
    fn test_adjacency_matches_pairs() {
        let index = SimilarityIndex::new(&[
            record("a", &[1.0, 0.0]),
            record("b", &[1.0, 0.05]),
            record("c", &[0.0, 1.0]),
        ])
        .unwrap();
        let adjacency = index.adjacency(0.9);
        assert_eq!(adjacency[0], vec![1]);
        assert_eq!(adjacency[1], vec![0]);
        assert!(adjacency[2].is_empty());
        assert_eq!(index.pairs_above(0.9).len(), 1);
    }
}
