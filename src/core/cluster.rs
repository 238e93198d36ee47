// Duplicate clustering over an embedding similarity graph.
//
// Two images are joined by an edge when their similarity reaches the
// threshold; every connected component with at least two members becomes a
// duplicate group. Transitive near-duplicates (A~B, B~C, A!~C) therefore end
// up in one group.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use thiserror::Error;

use crate::core::record::ImageRecord;
use crate::core::similarity::SimilarityIndex;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("No images to cluster")]
    EmptyInput,

    #[error("Similarity threshold must be in (0, 1], got {threshold}")]
    InvalidThreshold { threshold: f32 },

    #[error("Embedding dimension mismatch for {id:?}: expected {expected}, found {found}")]
    DimensionMismatch {
        id: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("Empty embedding for {id:?}")]
    EmptyEmbedding { id: PathBuf },

    #[error("Embedding for {id:?} contains non-finite values")]
    NonFiniteEmbedding { id: PathBuf },

    #[error("Image {id:?} appears more than once")]
    DuplicateId { id: PathBuf },
}

/// A set of near-duplicate images. Members are sorted and there are always at
/// least two of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub members: Vec<PathBuf>,
}

impl DuplicateGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &std::path::Path) -> bool {
        self.members.binary_search_by(|m| m.as_path().cmp(id)).is_ok()
    }
}

/// Result of one clustering pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clustering {
    pub groups: Vec<DuplicateGroup>,
    /// Images with no neighbor at or above the threshold.
    pub singletons: Vec<PathBuf>,
}

pub struct DuplicateClusterer {
    threshold: f32,
}

impl DuplicateClusterer {
    pub fn new(threshold: f32) -> Result<Self, ClusterError> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ClusterError::InvalidThreshold { threshold });
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Validate the records, build the similarity index and cluster it.
    pub fn cluster(&self, records: &[ImageRecord]) -> Result<Clustering, ClusterError> {
        let index = SimilarityIndex::new(records)?;
        Ok(self.cluster_index(&index))
    }

    /// Connected components of the thresholded similarity graph.
    ///
    /// Traversal starts from ids in sorted order and neighbors are visited in
    /// sorted order, so identical input always gives identical groups. Groups
    /// come out ordered by their smallest member.
    pub fn cluster_index(&self, index: &SimilarityIndex) -> Clustering {
        let adjacency = index.adjacency(self.threshold);
        let mut visited = vec![false; index.len()];
        let mut clustering = Clustering::default();

        for start in 0..index.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;

            let mut component = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                for &next in &adjacency[node] {
                    if !visited[next] {
                        visited[next] = true;
                        component.push(next);
                        queue.push_back(next);
                    }
                }
            }

            if component.len() < 2 {
                clustering.singletons.push(index.ids()[start].clone());
                continue;
            }

            component.sort_unstable();
            clustering.groups.push(DuplicateGroup {
                members: component
                    .into_iter()
                    .map(|i| index.ids()[i].clone())
                    .collect(),
            });
        }

        log::info!(
            "Clustered {} images at threshold {}: {} group(s), {} singleton(s)",
            index.len(),
            self.threshold,
            clustering.groups.len(),
            clustering.singletons.len()
        );
        clustering
    }
}

/// Cluster `records` at `threshold` in one call.
pub fn find_duplicate_groups(
    records: &[ImageRecord],
    threshold: f32,
) -> Result<Clustering, ClusterError> {
    DuplicateClusterer::new(threshold)?.cluster(records)
}
