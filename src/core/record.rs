use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::cluster::ClusterError;

/// An image together with its embedding vector.
///
/// Records are created once by an embedding provider and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: PathBuf,
    pub embedding: Vec<f32>,
}

impl ImageRecord {
    pub fn new(id: impl Into<PathBuf>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            embedding,
        }
    }

    pub fn id(&self) -> &Path {
        &self.id
    }

    pub fn dimension(&self) -> usize {
        self.embedding.len()
    }
}

/// Similarity between two images, always stored with `a < b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityPair {
    pub a: PathBuf,
    pub b: PathBuf,
    pub score: f32,
}

/// Check that a record set can be clustered: non-empty, one shared dimension,
/// finite values and unique ids.
///
/// Returns the shared dimension.
pub fn validate_records(records: &[ImageRecord]) -> Result<usize, ClusterError> {
    let first = records.first().ok_or(ClusterError::EmptyInput)?;
    let expected = first.dimension();
    if expected == 0 {
        return Err(ClusterError::EmptyEmbedding {
            id: first.id.clone(),
        });
    }

    let mut seen = std::collections::HashSet::with_capacity(records.len());
    for record in records {
        if record.dimension() != expected {
            return Err(ClusterError::DimensionMismatch {
                id: record.id.clone(),
                expected,
                found: record.dimension(),
            });
        }
        if record.embedding.iter().any(|v| !v.is_finite()) {
            return Err(ClusterError::NonFiniteEmbedding {
                id: record.id.clone(),
            });
        }
        if !seen.insert(record.id.as_path()) {
            return Err(ClusterError::DuplicateId {
                id: record.id.clone(),
            });
        }
    }

    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_uniform_dimensions() {
        let records = vec![
            ImageRecord::new("a.jpg", vec![1.0, 0.0]),
            ImageRecord::new("b.jpg", vec![0.0, 1.0]),
        ];
        assert_eq!(validate_records(&records).unwrap(), 2);
    }

    #[test]
    fn test_validate_rejects_empty_set() {
        assert!(matches!(
            validate_records(&[]),
            Err(ClusterError::EmptyInput)
        ));
    }

    #[test]
    fn test_validate_rejects_dimension_mismatch() {
        let records = vec![
            ImageRecord::new("a.jpg", vec![1.0, 0.0]),
            ImageRecord::new("b.jpg", vec![0.0, 1.0, 0.5]),
        ];
        match validate_records(&records) {
            Err(ClusterError::DimensionMismatch {
                id,
                expected,
                found,
            }) => {
                assert_eq!(id, PathBuf::from("b.jpg"));
                assert_eq!(expected, 2);
                assert_eq!(found, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_nan_and_duplicate_ids() {
        let nan = vec![ImageRecord::new("a.jpg", vec![f32::NAN, 0.0])];
        assert!(matches!(
            validate_records(&nan),
            Err(ClusterError::NonFiniteEmbedding { .. })
        ));

        let dup = vec![
            ImageRecord::new("a.jpg", vec![1.0]),
            ImageRecord::new("a.jpg", vec![1.0]),
        ];
        assert!(matches!(
            validate_records(&dup),
            Err(ClusterError::DuplicateId { .. })
        ));
    }
}
