use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::core::cluster::DuplicateGroup;
use crate::core::scoring::ScoringPolicy;

/// Score of one group member under the active policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub id: PathBuf,
    /// `None` when the image could not be decoded.
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The chosen representative of a group and the full ranking behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub best: PathBuf,
    pub policy: String,
    /// Best first.
    pub ranking: Vec<ScoredCandidate>,
}

pub struct BestImageSelector<'a> {
    policy: &'a dyn ScoringPolicy,
}

impl<'a> BestImageSelector<'a> {
    pub fn new(policy: &'a dyn ScoringPolicy) -> Self {
        Self { policy }
    }

    /// Pick the highest-scoring member of `group`.
    ///
    /// Ties go to the lexicographically smallest id. Members that fail to
    /// decode rank below every scored member.
    pub fn select(&self, group: &DuplicateGroup) -> Option<Selection> {
        let mut ranking: Vec<ScoredCandidate> = group
            .members
            .par_iter()
            .map(|id| match self.policy.score_path(id) {
                Ok(score) => ScoredCandidate {
                    id: id.clone(),
                    score: Some(score),
                    error: None,
                },
                Err(e) => {
                    log::warn!("Could not score {}: {}", id.display(), e);
                    ScoredCandidate {
                        id: id.clone(),
                        score: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();

        rank(&mut ranking);
        let best = ranking.first()?.id.clone();
        log::debug!("Best of {} member(s): {}", ranking.len(), best.display());

        Some(Selection {
            best,
            policy: self.policy.name().to_string(),
            ranking,
        })
    }

    pub fn select_all(&self, groups: &[DuplicateGroup]) -> Vec<Option<Selection>> {
        groups.iter().map(|group| self.select(group)).collect()
    }
}

fn rank(candidates: &mut [ScoredCandidate]) {
    candidates.sort_by(|a, b| {
        let by_score = match (a.score, b.score) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        by_score.then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scoring::tests::{checkerboard, gradient, BrightCornerDetector};
    use crate::core::scoring::{AdvancedPolicy, AdvancedWeights, LaplacianPolicy};
    use image::DynamicImage;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn save(dir: &TempDir, name: &str, image: &DynamicImage) -> PathBuf {
        let path = dir.path().join(name);
        image.save(&path).unwrap();
        path
    }

    fn group(members: &[&PathBuf]) -> DuplicateGroup {
        let mut members: Vec<PathBuf> = members.iter().map(|p| (*p).clone()).collect();
        members.sort();
        DuplicateGroup { members }
    }

    #[test]
    fn test_advanced_prefers_sharp_large_face_shot() {
        let temp_dir = TempDir::new().unwrap();
        // A: sharp, 64x64, bright corner (face); B: blurry; C: small, no face.
        let a = save(&temp_dir, "a.png", &checkerboard(64, 1));
        let b = save(&temp_dir, "b.png", &gradient(64));
        let c = save(&temp_dir, "c.png", &checkerboard(16, 8).brighten(-255));
        let group = group(&[&c, &b, &a]);

        let policy = AdvancedPolicy::new(
            AdvancedWeights::default(),
            Some(Arc::new(BrightCornerDetector)),
        );
        let selection = BestImageSelector::new(&policy).select(&group).unwrap();
        assert_eq!(selection.best, a);
        assert_eq!(selection.policy, "advanced");
        assert_eq!(selection.ranking.len(), 3);
    }

    #[test]
    fn test_laplacian_ignores_resolution() {
        let temp_dir = TempDir::new().unwrap();
        let small_sharp = save(&temp_dir, "small.png", &checkerboard(16, 1));
        let large_blurry = save(&temp_dir, "large.png", &gradient(128));
        let group = group(&[&small_sharp, &large_blurry]);

        let laplacian = BestImageSelector::new(&LaplacianPolicy)
            .select(&group)
            .unwrap();
        assert_eq!(laplacian.best, small_sharp);

        let resolution_only = AdvancedPolicy::new(
            AdvancedWeights {
                sharpness: 0.0,
                resolution: 1.0,
                face: 0.0,
            },
            None,
        );
        let advanced = BestImageSelector::new(&resolution_only)
            .select(&group)
            .unwrap();
        assert_eq!(advanced.best, large_blurry);
    }

    #[test]
    fn test_ties_break_by_id() {
        let temp_dir = TempDir::new().unwrap();
        let image = checkerboard(16, 2);
        let z = save(&temp_dir, "z.png", &image);
        let m = save(&temp_dir, "m.png", &image);
        let a = save(&temp_dir, "a.png", &image);

        let selector = BestImageSelector::new(&LaplacianPolicy);
        for _ in 0..3 {
            let selection = selector.select(&group(&[&z, &m, &a])).unwrap();
            assert_eq!(selection.best, a);
        }
    }

    #[test]
    fn test_undecodable_member_ranks_last() {
        let temp_dir = TempDir::new().unwrap();
        let broken = temp_dir.path().join("0-broken.png");
        fs::write(&broken, b"not an image").unwrap();
        let good = save(&temp_dir, "1-good.png", &gradient(16));

        let selection = BestImageSelector::new(&LaplacianPolicy)
            .select(&group(&[&broken, &good]))
            .unwrap();
        assert_eq!(selection.best, good);
        assert!(selection.ranking[1].score.is_none());
        assert!(selection.ranking[1].error.is_some());
    }
}
