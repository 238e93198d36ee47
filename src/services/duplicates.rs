// The duplicates pipeline from embeddings to an organize plan:
// cluster, optionally pick a best image per group, name the folders.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::cluster::{ClusterError, Clustering, DuplicateClusterer};
use crate::core::plan::OrganizePlan;
use crate::core::record::ImageRecord;
use crate::core::scoring::ScoringPolicy;
use crate::core::select::{BestImageSelector, Selection};
use crate::services::tagger::Tagger;

/// Folder for images that belong to no group.
pub const UNIQUE_FOLDER: &str = "unique";

pub struct DuplicateOptions<'a> {
    pub threshold: f32,
    /// Set to pick a best image per group.
    pub policy: Option<&'a dyn ScoringPolicy>,
    /// Set to name group folders after the representative's top label.
    pub labeler: Option<&'a Tagger>,
    pub include_unique: bool,
}

impl<'a> DuplicateOptions<'a> {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            policy: None,
            labeler: None,
            include_unique: false,
        }
    }
}

pub struct DuplicateRun {
    pub clustering: Clustering,
    /// Parallel to `clustering.groups`; empty when no policy was given.
    pub selections: Vec<Option<Selection>>,
    pub plan: OrganizePlan,
}

impl DuplicateRun {
    pub fn duplicate_count(&self) -> usize {
        self.clustering.groups.iter().map(|g| g.len()).sum()
    }
}

/// Cluster `records` and lay the result out under `output_root`.
///
/// Validation errors come back before anything is planned.
pub fn plan_duplicates(
    records: &[ImageRecord],
    output_root: &Path,
    options: &DuplicateOptions<'_>,
) -> Result<DuplicateRun, ClusterError> {
    let clusterer = DuplicateClusterer::new(options.threshold)?;
    let clustering = clusterer.cluster(records)?;

    let selections = match options.policy {
        Some(policy) => {
            log::info!(
                "Selecting best images in {} group(s) with the {} policy",
                clustering.groups.len(),
                policy.name()
            );
            BestImageSelector::new(policy).select_all(&clustering.groups)
        }
        None => Vec::new(),
    };

    let embeddings: HashMap<&Path, &[f32]> = records
        .iter()
        .map(|r| (r.id.as_path(), r.embedding.as_slice()))
        .collect();

    let mut plan = OrganizePlan::new(output_root);
    for (i, group) in clustering.groups.iter().enumerate() {
        let best: Option<PathBuf> = selections
            .get(i)
            .and_then(|s| s.as_ref())
            .map(|s| s.best.clone());

        let representative = best.as_deref().or(group.members.first().map(PathBuf::as_path));
        let label = match (options.labeler, representative) {
            (Some(tagger), Some(rep)) => embeddings.get(rep).and_then(|e| tagger.top_label(e)),
            _ => None,
        };

        plan.push_group(label.as_deref(), best, group.members.clone());
    }

    if options.include_unique && !clustering.singletons.is_empty() {
        plan.push_named(UNIQUE_FOLDER, clustering.singletons.clone());
    }

    Ok(DuplicateRun {
        clustering,
        selections,
        plan,
    })
}
