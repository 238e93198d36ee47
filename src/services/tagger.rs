use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::core::plan::OrganizePlan;
use crate::core::record::ImageRecord;
use crate::core::similarity::normalize;
use crate::services::embedding::{EmbeddingError, EmbeddingProvider};

/// Temperature CLIP applies to cosine similarities before the softmax.
pub const CLIP_LOGIT_SCALE: f32 = 100.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagScore {
    pub tag: String,
    pub score: f32,
}

/// Tags assigned to one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecord {
    pub file: PathBuf,
    pub tags: Vec<TagScore>,
}

/// Zero-shot labeler over a fixed label set.
pub struct Tagger {
    labels: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

impl Tagger {
    /// Embed every label with `provider`. Blank and repeated labels are
    /// dropped.
    pub fn new(provider: &dyn EmbeddingProvider, labels: &[String]) -> Result<Self, EmbeddingError> {
        let mut embedded = Vec::new();
        for label in clean_labels(labels) {
            let vector = provider.embed_text(&label)?;
            embedded.push((label, vector));
        }
        Self::from_vectors(embedded)
    }

    pub fn from_vectors(labels: Vec<(String, Vec<f32>)>) -> Result<Self, EmbeddingError> {
        let expected = labels.first().map(|(_, v)| v.len()).unwrap_or(0);
        for (label, vector) in &labels {
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    key: label.clone(),
                    expected,
                    found: vector.len(),
                });
            }
        }

        let (labels, vectors) = labels
            .into_iter()
            .map(|(label, vector)| (label, normalize(&vector)))
            .unzip();
        Ok(Self { labels, vectors })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Softmax probability of every label, most likely first.
    pub fn probabilities(&self, embedding: &[f32]) -> Result<Vec<TagScore>, EmbeddingError> {
        if let Some(expected) = self.vectors.first().map(Vec::len) {
            if embedding.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    key: "image".to_string(),
                    expected,
                    found: embedding.len(),
                });
            }
        }

        let image = normalize(embedding);
        let logits: Vec<f32> = self
            .vectors
            .iter()
            .map(|label| CLIP_LOGIT_SCALE * dot(&image, label))
            .collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();

        let mut scores: Vec<TagScore> = self
            .labels
            .iter()
            .zip(exps)
            .map(|(tag, e)| TagScore {
                tag: tag.clone(),
                score: e / total,
            })
            .collect();
        scores.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.tag.cmp(&b.tag))
        });
        Ok(scores)
    }

    /// Labels whose probability reaches `threshold`, at most `top_k`.
    pub fn tag(
        &self,
        embedding: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<TagScore>, EmbeddingError> {
        let mut scores = self.probabilities(embedding)?;
        scores.retain(|s| s.score >= threshold);
        scores.truncate(top_k);
        Ok(scores)
    }

    pub fn top_label(&self, embedding: &[f32]) -> Option<String> {
        match self.probabilities(embedding) {
            Ok(scores) => scores.into_iter().next().map(|s| s.tag),
            Err(e) => {
                log::warn!("Could not label image: {}", e);
                None
            }
        }
    }

    /// Tag every record; images with no label above `threshold` get an empty
    /// tag list.
    pub fn tag_records(
        &self,
        records: &[ImageRecord],
        threshold: f32,
        top_k: usize,
    ) -> Vec<TagRecord> {
        records
            .iter()
            .filter_map(|record| match self.tag(&record.embedding, threshold, top_k) {
                Ok(tags) => Some(TagRecord {
                    file: record.id.clone(),
                    tags,
                }),
                Err(e) => {
                    log::warn!("Could not tag {}: {}", record.id.display(), e);
                    None
                }
            })
            .collect()
    }
}

/// The tagger used for folder names, or `None` when labels cannot be
/// embedded. Groups then fall back to numbered folders.
pub fn label_source(provider: &dyn EmbeddingProvider, labels: &[String]) -> Option<Tagger> {
    if !provider.supports_text() {
        log::info!(
            "The {} provider has no text embeddings; using numbered group folders",
            provider.name()
        );
        return None;
    }

    match Tagger::new(provider, labels) {
        Ok(tagger) if !tagger.is_empty() => Some(tagger),
        Ok(_) => {
            log::info!("No labels given; using numbered group folders");
            None
        }
        Err(e) => {
            log::warn!("Could not embed labels: {}; using numbered group folders", e);
            None
        }
    }
}

/// One folder per tag holding every image carrying it. An image with several
/// tags appears in several folders.
pub fn plan_by_tag(output_root: &Path, tagged: &[TagRecord]) -> OrganizePlan {
    let mut by_tag: BTreeMap<&str, Vec<PathBuf>> = BTreeMap::new();
    for record in tagged {
        for tag in &record.tags {
            by_tag
                .entry(tag.tag.as_str())
                .or_default()
                .push(record.file.clone());
        }
    }

    let mut plan = OrganizePlan::new(output_root);
    for (tag, files) in by_tag {
        plan.push_named(tag, files);
    }
    plan
}

fn clean_labels(labels: &[String]) -> Vec<String> {
    let mut seen = Vec::new();
    for label in labels {
        let label = label.trim();
        if !label.is_empty() && !seen.iter().any(|l: &String| l == label) {
            seen.push(label.to_string());
        }
    }
    seen
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
