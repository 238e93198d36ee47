use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use crate::core::plan::{sanitize_folder_name, OrganizePlan};
use crate::core::record::ImageRecord;
use crate::core::similarity::cosine_similarity;
use crate::services::embedding::{EmbeddingError, EmbeddingProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: PathBuf,
    pub score: f32,
}

/// The `top_k` records closest to `query`, best first, ties by id.
pub fn rank_by_query(query: &[f32], records: &[ImageRecord], top_k: usize) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = records
        .iter()
        .filter(|r| r.embedding.len() == query.len())
        .map(|r| SearchHit {
            id: r.id.clone(),
            score: cosine_similarity(query, &r.embedding),
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top_k);
    hits
}

/// Embed `query` and rank `records` against it.
pub fn search(
    provider: &dyn EmbeddingProvider,
    query: &str,
    records: &[ImageRecord],
    top_k: usize,
) -> Result<Vec<SearchHit>, EmbeddingError> {
    let vector = provider.embed_text(query)?;
    let hits = rank_by_query(&vector, records, top_k);
    log::info!("Query {:?} matched {} image(s)", query, hits.len());
    Ok(hits)
}

/// Results go into one folder named after the query.
pub fn plan_search_results(output_root: &Path, query: &str, hits: &[SearchHit]) -> OrganizePlan {
    let mut plan = OrganizePlan::new(output_root);
    if hits.is_empty() {
        return plan;
    }
    let name = sanitize_folder_name(query);
    let name = if name.is_empty() { "search" } else { name.as_str() };
    plan.push_named(name, hits.iter().map(|h| h.id.clone()).collect());
    plan
}
