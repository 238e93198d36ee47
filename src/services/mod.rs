pub mod duplicates;
pub mod embedding;
pub mod metadata;
pub mod scanner;
pub mod search;
pub mod tagger;

pub use duplicates::{plan_duplicates, DuplicateOptions, DuplicateRun};
pub use embedding::{extract_embeddings, EmbeddingCache, EmbeddingProvider, ProviderKind};
pub use scanner::ImageScanner;
pub use tagger::{label_source, TagRecord, TagScore, Tagger};
