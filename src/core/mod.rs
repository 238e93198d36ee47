pub mod cluster;
pub mod faces;
pub mod history;
pub mod organize;
pub mod plan;
pub mod record;
pub mod scoring;
pub mod select;
pub mod similarity;

pub use cluster::{find_duplicate_groups, ClusterError, Clustering, DuplicateClusterer, DuplicateGroup};
pub use faces::{load_face_detector, CascadeFaceDetector, FaceDetector, HaarCascade};
pub use history::{MoveHistory, RestoreSelection};
pub use organize::{FileOperation, OrganizeReport, OutputOrganizer};
pub use plan::OrganizePlan;
pub use record::{ImageRecord, SimilarityPair};
pub use scoring::{AdvancedPolicy, AdvancedWeights, LaplacianPolicy, ScoringMethod, ScoringPolicy};
pub use select::{BestImageSelector, ScoredCandidate, Selection};
pub use similarity::{cosine_similarity, SimilarityIndex};
