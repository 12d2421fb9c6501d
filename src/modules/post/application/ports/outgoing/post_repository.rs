use async_trait::async_trait;

use crate::modules::feature::extractor::FEATURE_DIM;
use crate::modules::post::adapter::outgoing::sea_orm_entity::post::{
    self, PostErrorStatus, PostType,
};
use crate::modules::post::domain::entities::Flag;
use crate::modules::pr0gramm::dto::UpstreamPost;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error")]
    Database(#[from] sea_orm::DbErr),

    #[error("database error")]
    Sqlx(#[from] sqlx::Error),
}

/// A post seen on the upstream feed, ready to be inserted together with the
/// outcome of its media download.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub post: UpstreamPost,
    pub error_status: Option<PostErrorStatus>,
}

/// A changed row produced by the reconcile diff. When `clear_features` is
/// set the post's vector rows are removed in the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct PostUpdate {
    pub model: post::Model,
    pub clear_features: bool,
}

/// A post whose frames were extracted successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedPost {
    pub post_id: i64,
    pub post_type: PostType,
    pub vectors: Vec<[f32; FEATURE_DIM]>,
}

/// A post whose extraction failed; the status is persisted so the post is
/// skipped until the next reconcile clears it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FailedPost {
    pub post_id: i64,
    pub error_status: PostErrorStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    /// Similarity in [0,1]: `1 - l2_distance / sqrt(108)`.
    pub score: f32,
    pub post: post::Model,
}

/// Transactional access to posts and their feature vectors. Every mutating
/// call is one transaction; readers observe pre- or post-batch state, never
/// anything in between.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn latest_post_id(&self) -> Result<i64, RepositoryError>;
    async fn latest_post_id_with_features(&self) -> Result<i64, RepositoryError>;
    async fn count(&self) -> Result<u64, RepositoryError>;
    async fn count_with_features(&self) -> Result<u64, RepositoryError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<post::Model>, RepositoryError>;
    async fn get_by_ids(&self, ids: Vec<i64>) -> Result<Vec<post::Model>, RepositoryError>;
    async fn posts_in_range(&self, start: i64, end: i64)
        -> Result<Vec<post::Model>, RepositoryError>;

    /// All posts, optionally restricted to one media type, paged by id.
    async fn posts(
        &self,
        post_type: Option<PostType>,
        after_id: i64,
        limit: u64,
    ) -> Result<Vec<post::Model>, RepositoryError>;

    /// Posts eligible for feature extraction: no error recorded, not
    /// deleted, not indexed yet. Ordered by ascending id.
    async fn posts_missing_features(
        &self,
        post_type: Option<PostType>,
        limit: u64,
    ) -> Result<Vec<post::Model>, RepositoryError>;

    /// Persists one forward-ingest batch atomically.
    async fn save_ingested(&self, posts: Vec<NewPost>) -> Result<(), RepositoryError>;

    /// Persists one reconcile range atomically.
    async fn apply_reconcile(
        &self,
        inserts: Vec<NewPost>,
        updates: Vec<PostUpdate>,
    ) -> Result<(), RepositoryError>;

    /// Persists one feature-worker batch atomically: indexed posts get their
    /// vector rows and `features_indexed = true`, failed posts get their
    /// error status. A post is never observable half-indexed.
    async fn mark_indexed(
        &self,
        indexed: Vec<IndexedPost>,
        failed: Vec<FailedPost>,
    ) -> Result<(), RepositoryError>;

    /// Approximate nearest-neighbor search over the vectors of `post_type`,
    /// best match first. `exact` disables index scans for the transaction,
    /// `ef_search` tunes HNSW recall, `flags` post-filters by the bitmask.
    async fn search(
        &self,
        post_type: PostType,
        query: Vec<f32>,
        flags: Option<Vec<Flag>>,
        exact: bool,
        ef_search: Option<u32>,
        limit: u64,
    ) -> Result<Vec<SearchMatch>, RepositoryError>;
}
