use async_trait::async_trait;

use crate::modules::post::application::ports::outgoing::post_repository::RepositoryError;
use crate::modules::pr0gramm::dto::UpstreamTag;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TagRepository: Send + Sync {
    async fn latest_tag_id(&self) -> Result<i64, RepositoryError>;

    /// Persists one batch atomically. Already-known tags are skipped.
    async fn add_all(&self, tags: Vec<UpstreamTag>) -> Result<(), RepositoryError>;
}
