use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::modules::feature::extractor::feature_vector;
use crate::modules::media::decoder;
use crate::modules::post::adapter::outgoing::sea_orm_entity::post::PostType;
use crate::modules::post::application::ports::outgoing::post_repository::{
    PostRepository, RepositoryError,
};
use crate::modules::post::domain::entities::{Flag, PostInfo};

/// Candidate pool requested from the index. Generous so a restrictive flag
/// filter still leaves results to return.
const SEARCH_EF: u32 = 1000;
const SEARCH_LIMIT: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("invalid image")]
    InvalidImage,

    #[error("search failed")]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub similarity: f32,
    pub post: PostInfo,
}

/// Incoming port for the query path: bytes in, ranked posts out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SearchPosts: Send + Sync {
    async fn search_bytes(
        &self,
        data: Vec<u8>,
        flags: Option<Vec<Flag>>,
        exact: bool,
    ) -> Result<Vec<SearchResult>, SearchError>;
}

pub struct PostSearchService {
    posts: Arc<dyn PostRepository>,
}

impl PostSearchService {
    pub fn new(posts: Arc<dyn PostRepository>) -> Self {
        PostSearchService { posts }
    }
}

#[async_trait]
impl SearchPosts for PostSearchService {
    async fn search_bytes(
        &self,
        data: Vec<u8>,
        flags: Option<Vec<Flag>>,
        exact: bool,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let query = tokio::task::spawn_blocking(move || {
            decoder::decode_image(&data).map(|frame| feature_vector(&frame))
        })
        .await
        .map_err(|_| SearchError::InvalidImage)?
        .map_err(|_| SearchError::InvalidImage)?;

        let matches = self
            .posts
            .search(
                PostType::Image,
                query.to_vec(),
                flags,
                exact,
                Some(SEARCH_EF),
                SEARCH_LIMIT,
            )
            .await?;
        debug!(count = matches.len(), "search returned candidates");

        let mut results: Vec<SearchResult> = matches
            .into_iter()
            .map(|m| SearchResult { similarity: m.score, post: PostInfo::from(m.post) })
            .collect();
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }
}
