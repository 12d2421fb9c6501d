use std::sync::Arc;

use crate::modules::post::application::ports::outgoing::post_repository::PostRepository;
use crate::modules::search::application::post_search_service::SearchPosts;
use crate::AppState;

/// Builds an AppState from test doubles for route tests.
pub fn app_state(
    search_posts_use_case: Arc<dyn SearchPosts>,
    post_repository: Arc<dyn PostRepository>,
) -> AppState {
    AppState {
        search_posts_use_case,
        post_repository,
        http: reqwest::Client::new(),
    }
}
