use actix_web::{get, web, HttpResponse, Responder};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct BuildInfo {
    git_sha: &'static str,
}

#[derive(Serialize)]
struct ApiIndexResponse {
    msg: &'static str,
    latest_post: i64,
    build: BuildInfo,
}

#[get("/api")]
pub async fn api_index_handler(data: web::Data<AppState>) -> impl Responder {
    match data.post_repository.latest_post_id().await {
        Ok(latest_post) => HttpResponse::Ok().json(ApiIndexResponse {
            msg: "welcome to the rep0st API",
            latest_post,
            build: BuildInfo { git_sha: crate::COMMIT_SHA },
        }),
        Err(e) => {
            tracing::error!(error = %e, "error reading latest post id");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use actix_web::{test, App};

    use crate::modules::post::application::ports::outgoing::post_repository::MockPostRepository;
    use crate::modules::search::application::post_search_service::MockSearchPosts;
    use crate::tests::support::app_state;

    #[actix_web::test]
    async fn reports_latest_post_and_build() {
        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().returning(|| Ok(1337));

        let state = app_state(Arc::new(MockSearchPosts::new()), Arc::new(posts));
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .service(api_index_handler),
        )
        .await;

        let req = test::TestRequest::get().uri("/api").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["latest_post"], 1337);
        assert_eq!(body["msg"], "welcome to the rep0st API");
        assert!(body["build"]["git_sha"].is_string());
    }
}
