use actix_web::{get, web, Responder};
use tracing::warn;

use super::{bad_request, render_search_result, SearchParams};
use crate::AppState;

async fn fetch_url(client: &reqwest::Client, url: &str) -> Option<Vec<u8>> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| warn!(url, error = %e, "could not load image from url"))
        .ok()?;
    let data = response
        .bytes()
        .await
        .map_err(|e| warn!(url, error = %e, "could not read image from url"))
        .ok()?;
    if data.is_empty() {
        return None;
    }
    Some(data.to_vec())
}

#[get("/api/search")]
pub async fn search_url_handler(
    data: web::Data<AppState>,
    params: web::Query<SearchParams>,
) -> impl Responder {
    let Some(url) = params.url.as_deref() else {
        return bad_request("url parameter missing");
    };
    let Some(image) = fetch_url(&data.http, url).await else {
        return bad_request("could not load image from url");
    };
    let flags = match params.parse_flags() {
        Ok(flags) => flags,
        Err(_) => return bad_request("invalid flags"),
    };
    let result = data
        .search_posts_use_case
        .search_bytes(image, flags, params.exact.unwrap_or(false))
        .await;
    render_search_result(result)
}
