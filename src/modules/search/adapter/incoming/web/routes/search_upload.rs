use actix_multipart::Multipart;
use actix_web::{post, web, Responder};
use futures::TryStreamExt;

use super::{bad_request, render_search_result, SearchParams};
use crate::AppState;

/// Pulls the `image` field out of the multipart body.
async fn image_from_multipart(mut payload: Multipart) -> Option<Vec<u8>> {
    while let Ok(Some(mut field)) = payload.try_next().await {
        if field.name() != Some("image") {
            continue;
        }
        let mut data = Vec::new();
        while let Ok(Some(chunk)) = field.try_next().await {
            data.extend_from_slice(&chunk);
        }
        if data.is_empty() {
            return None;
        }
        return Some(data);
    }
    None
}

#[post("/api/search")]
pub async fn search_upload_handler(
    data: web::Data<AppState>,
    params: web::Query<SearchParams>,
    payload: Multipart,
) -> impl Responder {
    let Some(image) = image_from_multipart(payload).await else {
        return bad_request("no image");
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
