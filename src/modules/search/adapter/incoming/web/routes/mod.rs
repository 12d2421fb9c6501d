pub mod api_index;
pub mod search_upload;
pub mod search_url;

use actix_web::HttpResponse;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::modules::post::domain::entities::Flag;
use crate::modules::search::application::post_search_service::{SearchError, SearchResult};

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub url: Option<String>,
    /// Comma-separated flag names, e.g. `sfw,nsfw`.
    pub flags: Option<String>,
    pub exact: Option<bool>,
}

impl SearchParams {
    pub fn parse_flags(&self) -> Result<Option<Vec<Flag>>, String> {
        let Some(raw) = &self.flags else { return Ok(None) };
        let flags = raw
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<Flag>, String>>()?;
        Ok(if flags.is_empty() { None } else { Some(flags) })
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

#[derive(Serialize)]
struct InternalErrorBody<'a> {
    error: &'a str,
    correlation_id: String,
}

pub fn bad_request(message: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorBody { error: message })
}

/// Renders a search outcome, logging internal failures under a correlation
/// id that is echoed to the caller for support.
pub fn render_search_result(result: Result<Vec<SearchResult>, SearchError>) -> HttpResponse {
    match result {
        Ok(results) => HttpResponse::Ok().json(results),
        Err(SearchError::InvalidImage) => bad_request("invalid image"),
        Err(e) => {
            let correlation_id = uuid::Uuid::new_v4().to_string();
            error!(correlation_id, error = %e, "error while searching");
            HttpResponse::InternalServerError().json(InternalErrorBody {
                error: "internal error while searching",
                correlation_id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(flags: Option<&str>) -> SearchParams {
        SearchParams {
            url: None,
            flags: flags.map(str::to_string),
            exact: None,
        }
    }

    #[test]
    fn parses_flag_lists() {
        assert_eq!(params(None).parse_flags().unwrap(), None);
        assert_eq!(
            params(Some("sfw")).parse_flags().unwrap(),
            Some(vec![Flag::Sfw])
        );
        assert_eq!(
            params(Some("sfw,pol")).parse_flags().unwrap(),
            Some(vec![Flag::Sfw, Flag::Pol])
        );
        assert_eq!(params(Some("")).parse_flags().unwrap(), None);
        assert!(params(Some("sfw,bogus")).parse_flags().is_err());
    }
}
