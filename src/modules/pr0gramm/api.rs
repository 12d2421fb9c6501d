use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::config::Pr0grammApiConfig;
use crate::modules::pr0gramm::dto::{
    ItemsResponse, LoginResponse, TagsResponse, UpstreamPost, UpstreamTag,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    WrongCredentials,
    Banned,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Bad credentials or banned account. Never retried.
    #[error("login with user failed: {0:?}")]
    Auth(AuthFailure),

    /// Too many consecutive network or server failures.
    #[error("request to {url} failed too often")]
    Transient {
        url: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The requested resource is gone upstream.
    #[error("request to {0} failed with 404")]
    NotFound(String),
}

/// Which media host a path is fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadKind {
    Image,
    Fullsize,
    Video,
}

/// A single page of the upstream post feed.
#[derive(Debug, Clone)]
pub struct ItemsPage {
    pub at_start: bool,
    pub items: Vec<UpstreamPost>,
}

/// Outgoing port to the pr0gramm API. One implementation talks HTTP, tests
/// substitute mocks.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Pr0grammApiClient: Send + Sync {
    /// Fetch the feed page after `newer`, or the newest page when `None`.
    /// Items within a page are ordered by ascending id.
    async fn items_newer(&self, newer: Option<i64>) -> Result<ItemsPage, UpstreamError>;

    /// Fetch the tag page after tag id `after`. An empty page means
    /// end-of-stream.
    async fn tags_after(&self, after: i64) -> Result<Vec<UpstreamTag>, UpstreamError>;

    async fn download(&self, kind: DownloadKind, path: &str) -> Result<Bytes, UpstreamError>;

    /// Highest post id currently visible upstream, 0 when the feed is empty.
    async fn latest_post_id(&self) -> Result<i64, UpstreamError>;
}

pub struct Pr0grammApi {
    client: reqwest::Client,
    config: Pr0grammApiConfig,
    /// Login is serialized so concurrent 403s trigger a single re-login.
    login_lock: tokio::sync::Mutex<()>,
}

impl Pr0grammApi {
    pub fn new(config: Pr0grammApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Pr0grammApi {
            client,
            config,
            login_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub async fn login(&self) -> Result<(), UpstreamError> {
        let _guard = self.login_lock.lock().await;
        self.login_locked().await
    }

    async fn login_locked(&self) -> Result<(), UpstreamError> {
        let url = format!("{}/user/login", self.config.baseurl_api);
        let mut error_count = 0u32;
        loop {
            debug!(user = %self.config.user, "performing pr0gramm login");
            let result = self
                .client
                .post(&url)
                .form(&[("name", &self.config.user), ("password", &self.config.password)])
                .send()
                .await
                .and_then(|r| r.error_for_status());
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    error_count += 1;
                    if error_count > MAX_ATTEMPTS {
                        return Err(UpstreamError::Transient { url, source: Some(e) });
                    }
                    warn!(error = %e, "error logging in, retrying in 10 seconds");
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    continue;
                }
            };
            let body: LoginResponse = response
                .json()
                .await
                .map_err(|e| UpstreamError::Transient { url: url.clone(), source: Some(e) })?;
            if !body.success {
                return Err(UpstreamError::Auth(AuthFailure::WrongCredentials));
            }
            if body.is_banned() {
                return Err(UpstreamError::Auth(AuthFailure::Banned));
            }
            info!(user = %self.config.user, "login to pr0gramm successful");
            return Ok(());
        }
    }

    /// Shared request path: re-login once on 403, fail fast on 404, back off
    /// 3^n seconds on anything else.
    async fn get(&self, url: &str) -> Result<reqwest::Response, UpstreamError> {
        debug!(url, "performing request");
        let mut error_count = 0u32;
        let mut relogged_in = false;
        loop {
            match self.client.get(url).send().await {
                Ok(response) if response.status() == StatusCode::FORBIDDEN => {
                    if relogged_in {
                        return Err(UpstreamError::Transient {
                            url: url.to_string(),
                            source: None,
                        });
                    }
                    warn!(url, "got 403, session expired, performing login");
                    self.login().await?;
                    relogged_in = true;
                    continue;
                }
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    return Err(UpstreamError::NotFound(url.to_string()));
                }
                Ok(response) => match response.error_for_status() {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        error_count += 1;
                        if error_count > MAX_ATTEMPTS {
                            return Err(UpstreamError::Transient {
                                url: url.to_string(),
                                source: Some(e),
                            });
                        }
                        let backoff = 3u64.pow(error_count);
                        warn!(url, error = %e, backoff, "request failed, backing off");
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                    }
                },
                Err(e) => {
                    error_count += 1;
                    if error_count > MAX_ATTEMPTS {
                        return Err(UpstreamError::Transient {
                            url: url.to_string(),
                            source: Some(e),
                        });
                    }
                    let backoff = 3u64.pow(error_count);
                    warn!(url, error = %e, backoff, "request failed, backing off");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
    }
}

#[async_trait]
impl Pr0grammApiClient for Pr0grammApi {
    async fn items_newer(&self, newer: Option<i64>) -> Result<ItemsPage, UpstreamError> {
        let url = match newer {
            Some(newer) => format!(
                "{}/items/get?flags=31&promoted=0&newer={newer}",
                self.config.baseurl_api
            ),
            None => format!("{}/items/get?flags=31&promoted=0", self.config.baseurl_api),
        };
        let body: ItemsResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::Transient { url, source: Some(e) })?;

        let mut at_start = body.at_start;
        let mut items: Vec<UpstreamPost> =
            body.items.into_iter().map(UpstreamPost::from).collect();
        if let Some(limit) = self.config.limit_id_to {
            let before = items.len();
            items.retain(|i| i.id < limit);
            if items.len() != before {
                // Everything past the limit is invisible, so the feed ends here.
                at_start = true;
            }
        }
        Ok(ItemsPage { at_start, items })
    }

    async fn tags_after(&self, after: i64) -> Result<Vec<UpstreamTag>, UpstreamError> {
        let url = format!("{}/tags/latest?id={after}", self.config.baseurl_api);
        let body: TagsResponse = self
            .get(&url)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::Transient { url, source: Some(e) })?;
        Ok(body.tags.into_iter().map(UpstreamTag::from).collect())
    }

    async fn download(&self, kind: DownloadKind, path: &str) -> Result<Bytes, UpstreamError> {
        let base = match kind {
            DownloadKind::Image => &self.config.baseurl_img,
            DownloadKind::Fullsize => &self.config.baseurl_full,
            DownloadKind::Video => &self.config.baseurl_vid,
        };
        let url = format!("{base}/{path}");
        debug!(url, "downloading media");
        self.get(&url)
            .await?
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transient { url, source: Some(e) })
    }

    async fn latest_post_id(&self) -> Result<i64, UpstreamError> {
        let page = self.items_newer(None).await?;
        Ok(page.items.iter().map(|i| i.id).max().unwrap_or(0))
    }
}

/// Lazy, single-pass walk over the post feed. Resumable only by building a
/// new stream from the last seen id.
pub struct PostStream {
    api: Arc<dyn Pr0grammApiClient>,
    cursor: i64,
    end: Option<i64>,
    done: bool,
    buffer: std::collections::VecDeque<UpstreamPost>,
}

impl PostStream {
    pub fn new(api: Arc<dyn Pr0grammApiClient>, start: i64, end: Option<i64>) -> Self {
        PostStream {
            api,
            cursor: start,
            end,
            done: false,
            buffer: std::collections::VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Result<Option<UpstreamPost>, UpstreamError> {
        loop {
            if let Some(post) = self.buffer.pop_front() {
                if let Some(end) = self.end {
                    if post.id > end {
                        self.done = true;
                        self.buffer.clear();
                        return Ok(None);
                    }
                }
                self.cursor = post.id;
                return Ok(Some(post));
            }
            if self.done {
                return Ok(None);
            }
            let page = self.api.items_newer(Some(self.cursor)).await?;
            self.done = page.at_start;
            self.buffer.extend(page.items);
            if self.buffer.is_empty() && self.done {
                return Ok(None);
            }
        }
    }

    /// Drains up to `n` posts into a batch. An empty batch means the stream
    /// is exhausted.
    pub async fn next_batch(&mut self, n: usize) -> Result<Vec<UpstreamPost>, UpstreamError> {
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n {
            match self.next().await? {
                Some(post) => batch.push(post),
                None => break,
            }
        }
        Ok(batch)
    }
}

/// Lazy walk over the tag feed, ending on the first empty page.
pub struct TagStream {
    api: Arc<dyn Pr0grammApiClient>,
    cursor: i64,
    done: bool,
    buffer: std::collections::VecDeque<UpstreamTag>,
}

impl TagStream {
    pub fn new(api: Arc<dyn Pr0grammApiClient>, start: i64) -> Self {
        TagStream {
            api,
            cursor: start,
            done: false,
            buffer: std::collections::VecDeque::new(),
        }
    }

    pub async fn next_batch(&mut self, n: usize) -> Result<Vec<UpstreamTag>, UpstreamError> {
        let mut batch = Vec::with_capacity(n);
        while batch.len() < n {
            if let Some(tag) = self.buffer.pop_front() {
                self.cursor = tag.id;
                batch.push(tag);
                continue;
            }
            if self.done {
                break;
            }
            let page = self.api.tags_after(self.cursor).await?;
            if page.is_empty() {
                self.done = true;
                break;
            }
            self.buffer.extend(page);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::modules::post::adapter::outgoing::sea_orm_entity::post::PostType;

    fn upstream_post(id: i64) -> UpstreamPost {
        UpstreamPost {
            id,
            created: Utc::now(),
            image: format!("{id}.jpg"),
            thumb: None,
            fullsize: None,
            width: 100,
            height: 100,
            audio: false,
            source: None,
            flags: 1,
            user: "tester".to_string(),
            post_type: PostType::Image,
        }
    }

    #[tokio::test]
    async fn post_stream_walks_pages_until_at_start() {
        let mut api = MockPr0grammApiClient::new();
        api.expect_items_newer()
            .withf(|newer| *newer == Some(0))
            .times(1)
            .returning(|_| {
                Ok(ItemsPage {
                    at_start: false,
                    items: vec![upstream_post(1), upstream_post(2)],
                })
            });
        api.expect_items_newer()
            .withf(|newer| *newer == Some(2))
            .times(1)
            .returning(|_| {
                Ok(ItemsPage { at_start: true, items: vec![upstream_post(3)] })
            });

        let mut stream = PostStream::new(Arc::new(api), 0, None);
        let mut ids = Vec::new();
        while let Some(post) = stream.next().await.unwrap() {
            ids.push(post.id);
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn post_stream_respects_end_id() {
        let mut api = MockPr0grammApiClient::new();
        api.expect_items_newer().times(1).returning(|_| {
            Ok(ItemsPage {
                at_start: false,
                items: vec![upstream_post(5), upstream_post(6), upstream_post(7)],
            })
        });

        let mut stream = PostStream::new(Arc::new(api), 4, Some(6));
        let mut ids = Vec::new();
        while let Some(post) = stream.next().await.unwrap() {
            ids.push(post.id);
        }
        assert_eq!(ids, vec![5, 6]);
    }

    #[tokio::test]
    async fn next_batch_drains_in_chunks() {
        let mut api = MockPr0grammApiClient::new();
        api.expect_items_newer().times(1).returning(|_| {
            Ok(ItemsPage {
                at_start: true,
                items: (1..=5).map(upstream_post).collect(),
            })
        });

        let mut stream = PostStream::new(Arc::new(api), 0, None);
        let first = stream.next_batch(3).await.unwrap();
        assert_eq!(first.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        let second = stream.next_batch(3).await.unwrap();
        assert_eq!(second.iter().map(|p| p.id).collect::<Vec<_>>(), vec![4, 5]);
        assert!(stream.next_batch(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tag_stream_stops_on_empty_page() {
        let mut api = MockPr0grammApiClient::new();
        api.expect_tags_after()
            .withf(|after| *after == 0)
            .times(1)
            .returning(|_| {
                Ok(vec![
                    UpstreamTag {
                        id: 1,
                        post_id: 10,
                        tag: "katze".to_string(),
                        up: 5,
                        down: 0,
                        confidence: 0.9,
                    },
                ])
            });
        api.expect_tags_after()
            .withf(|after| *after == 1)
            .times(1)
            .returning(|_| Ok(vec![]));

        let mut stream = TagStream::new(Arc::new(api), 0);
        let batch = stream.next_batch(100).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(stream.next_batch(100).await.unwrap().is_empty());
    }
}
