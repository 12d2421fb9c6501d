use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::modules::media::store::{MediaRef, MediaStore, MediaStoreError};
use crate::modules::post::adapter::outgoing::sea_orm_entity::post::{self, PostErrorStatus};
use crate::modules::post::application::ports::outgoing::post_repository::{
    NewPost, PostRepository, PostUpdate, RepositoryError,
};
use crate::modules::pr0gramm::api::{Pr0grammApiClient, PostStream, UpstreamError};
use crate::modules::pr0gramm::dto::UpstreamPost;

const INGEST_BATCH_SIZE: usize = 100;
const RECONCILE_RANGE_SIZE: i64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("upstream error")]
    Upstream(#[from] UpstreamError),

    #[error("repository error")]
    Repository(#[from] RepositoryError),
}

/// Walks the upstream feed and keeps the local post table in sync with it,
/// downloading media along the way.
pub struct PostService {
    api: Arc<dyn Pr0grammApiClient>,
    media: Arc<MediaStore>,
    posts: Arc<dyn PostRepository>,
}

impl PostService {
    pub fn new(
        api: Arc<dyn Pr0grammApiClient>,
        media: Arc<MediaStore>,
        posts: Arc<dyn PostRepository>,
    ) -> Self {
        PostService { api, media, posts }
    }

    /// Fetches the media for a post and classifies the outcome. A missing
    /// file is recorded on the post; transient upstream trouble fails the
    /// whole batch so the next schedule tick retries it.
    async fn download_media(
        &self,
        media: MediaRef<'_>,
    ) -> Result<Option<PostErrorStatus>, IngestError> {
        match self.media.ensure(media).await {
            Ok(_) => Ok(None),
            Err(MediaStoreError::NotFound { path }) => {
                warn!(post_id = media.id, path, "no media found for post");
                Ok(Some(PostErrorStatus::NoMediaFound))
            }
            Err(MediaStoreError::Upstream(e)) => Err(IngestError::Upstream(e)),
            Err(e) => {
                warn!(post_id = media.id, error = %e, "error saving media for post");
                Ok(Some(PostErrorStatus::NoMediaFound))
            }
        }
    }

    /// Forward ingest: pull everything newer than the latest local post in
    /// batches of 100, each persisted atomically.
    pub async fn update_posts(
        &self,
        end_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let latest_post = self.posts.latest_post_id().await?;
        info!(latest_post, "starting post update");

        let mut stream = PostStream::new(self.api.clone(), latest_post, end_id);
        let mut counter = 0usize;
        loop {
            if cancel.is_cancelled() {
                info!("post update cancelled");
                return Ok(());
            }
            let batch = stream.next_batch(INGEST_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "processing posts");
            let mut new_posts = Vec::with_capacity(batch.len());
            for upstream in batch {
                let error_status = self.download_media((&upstream).into()).await?;
                new_posts.push(NewPost { post: upstream, error_status });
            }
            counter += new_posts.len();
            self.posts.save_ingested(new_posts).await?;
        }

        info!(added = counter, "finished updating posts");
        Ok(())
    }

    /// Full reconcile: compare upstream and local state over id ranges of
    /// 1000 and repair every difference. Ranges commit in ascending order.
    pub async fn update_all_posts(
        &self,
        start_id: Option<i64>,
        end_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<(), IngestError> {
        let start = start_id.unwrap_or(1).max(1);
        let api_latest = self.api.latest_post_id().await?;
        if api_latest == 0 {
            error!("latest post id could not be determined from the pr0gramm API");
            return Ok(());
        }
        let db_latest = self.posts.latest_post_id().await?;
        let mut upper = api_latest.max(db_latest);
        if let Some(end_id) = end_id {
            upper = upper.min(end_id);
        }

        let mut range_start = start;
        while range_start <= upper {
            if cancel.is_cancelled() {
                info!("reconcile cancelled");
                return Ok(());
            }
            let range_end = (range_start + RECONCILE_RANGE_SIZE - 1).min(upper);
            self.reconcile_range(range_start, range_end).await?;
            range_start = range_end + 1;
        }
        Ok(())
    }

    async fn reconcile_range(&self, range_start: i64, range_end: i64) -> Result<(), IngestError> {
        info!(range_start, range_end, "reconciling posts");

        let mut from_api: BTreeMap<i64, UpstreamPost> = BTreeMap::new();
        let mut stream = PostStream::new(self.api.clone(), range_start - 1, Some(range_end));
        while let Some(post) = stream.next().await? {
            from_api.insert(post.id, post);
        }
        let from_db: BTreeMap<i64, post::Model> = self
            .posts
            .posts_in_range(range_start, range_end)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for id in range_start..=range_end {
            match (from_api.remove(&id), from_db.get(&id)) {
                (Some(api_post), None) => {
                    // Post returned by the API but not in the DB.
                    debug!(post_id = id, "adding missing post");
                    let error_status = self.download_media((&api_post).into()).await?;
                    inserts.push(NewPost { post: api_post, error_status });
                }
                (None, None) => {
                    // Never seen and gone upstream; nothing to bring back.
                }
                (None, Some(db_post)) => {
                    if !db_post.deleted {
                        debug!(post_id = id, "marking post deleted, it is no longer in the API");
                        let mut model = db_post.clone();
                        model.deleted = true;
                        model.features_indexed = false;
                        updates.push(PostUpdate { model, clear_features: true });
                    }
                }
                (Some(api_post), Some(db_post)) => {
                    if let Some(update) = self.reconcile_post(api_post, db_post.clone()).await? {
                        updates.push(update);
                    }
                }
            }
        }
        self.posts.apply_reconcile(inserts, updates).await?;
        Ok(())
    }

    /// A post present on both sides: undelete, refresh flags, follow media
    /// path changes and re-check the media on disk.
    async fn reconcile_post(
        &self,
        api_post: UpstreamPost,
        mut model: post::Model,
    ) -> Result<Option<PostUpdate>, IngestError> {
        let mut changed = false;

        if model.deleted {
            debug!(post_id = model.id, "unmarking post as deleted, the API contains it");
            model.deleted = false;
            changed = true;
        }
        if model.flags != api_post.flags {
            debug!(
                post_id = model.id,
                old = model.flags,
                new = api_post.flags,
                "updating flags of post"
            );
            model.flags = api_post.flags;
            changed = true;
        }
        if model.thumb != api_post.thumb {
            model.thumb = api_post.thumb.clone();
            changed = true;
        }

        if model.image != api_post.image || model.fullsize != api_post.fullsize {
            let new_ref = MediaRef {
                id: model.id,
                image: &api_post.image,
                fullsize: api_post.fullsize.as_deref(),
                post_type: api_post.post_type,
                broken: false,
            };
            match self.media.rename((&model).into(), new_ref).await {
                Ok(()) => {
                    model.image = api_post.image.clone();
                    model.fullsize = api_post.fullsize.clone();
                    model.post_type = api_post.post_type;
                    changed = true;
                }
                Err(e) => {
                    // Leave the old paths in place; the next reconcile
                    // retries the move.
                    error!(post_id = model.id, error = %e, "error moving media for post");
                }
            }
        }

        let old_error_status = model.error_status;
        let new_error_status = self.download_media((&model).into()).await?;
        model.error_status = new_error_status;
        let mut clear_features = false;
        if old_error_status != new_error_status {
            // The media changed state; the feature job will index it again
            // on its next run.
            model.features_indexed = false;
            clear_features = true;
            changed = true;
        }

        Ok(changed.then_some(PostUpdate { model, clear_features }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mockall::predicate::eq;

    use crate::modules::post::adapter::outgoing::sea_orm_entity::post::PostType;
    use crate::modules::post::application::ports::outgoing::post_repository::MockPostRepository;
    use crate::modules::pr0gramm::api::{ItemsPage, MockPr0grammApiClient};

    fn upstream_post(id: i64, image: &str) -> UpstreamPost {
        UpstreamPost {
            id,
            created: Utc::now(),
            image: image.to_string(),
            thumb: None,
            fullsize: None,
            width: 100,
            height: 100,
            audio: false,
            source: None,
            flags: 1,
            user: "tester".to_string(),
            post_type: PostType::from_media_path(image),
        }
    }

    fn db_post(id: i64, image: &str) -> post::Model {
        post::Model {
            id,
            created: Utc::now(),
            image: image.to_string(),
            thumb: None,
            fullsize: None,
            width: 100,
            height: 100,
            audio: false,
            source: None,
            flags: 1,
            username: "tester".to_string(),
            post_type: PostType::from_media_path(image),
            error_status: None,
            deleted: false,
            features_indexed: false,
        }
    }

    fn service(
        api: MockPr0grammApiClient,
        posts: MockPostRepository,
        dir: &tempfile::TempDir,
    ) -> PostService {
        let api = Arc::new(api);
        let media = Arc::new(MediaStore::new(dir.path().to_path_buf(), api.clone()));
        PostService::new(api, media, Arc::new(posts))
    }

    #[tokio::test]
    async fn fresh_ingest_saves_posts_and_media() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockPr0grammApiClient::new();
        api.expect_items_newer()
            .with(eq(Some(0)))
            .times(1)
            .returning(|_| {
                Ok(ItemsPage {
                    at_start: true,
                    items: vec![upstream_post(1, "a.jpg"), upstream_post(2, "b.mp4")],
                })
            });
        api.expect_download()
            .times(2)
            .returning(|_, _| Ok(bytes::Bytes::from_static(b"mediadata")));

        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().times(1).returning(|| Ok(0));
        posts
            .expect_save_ingested()
            .withf(|batch| {
                batch.len() == 2
                    && batch.iter().all(|p| p.error_status.is_none())
                    && batch[0].post.id == 1
                    && batch[1].post.id == 2
            })
            .times(1)
            .returning(|_| Ok(()));

        let service = service(api, posts, &dir);
        service
            .update_posts(None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(dir.path().join("a.jpg").exists());
        assert!(dir.path().join("b.mp4").exists());
    }

    #[tokio::test]
    async fn missing_media_is_recorded_per_post() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockPr0grammApiClient::new();
        api.expect_items_newer().times(1).returning(|_| {
            Ok(ItemsPage { at_start: true, items: vec![upstream_post(7, "gone.jpg")] })
        });
        api.expect_download()
            .times(1)
            .returning(|_, _| Err(UpstreamError::NotFound("gone.jpg".to_string())));

        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().returning(|| Ok(0));
        posts
            .expect_save_ingested()
            .withf(|batch| {
                batch.len() == 1 && batch[0].error_status == Some(PostErrorStatus::NoMediaFound)
            })
            .times(1)
            .returning(|_| Ok(()));

        let service = service(api, posts, &dir);
        service
            .update_posts(None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!dir.path().join("gone.jpg").exists());
    }

    #[tokio::test]
    async fn update_posts_is_idempotent_when_upstream_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockPr0grammApiClient::new();
        // The cursor starts at the latest local post, and upstream reports
        // at-start with nothing newer.
        api.expect_items_newer()
            .with(eq(Some(42)))
            .times(1)
            .returning(|_| Ok(ItemsPage { at_start: true, items: vec![] }));

        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().returning(|| Ok(42));
        posts.expect_save_ingested().times(0);

        let service = service(api, posts, &dir);
        service
            .update_posts(None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transient_upstream_failure_aborts_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockPr0grammApiClient::new();
        api.expect_items_newer().times(1).returning(|_| {
            Ok(ItemsPage { at_start: true, items: vec![upstream_post(1, "a.jpg")] })
        });
        api.expect_download().times(1).returning(|_, _| {
            Err(UpstreamError::Transient { url: "x".to_string(), source: None })
        });

        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().returning(|| Ok(0));
        posts.expect_save_ingested().times(0);

        let service = service(api, posts, &dir);
        let err = service
            .update_posts(None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Upstream(UpstreamError::Transient { .. })));
    }

    #[tokio::test]
    async fn reconcile_marks_vanished_posts_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockPr0grammApiClient::new();
        api.expect_latest_post_id().times(1).returning(|| Ok(10));
        // Range walk 1..=10 returns every post except id 5.
        api.expect_items_newer()
            .with(eq(Some(0)))
            .times(1)
            .returning(|_| {
                Ok(ItemsPage {
                    at_start: true,
                    items: (1..=10)
                        .filter(|id| *id != 5)
                        .map(|id| upstream_post(id, &format!("{id}.jpg")))
                        .collect(),
                })
            });

        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().returning(|| Ok(10));
        posts
            .expect_posts_in_range()
            .with(eq(1), eq(10))
            .times(1)
            .returning(|_, _| Ok(vec![db_post(5, "e.jpg")]));
        posts
            .expect_apply_reconcile()
            .withf(|inserts, updates| {
                // 9 upstream posts are new, post 5 transitions to deleted
                // with its vectors cleared.
                inserts.len() == 9
                    && updates.len() == 1
                    && updates[0].model.id == 5
                    && updates[0].model.deleted
                    && !updates[0].model.features_indexed
                    && updates[0].clear_features
            })
            .times(1)
            .returning(|_, _| Ok(()));

        // Media downloads for the 9 inserts.
        api.expect_download()
            .times(9)
            .returning(|_, _| Ok(bytes::Bytes::from_static(b"img")));

        let service = service(api, posts, &dir);
        service
            .update_all_posts(Some(1), Some(10), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reconcile_clears_features_when_error_status_changes() {
        let dir = tempfile::tempdir().unwrap();

        let mut api = MockPr0grammApiClient::new();
        api.expect_latest_post_id().returning(|| Ok(1));
        api.expect_items_newer()
            .with(eq(Some(0)))
            .returning(|_| {
                Ok(ItemsPage { at_start: true, items: vec![upstream_post(1, "a.jpg")] })
            });
        // The media is gone now.
        api.expect_download()
            .times(1)
            .returning(|_, _| Err(UpstreamError::NotFound("a.jpg".to_string())));

        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().returning(|| Ok(1));
        let mut indexed = db_post(1, "a.jpg");
        indexed.features_indexed = true;
        posts
            .expect_posts_in_range()
            .returning(move |_, _| Ok(vec![indexed.clone()]));
        posts
            .expect_apply_reconcile()
            .withf(|inserts, updates| {
                inserts.is_empty()
                    && updates.len() == 1
                    && updates[0].model.error_status == Some(PostErrorStatus::NoMediaFound)
                    && !updates[0].model.features_indexed
                    && updates[0].clear_features
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let service = service(api, posts, &dir);
        service
            .update_all_posts(Some(1), Some(1), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reconcile_undeletes_posts_that_reappeared() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"img").unwrap();

        let mut api = MockPr0grammApiClient::new();
        api.expect_latest_post_id().returning(|| Ok(1));
        api.expect_items_newer()
            .with(eq(Some(0)))
            .returning(|_| {
                Ok(ItemsPage { at_start: true, items: vec![upstream_post(1, "a.jpg")] })
            });

        let mut posts = MockPostRepository::new();
        posts.expect_latest_post_id().returning(|| Ok(1));
        let mut gone = db_post(1, "a.jpg");
        gone.deleted = true;
        posts
            .expect_posts_in_range()
            .returning(move |_, _| Ok(vec![gone.clone()]));
        posts
            .expect_apply_reconcile()
            .withf(|inserts, updates| {
                inserts.is_empty()
                    && updates.len() == 1
                    && !updates[0].model.deleted
                    && !updates[0].clear_features
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let service = service(api, posts, &dir);
        service
            .update_all_posts(Some(1), Some(1), &CancellationToken::new())
            .await
            .unwrap();
    }
}
