use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::modules::feature::extractor::{feature_vector, FEATURE_DIM};
use crate::modules::media::decoder::{self, DecodeError};
use crate::modules::media::store::{MediaRef, MediaStore, MediaStoreError};
use crate::modules::post::adapter::outgoing::sea_orm_entity::post::{
    self, PostErrorStatus, PostType,
};
use crate::modules::post::application::ports::outgoing::post_repository::{
    FailedPost, IndexedPost, PostRepository, RepositoryError,
};

const BATCH_SIZE: u64 = 1000;
const WORKERS: usize = 16;
const BATCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum FeatureUpdateError {
    #[error("repository error")]
    Repository(#[from] RepositoryError),
}

/// Per-post extraction outcome, translated to an error status on the post.
enum WorkError {
    NoMediaFound,
    MediaBroken,
    Cancelled,
}

/// The work item shipped to a pool task: the post's key data plus the
/// extracted vectors on the way back.
struct WorkResult {
    post_id: i64,
    post_type: PostType,
    outcome: Result<Vec<[f32; FEATURE_DIM]>, WorkError>,
}

/// Drives unindexed posts through decode and feature extraction in parallel
/// batches, persisting each batch in a single transaction.
pub struct FeatureService {
    posts: Arc<dyn PostRepository>,
    media: Arc<MediaStore>,
}

impl FeatureService {
    pub fn new(posts: Arc<dyn PostRepository>, media: Arc<MediaStore>) -> Self {
        FeatureService { posts, media }
    }

    pub async fn update_features(
        &self,
        post_type: PostType,
        cancel: &CancellationToken,
    ) -> Result<(), FeatureUpdateError> {
        info!(?post_type, "starting feature update");
        let mut post_counter = 0usize;
        let mut vector_counter = 0usize;
        loop {
            if cancel.is_cancelled() {
                info!("feature update cancelled");
                break;
            }
            let posts = self
                .posts
                .posts_missing_features(Some(post_type), BATCH_SIZE)
                .await?;
            if posts.is_empty() {
                break;
            }
            debug!(count = posts.len(), "calculating features for posts");

            let (indexed, failed) = self.process_batch(posts, cancel).await;
            post_counter += indexed.len();
            vector_counter += indexed.iter().map(|p| p.vectors.len()).sum::<usize>();
            self.posts.mark_indexed(indexed, failed).await?;
        }
        info!(
            posts = post_counter,
            vectors = vector_counter,
            "finished updating features"
        );
        Ok(())
    }

    /// Fans a batch out over the worker pool. Posts that neither finish nor
    /// fail within the batch timeout are recorded as broken media.
    async fn process_batch(
        &self,
        posts: Vec<post::Model>,
        cancel: &CancellationToken,
    ) -> (Vec<IndexedPost>, Vec<FailedPost>) {
        let semaphore = Arc::new(Semaphore::new(WORKERS));
        let mut pending: HashMap<i64, ()> = posts.iter().map(|p| (p.id, ())).collect();
        let mut join_set = JoinSet::new();
        for post in posts {
            let semaphore = semaphore.clone();
            let media = self.media.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                process_post(media, &post, &cancel).await
            });
        }

        let mut indexed = Vec::new();
        let mut failed = Vec::new();
        let deadline = tokio::time::Instant::now() + BATCH_TIMEOUT;
        loop {
            let joined = match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Err(_) => {
                    warn!(
                        pending = pending.len(),
                        "batch timed out, marking unfinished posts as broken"
                    );
                    join_set.abort_all();
                    for (post_id, _) in pending.drain() {
                        failed.push(FailedPost {
                            post_id,
                            error_status: PostErrorStatus::MediaBroken,
                        });
                    }
                    break;
                }
                Ok(None) => break,
                Ok(Some(joined)) => joined,
            };
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    // A panicking task has no post id to blame; its entry in
                    // `pending` is swept up by the timeout arm or stays
                    // unindexed for the next run.
                    warn!(error = %e, "feature worker task failed");
                    continue;
                }
            };
            pending.remove(&result.post_id);
            match result.outcome {
                Ok(vectors) => indexed.push(IndexedPost {
                    post_id: result.post_id,
                    post_type: result.post_type,
                    vectors,
                }),
                Err(WorkError::NoMediaFound) => failed.push(FailedPost {
                    post_id: result.post_id,
                    error_status: PostErrorStatus::NoMediaFound,
                }),
                Err(WorkError::MediaBroken) => failed.push(FailedPost {
                    post_id: result.post_id,
                    error_status: PostErrorStatus::MediaBroken,
                }),
                // Cancelled posts stay unindexed and are picked up again.
                Err(WorkError::Cancelled) => {}
            }
        }
        // Posts whose task panicked never reported back; record them as
        // broken so the batch loop cannot spin on them forever.
        for (post_id, _) in pending.drain() {
            failed.push(FailedPost { post_id, error_status: PostErrorStatus::MediaBroken });
        }
        (indexed, failed)
    }
}

async fn process_post(
    media: Arc<MediaStore>,
    post: &post::Model,
    cancel: &CancellationToken,
) -> WorkResult {
    let outcome = extract_vectors(media, post, cancel).await;
    if let Err(WorkError::NoMediaFound) = outcome {
        warn!(post_id = post.id, "no media found, post marked with NO_MEDIA_FOUND");
    }
    if let Err(WorkError::MediaBroken) = outcome {
        warn!(post_id = post.id, "could not decode media, post marked with MEDIA_BROKEN");
    }
    WorkResult { post_id: post.id, post_type: post.post_type, outcome }
}

async fn extract_vectors(
    media: Arc<MediaStore>,
    post: &post::Model,
    cancel: &CancellationToken,
) -> Result<Vec<[f32; FEATURE_DIM]>, WorkError> {
    let media_ref = MediaRef::from(post);
    match post.post_type {
        PostType::Image | PostType::Animated => {
            let data = media.read(media_ref).await.map_err(map_store_error)?;
            let vector = tokio::task::spawn_blocking(move || {
                decoder::decode_image(&data).map(|frame| feature_vector(&frame))
            })
            .await
            .map_err(|_| WorkError::MediaBroken)?
            .map_err(map_decode_error)?;
            Ok(vec![vector])
        }
        PostType::Video => {
            let path = media.resolve(media_ref).await.map_err(map_store_error)?;
            let frames = decoder::video_keyframes(&path, cancel)
                .await
                .map_err(map_decode_error)?;
            let vectors = tokio::task::spawn_blocking(move || {
                frames.iter().map(feature_vector).collect::<Vec<_>>()
            })
            .await
            .map_err(|_| WorkError::MediaBroken)?;
            Ok(vectors)
        }
        PostType::Unknown => Err(WorkError::MediaBroken),
    }
}

/// Any failure to open local media counts as missing; the next reconcile
/// re-downloads and clears the status.
fn map_store_error(_: MediaStoreError) -> WorkError {
    WorkError::NoMediaFound
}

fn map_decode_error(e: DecodeError) -> WorkError {
    match e {
        DecodeError::Cancelled => WorkError::Cancelled,
        _ => WorkError::MediaBroken,
    }
}
