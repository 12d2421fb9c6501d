use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::modules::post::adapter::outgoing::sea_orm_entity::post::{self, PostType};
use crate::modules::pr0gramm::api::{DownloadKind, Pr0grammApiClient, UpstreamError};
use crate::modules::pr0gramm::dto::UpstreamPost;

#[derive(Debug, thiserror::Error)]
pub enum MediaStoreError {
    /// The upstream host has no media at this path.
    #[error("no media found upstream for {path}")]
    NotFound { path: String },

    #[error("upstream error fetching media")]
    Upstream(#[source] UpstreamError),

    #[error("media io error")]
    Io(#[from] std::io::Error),

    #[error("posts have to have matching ids: {old} != {new}")]
    IdMismatch { old: i64, new: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Media already on disk, no network IO performed.
    Hit,
    /// Media downloaded and moved into place.
    Fetched,
}

/// Borrowed view of the fields the store needs from a post, regardless of
/// whether it is already persisted.
#[derive(Debug, Clone, Copy)]
pub struct MediaRef<'a> {
    pub id: i64,
    pub image: &'a str,
    pub fullsize: Option<&'a str>,
    pub post_type: PostType,
    /// Forces a re-download even when a file exists.
    pub broken: bool,
}

impl<'a> From<&'a UpstreamPost> for MediaRef<'a> {
    fn from(post: &'a UpstreamPost) -> Self {
        MediaRef {
            id: post.id,
            image: &post.image,
            fullsize: post.fullsize.as_deref(),
            post_type: post.post_type,
            broken: false,
        }
    }
}

impl<'a> From<&'a post::Model> for MediaRef<'a> {
    fn from(model: &'a post::Model) -> Self {
        MediaRef {
            id: model.id,
            image: &model.image,
            fullsize: model.fullsize.as_deref(),
            post_type: model.post_type,
            broken: model.error_status == Some(post::PostErrorStatus::MediaBroken),
        }
    }
}

/// Filesystem cache of raw media, keyed by the upstream media path.
/// Layout: `{root}/{image}`, fullsize under `{root}/full/{fullsize}`.
pub struct MediaStore {
    root: PathBuf,
    api: std::sync::Arc<dyn Pr0grammApiClient>,
}

impl MediaStore {
    pub fn new(root: PathBuf, api: std::sync::Arc<dyn Pr0grammApiClient>) -> Self {
        MediaStore { root, api }
    }

    fn media_file(&self, prefix: &str, path: &str) -> PathBuf {
        if prefix.is_empty() {
            self.root.join(path)
        } else {
            self.root.join(prefix).join(path)
        }
    }

    /// Makes sure the media for a post is on disk, downloading it when
    /// missing or marked broken. Idempotent; a second call is a cheap stat.
    pub async fn ensure(&self, media: MediaRef<'_>) -> Result<EnsureOutcome, MediaStoreError> {
        // Fullsize is nice-to-have for feature quality. Failures only log.
        if let Some(fullsize) = media.fullsize {
            if let Err(e) = self
                .ensure_one(media.id, "full", fullsize, DownloadKind::Fullsize, media.broken)
                .await
            {
                warn!(post_id = media.id, error = %e, "error downloading fullsize image, skipping");
            }
        }

        let kind = match media.post_type {
            PostType::Image | PostType::Animated => DownloadKind::Image,
            PostType::Video => DownloadKind::Video,
            PostType::Unknown => {
                error!(post_id = media.id, "cannot download media for post with unknown type");
                return Ok(EnsureOutcome::Hit);
            }
        };
        self.ensure_one(media.id, "", media.image, kind, media.broken).await
    }

    async fn ensure_one(
        &self,
        post_id: i64,
        prefix: &str,
        path: &str,
        kind: DownloadKind,
        force: bool,
    ) -> Result<EnsureOutcome, MediaStoreError> {
        let target = self.media_file(prefix, path);
        if !force && tokio::fs::try_exists(&target).await? {
            debug!(post_id, path = %target.display(), "media found on disk, skipping download");
            return Ok(EnsureOutcome::Hit);
        }

        debug!(post_id, path, "downloading media");
        let data = match self.api.download(kind, path).await {
            Ok(data) => data,
            Err(UpstreamError::NotFound(_)) => {
                return Err(MediaStoreError::NotFound { path: path.to_string() })
            }
            Err(e) => return Err(MediaStoreError::Upstream(e)),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a temp path and rename so readers never observe a partial
        // file.
        let tmp = temp_path(&target);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(EnsureOutcome::Fetched)
    }

    /// Moves media files when upstream changed the paths for the same post.
    /// On failure the filesystem is left untouched.
    pub async fn rename(
        &self,
        old: MediaRef<'_>,
        new: MediaRef<'_>,
    ) -> Result<(), MediaStoreError> {
        if old.id != new.id {
            return Err(MediaStoreError::IdMismatch { old: old.id, new: new.id });
        }

        if let (Some(old_full), Some(new_full)) = (old.fullsize, new.fullsize) {
            self.rename_one(old.id, "full", old_full, new_full).await?;
        }
        self.rename_one(old.id, "", old.image, new.image).await
    }

    async fn rename_one(
        &self,
        post_id: i64,
        prefix: &str,
        old: &str,
        new: &str,
    ) -> Result<(), MediaStoreError> {
        if old == new {
            debug!(post_id, path = old, "media already has the correct name");
            return Ok(());
        }
        let old_file = self.media_file(prefix, old);
        let new_file = self.media_file(prefix, new);
        debug!(post_id, from = %old_file.display(), to = %new_file.display(), "renaming media");
        if let Some(parent) = new_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old_file, &new_file).await?;
        Ok(())
    }

    /// Resolves the on-disk path to read for feature extraction, preferring
    /// the fullsize variant when it is present.
    pub async fn resolve(&self, media: MediaRef<'_>) -> Result<PathBuf, MediaStoreError> {
        if let Some(fullsize) = media.fullsize {
            let fullsize_file = self.media_file("full", fullsize);
            if tokio::fs::try_exists(&fullsize_file).await? {
                debug!(post_id = media.id, path = %fullsize_file.display(), "using fullsize image");
                return Ok(fullsize_file);
            }
            error!(
                post_id = media.id,
                path = %fullsize_file.display(),
                "fullsize image not found, falling back to resized image"
            );
        }
        let file = self.media_file("", media.image);
        if !tokio::fs::try_exists(&file).await? {
            return Err(MediaStoreError::NotFound { path: media.image.to_string() });
        }
        Ok(file)
    }

    /// Reads the full media bytes for a post.
    pub async fn read(&self, media: MediaRef<'_>) -> Result<Vec<u8>, MediaStoreError> {
        let path = self.resolve(media).await?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MediaStoreError::NotFound { path: path.display().to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path(target: &Path) -> PathBuf {
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::modules::pr0gramm::api::MockPr0grammApiClient;

    fn image_ref(image: &str) -> MediaRef<'_> {
        MediaRef {
            id: 1,
            image,
            fullsize: None,
            post_type: PostType::Image,
            broken: false,
        }
    }

    #[tokio::test]
    async fn ensure_downloads_once_then_hits() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockPr0grammApiClient::new();
        api.expect_download()
            .times(1)
            .returning(|_, _| Ok(bytes::Bytes::from_static(b"jpegdata")));
        let store = MediaStore::new(dir.path().to_path_buf(), Arc::new(api));

        let outcome = store.ensure(image_ref("2024/01/a.jpg")).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Fetched);
        assert_eq!(
            std::fs::read(dir.path().join("2024/01/a.jpg")).unwrap(),
            b"jpegdata"
        );

        // Second call must not touch the network (the mock only allows one
        // download).
        let outcome = store.ensure(image_ref("2024/01/a.jpg")).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Hit);
    }

    #[tokio::test]
    async fn ensure_maps_upstream_404() {
        let dir = tempfile::tempdir().unwrap();
        let mut api = MockPr0grammApiClient::new();
        api.expect_download()
            .times(1)
            .returning(|_, _| Err(UpstreamError::NotFound("gone.jpg".to_string())));
        let store = MediaStore::new(dir.path().to_path_buf(), Arc::new(api));

        let err = store.ensure(image_ref("gone.jpg")).await.unwrap_err();
        assert!(matches!(err, MediaStoreError::NotFound { .. }));
        assert!(!dir.path().join("gone.jpg").exists());
    }

    #[tokio::test]
    async fn ensure_redownloads_broken_media() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"truncated").unwrap();
        let mut api = MockPr0grammApiClient::new();
        api.expect_download()
            .times(1)
            .returning(|_, _| Ok(bytes::Bytes::from_static(b"fresh")));
        let store = MediaStore::new(dir.path().to_path_buf(), Arc::new(api));

        let media = MediaRef { broken: true, ..image_ref("b.jpg") };
        let outcome = store.ensure(media).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Fetched);
        assert_eq!(std::fs::read(dir.path().join("b.jpg")).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn rename_round_trip_restores_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.jpg"), b"data").unwrap();
        let api = MockPr0grammApiClient::new();
        let store = MediaStore::new(dir.path().to_path_buf(), Arc::new(api));

        store
            .rename(image_ref("old.jpg"), image_ref("new.jpg"))
            .await
            .unwrap();
        assert!(!dir.path().join("old.jpg").exists());
        assert!(dir.path().join("new.jpg").exists());

        store
            .rename(image_ref("new.jpg"), image_ref("old.jpg"))
            .await
            .unwrap();
        assert!(dir.path().join("old.jpg").exists());
        assert!(!dir.path().join("new.jpg").exists());
    }

    #[tokio::test]
    async fn rename_rejects_mismatched_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().to_path_buf(), Arc::new(MockPr0grammApiClient::new()));

        let old = image_ref("a.jpg");
        let new = MediaRef { id: 2, ..image_ref("b.jpg") };
        assert!(matches!(
            store.rename(old, new).await.unwrap_err(),
            MediaStoreError::IdMismatch { old: 1, new: 2 }
        ));
    }

    #[tokio::test]
    async fn resolve_prefers_fullsize_when_present() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("small.jpg"), b"small").unwrap();
        std::fs::create_dir_all(dir.path().join("full")).unwrap();
        std::fs::write(dir.path().join("full/large.jpg"), b"large").unwrap();
        let store = MediaStore::new(dir.path().to_path_buf(), Arc::new(MockPr0grammApiClient::new()));

        let media = MediaRef { fullsize: Some("large.jpg"), ..image_ref("small.jpg") };
        let path = store.resolve(media).await.unwrap();
        assert!(path.ends_with("full/large.jpg"));

        // Without the fullsize file on disk the store falls back.
        std::fs::remove_file(dir.path().join("full/large.jpg")).unwrap();
        let path = store.resolve(media).await.unwrap();
        assert!(path.ends_with("small.jpg"));
    }

    #[tokio::test]
    async fn read_missing_media_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().to_path_buf(), Arc::new(MockPr0grammApiClient::new()));

        assert!(matches!(
            store.read(image_ref("nope.jpg")).await.unwrap_err(),
            MediaStoreError::NotFound { .. }
        ));
    }
}
