use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::modules::post::application::services::post_service::IngestError;
use crate::modules::pr0gramm::api::{Pr0grammApiClient, TagStream};
use crate::modules::tag::application::ports::outgoing::tag_repository::TagRepository;

const TAG_BATCH_SIZE: usize = 1000;

/// Keeps the local tag table caught up with the upstream tag feed.
pub struct TagService {
    api: Arc<dyn Pr0grammApiClient>,
    tags: Arc<dyn TagRepository>,
}

impl TagService {
    pub fn new(api: Arc<dyn Pr0grammApiClient>, tags: Arc<dyn TagRepository>) -> Self {
        TagService { api, tags }
    }

    pub async fn update_tags(&self, cancel: &CancellationToken) -> Result<(), IngestError> {
        let latest_tag = self.tags.latest_tag_id().await?;
        info!(latest_tag, "starting tag update");

        let mut stream = TagStream::new(self.api.clone(), latest_tag);
        let mut counter = 0usize;
        loop {
            if cancel.is_cancelled() {
                info!("tag update cancelled");
                return Ok(());
            }
            let batch = stream.next_batch(TAG_BATCH_SIZE).await?;
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), "saving tags");
            counter += batch.len();
            self.tags.add_all(batch).await?;
        }

        info!(added = counter, "finished updating tags");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    use crate::modules::pr0gramm::api::MockPr0grammApiClient;
    use crate::modules::pr0gramm::dto::UpstreamTag;
    use crate::modules::tag::application::ports::outgoing::tag_repository::MockTagRepository;

    fn tag(id: i64) -> UpstreamTag {
        UpstreamTag {
            id,
            post_id: id * 10,
            tag: format!("tag-{id}"),
            up: 1,
            down: 0,
            confidence: 0.5,
        }
    }

    #[tokio::test]
    async fn pulls_tags_from_the_latest_known_id() {
        let mut api = MockPr0grammApiClient::new();
        api.expect_tags_after()
            .with(eq(41))
            .times(1)
            .returning(|_| Ok(vec![tag(42), tag(43)]));
        api.expect_tags_after()
            .with(eq(43))
            .times(1)
            .returning(|_| Ok(vec![]));

        let mut tags = MockTagRepository::new();
        tags.expect_latest_tag_id().returning(|| Ok(41));
        tags.expect_add_all()
            .withf(|batch| batch.len() == 2 && batch[0].id == 42)
            .times(1)
            .returning(|_| Ok(()));

        let service = TagService::new(Arc::new(api), Arc::new(tags));
        service.update_tags(&CancellationToken::new()).await.unwrap();
    }
}
