use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, DatabaseConnection, DbErr, EntityTrait, QueryOrder, TransactionTrait,
};

use super::sea_orm_entity as tag;
use crate::modules::post::application::ports::outgoing::post_repository::RepositoryError;
use crate::modules::pr0gramm::dto::UpstreamTag;
use crate::modules::tag::application::ports::outgoing::tag_repository::TagRepository;

pub struct TagRepositoryPostgres {
    db: Arc<DatabaseConnection>,
}

impl TagRepositoryPostgres {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TagRepository for TagRepositoryPostgres {
    async fn latest_tag_id(&self) -> Result<i64, RepositoryError> {
        let latest = tag::Entity::find()
            .order_by_desc(tag::Column::Id)
            .one(&*self.db)
            .await?;
        Ok(latest.map(|t| t.id).unwrap_or(0))
    }

    async fn add_all(&self, tags: Vec<UpstreamTag>) -> Result<(), RepositoryError> {
        if tags.is_empty() {
            return Ok(());
        }
        self.db
            .transaction::<_, (), DbErr>(|txn| {
                Box::pin(async move {
                    let models = tags.into_iter().map(|t| tag::ActiveModel {
                        id: Set(t.id),
                        post_id: Set(t.post_id),
                        tag: Set(t.tag),
                        up: Set(t.up),
                        down: Set(t.down),
                        confidence: Set(t.confidence),
                    });
                    let result = tag::Entity::insert_many(models)
                        .on_conflict(OnConflict::column(tag::Column::Id).do_nothing().to_owned())
                        .exec(txn)
                        .await;
                    match result {
                        Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
                        Err(e) => Err(e),
                    }
                })
            })
            .await
            .map_err(|e| match e {
                sea_orm::TransactionError::Connection(e) => RepositoryError::Database(e),
                sea_orm::TransactionError::Transaction(e) => RepositoryError::Database(e),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[tokio::test]
    async fn latest_tag_id_defaults_to_zero() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<tag::Model>::new()])
            .into_connection();
        let repo = TagRepositoryPostgres::new(Arc::new(db));
        assert_eq!(repo.latest_tag_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn add_all_inserts_in_one_transaction() {
        // Postgres inserts report back via RETURNING, so the mock needs a
        // query result as well as an exec result.
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([vec![tag::Model {
                id: 1,
                post_id: 10,
                tag: "katze".to_string(),
                up: 3,
                down: 1,
                confidence: 0.8,
            }]])
            .append_exec_results([MockExecResult { last_insert_id: 1, rows_affected: 1 }])
            .into_connection();
        let repo = TagRepositoryPostgres::new(Arc::new(db));
        repo.add_all(vec![UpstreamTag {
            id: 1,
            post_id: 10,
            tag: "katze".to_string(),
            up: 3,
            down: 1,
            confidence: 0.8,
        }])
        .await
        .unwrap();
    }
}
