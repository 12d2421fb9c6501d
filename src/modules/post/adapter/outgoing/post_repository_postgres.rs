use std::sync::Arc;

use async_trait::async_trait;
use pgvector::Vector;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveEnum, ActiveValue::Set, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionError,
    TransactionTrait,
};
use sqlx::Row;
use tracing::debug;

use crate::modules::post::adapter::outgoing::sea_orm_entity::{feature_vector, post};
use crate::modules::post::application::ports::outgoing::post_repository::{
    FailedPost, IndexedPost, NewPost, PostRepository, PostUpdate, RepositoryError, SearchMatch,
};
use crate::modules::post::domain::entities::{flags_to_flagbits, Flag};
use crate::modules::post::adapter::outgoing::sea_orm_entity::post::{PostErrorStatus, PostType};

pub struct PostRepositoryPostgres {
    db: Arc<DatabaseConnection>,
}

impl PostRepositoryPostgres {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn flatten_tx_err(err: TransactionError<DbErr>) -> RepositoryError {
    match err {
        TransactionError::Connection(e) => RepositoryError::Database(e),
        TransactionError::Transaction(e) => RepositoryError::Database(e),
    }
}

fn new_post_active_model(new: &NewPost) -> post::ActiveModel {
    let p = &new.post;
    post::ActiveModel {
        id: Set(p.id),
        created: Set(p.created),
        image: Set(p.image.clone()),
        thumb: Set(p.thumb.clone()),
        fullsize: Set(p.fullsize.clone()),
        width: Set(p.width),
        height: Set(p.height),
        audio: Set(p.audio),
        source: Set(p.source.clone()),
        flags: Set(p.flags),
        username: Set(p.user.clone()),
        post_type: Set(p.post_type),
        error_status: Set(new.error_status),
        deleted: Set(false),
        features_indexed: Set(false),
    }
}

fn full_active_model(m: post::Model) -> post::ActiveModel {
    post::ActiveModel {
        id: Set(m.id),
        created: Set(m.created),
        image: Set(m.image),
        thumb: Set(m.thumb),
        fullsize: Set(m.fullsize),
        width: Set(m.width),
        height: Set(m.height),
        audio: Set(m.audio),
        source: Set(m.source),
        flags: Set(m.flags),
        username: Set(m.username),
        post_type: Set(m.post_type),
        error_status: Set(m.error_status),
        deleted: Set(m.deleted),
        features_indexed: Set(m.features_indexed),
    }
}

async fn insert_posts(txn: &DatabaseTransaction, posts: &[NewPost]) -> Result<(), DbErr> {
    if posts.is_empty() {
        return Ok(());
    }
    let models = posts.iter().map(new_post_active_model);
    let result = post::Entity::insert_many(models)
        .on_conflict(OnConflict::column(post::Column::Id).do_nothing().to_owned())
        .exec(txn)
        .await;
    match result {
        Ok(_) => Ok(()),
        // Every row already present; idempotent re-ingest is not an error.
        Err(DbErr::RecordNotInserted) => Ok(()),
        Err(e) => Err(e),
    }
}

fn post_from_row(row: &sqlx::postgres::PgRow) -> Result<post::Model, sqlx::Error> {
    let post_type: String = row.try_get("post_type")?;
    let error_status: Option<String> = row.try_get("error_status")?;
    let invalid = |field: &str, value: &str| sqlx::Error::ColumnDecode {
        index: field.to_string(),
        source: format!("invalid enum value: {value}").into(),
    };
    Ok(post::Model {
        id: row.try_get("id")?,
        created: row.try_get("created")?,
        image: row.try_get("image")?,
        thumb: row.try_get("thumb")?,
        fullsize: row.try_get("fullsize")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        audio: row.try_get("audio")?,
        source: row.try_get("source")?,
        flags: row.try_get("flags")?,
        username: row.try_get("username")?,
        post_type: post_type
            .parse()
            .map_err(|_| invalid("post_type", &post_type))?,
        error_status: error_status
            .as_deref()
            .map(|v| match v {
                "no_media_found" => Ok(PostErrorStatus::NoMediaFound),
                "media_broken" => Ok(PostErrorStatus::MediaBroken),
                other => Err(invalid("error_status", other)),
            })
            .transpose()?,
        deleted: row.try_get("deleted")?,
        features_indexed: row.try_get("features_indexed")?,
    })
}

#[async_trait]
impl PostRepository for PostRepositoryPostgres {
    async fn latest_post_id(&self) -> Result<i64, RepositoryError> {
        let latest = post::Entity::find()
            .order_by_desc(post::Column::Id)
            .one(&*self.db)
            .await?;
        Ok(latest.map(|p| p.id).unwrap_or(0))
    }

    async fn latest_post_id_with_features(&self) -> Result<i64, RepositoryError> {
        let latest = post::Entity::find()
            .filter(post::Column::FeaturesIndexed.eq(true))
            .order_by_desc(post::Column::Id)
            .one(&*self.db)
            .await?;
        Ok(latest.map(|p| p.id).unwrap_or(0))
    }

    async fn count(&self) -> Result<u64, RepositoryError> {
        Ok(post::Entity::find().count(&*self.db).await?)
    }

    async fn count_with_features(&self) -> Result<u64, RepositoryError> {
        Ok(post::Entity::find()
            .filter(post::Column::FeaturesIndexed.eq(true))
            .count(&*self.db)
            .await?)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<post::Model>, RepositoryError> {
        Ok(post::Entity::find_by_id(id).one(&*self.db).await?)
    }

    async fn get_by_ids(&self, ids: Vec<i64>) -> Result<Vec<post::Model>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(post::Entity::find()
            .filter(post::Column::Id.is_in(ids))
            .order_by_asc(post::Column::Id)
            .all(&*self.db)
            .await?)
    }

    async fn posts_in_range(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<post::Model>, RepositoryError> {
        Ok(post::Entity::find()
            .filter(post::Column::Id.gte(start))
            .filter(post::Column::Id.lte(end))
            .order_by_asc(post::Column::Id)
            .all(&*self.db)
            .await?)
    }

    async fn posts(
        &self,
        post_type: Option<PostType>,
        after_id: i64,
        limit: u64,
    ) -> Result<Vec<post::Model>, RepositoryError> {
        let mut query = post::Entity::find().filter(post::Column::Id.gt(after_id));
        if let Some(post_type) = post_type {
            query = query.filter(post::Column::PostType.eq(post_type));
        }
        Ok(query
            .order_by_asc(post::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    async fn posts_missing_features(
        &self,
        post_type: Option<PostType>,
        limit: u64,
    ) -> Result<Vec<post::Model>, RepositoryError> {
        let mut query = post::Entity::find()
            .filter(post::Column::ErrorStatus.is_null())
            .filter(post::Column::Deleted.eq(false))
            .filter(post::Column::FeaturesIndexed.eq(false));
        if let Some(post_type) = post_type {
            query = query.filter(post::Column::PostType.eq(post_type));
        }
        Ok(query
            .order_by_asc(post::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    async fn save_ingested(&self, posts: Vec<NewPost>) -> Result<(), RepositoryError> {
        if posts.is_empty() {
            return Ok(());
        }
        debug!(count = posts.len(), "saving ingested posts");
        self.db
            .transaction::<_, (), DbErr>(|txn| {
                Box::pin(async move { insert_posts(txn, &posts).await })
            })
            .await
            .map_err(flatten_tx_err)
    }

    async fn apply_reconcile(
        &self,
        inserts: Vec<NewPost>,
        updates: Vec<PostUpdate>,
    ) -> Result<(), RepositoryError> {
        if inserts.is_empty() && updates.is_empty() {
            return Ok(());
        }
        debug!(inserts = inserts.len(), updates = updates.len(), "applying reconcile diff");
        self.db
            .transaction::<_, (), DbErr>(|txn| {
                Box::pin(async move {
                    insert_posts(txn, &inserts).await?;
                    for update in updates {
                        if update.clear_features {
                            feature_vector::Entity::delete_many()
                                .filter(feature_vector::Column::PostId.eq(update.model.id))
                                .exec(txn)
                                .await?;
                        }
                        post::Entity::update(full_active_model(update.model))
                            .exec(txn)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await
            .map_err(flatten_tx_err)
    }

    async fn mark_indexed(
        &self,
        indexed: Vec<IndexedPost>,
        failed: Vec<FailedPost>,
    ) -> Result<(), RepositoryError> {
        if indexed.is_empty() && failed.is_empty() {
            return Ok(());
        }
        debug!(indexed = indexed.len(), failed = failed.len(), "persisting feature batch");
        // The vector column only exists on the sqlx/pgvector side, so this
        // transaction runs on the underlying pool.
        let pool = self.db.get_postgres_connection_pool();
        let mut tx = pool.begin().await.map_err(RepositoryError::Sqlx)?;

        for post in &failed {
            sqlx::query("DELETE FROM feature_vector WHERE post_id = $1")
                .bind(post.post_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "UPDATE post SET error_status = $1::post_error_status, \
                 features_indexed = false WHERE id = $2",
            )
            .bind(post.error_status.to_value())
            .bind(post.post_id)
            .execute(&mut *tx)
            .await?;
        }

        for post in &indexed {
            sqlx::query("DELETE FROM feature_vector WHERE post_id = $1")
                .bind(post.post_id)
                .execute(&mut *tx)
                .await?;
            for (frame_id, vec) in post.vectors.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO feature_vector (post_id, id, post_type, vec) \
                     VALUES ($1, $2, $3::post_type, $4)",
                )
                .bind(post.post_id)
                .bind(frame_id as i32)
                .bind(post.post_type.to_value())
                .bind(Vector::from(vec.to_vec()))
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                "UPDATE post SET features_indexed = true, error_status = null WHERE id = $1",
            )
            .bind(post.post_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.map_err(RepositoryError::Sqlx)
    }

    async fn search(
        &self,
        post_type: PostType,
        query: Vec<f32>,
        flags: Option<Vec<Flag>>,
        exact: bool,
        ef_search: Option<u32>,
        limit: u64,
    ) -> Result<Vec<SearchMatch>, RepositoryError> {
        let pool = self.db.get_postgres_connection_pool();
        let mut tx = pool.begin().await.map_err(RepositoryError::Sqlx)?;

        if exact {
            // Forces a linear scan; used for recall evaluation and tiny
            // corpora.
            sqlx::query("SET LOCAL enable_indexscan = off")
                .execute(&mut *tx)
                .await?;
        }
        if let Some(ef_search) = ef_search {
            sqlx::query(&format!("SET LOCAL hnsw.ef_search = {ef_search}"))
                .execute(&mut *tx)
                .await?;
        }

        // The largest distance between two feature vectors is sqrt(108),
        // since each dimension is within 0..1. Dividing by it and
        // subtracting from 1 turns the distance into a similarity.
        let mut sql = String::from(
            "SELECT (1 - ((fv.vec <-> $1) / sqrt(108.0)))::float4 AS score, \
             p.id, p.created, p.image, p.thumb, p.fullsize, p.width, p.height, \
             p.audio, p.source, p.flags, p.username, \
             p.post_type::text AS post_type, p.error_status::text AS error_status, \
             p.deleted, p.features_indexed \
             FROM feature_vector fv \
             JOIN post p ON p.id = fv.post_id \
             WHERE fv.post_type = $2::post_type",
        );
        if flags.is_some() {
            sql.push_str(" AND (p.flags & $4) > 0");
        }
        sql.push_str(" ORDER BY fv.vec <-> $1 LIMIT $3");

        let vector = Vector::from(query);
        let mut q = sqlx::query(&sql)
            .bind(&vector)
            .bind(post_type.to_value())
            .bind(limit as i64);
        if let Some(flags) = &flags {
            q = q.bind(flags_to_flagbits(flags));
        }

        let rows = q.fetch_all(&mut *tx).await?;
        tx.commit().await.map_err(RepositoryError::Sqlx)?;

        rows.iter()
            .map(|row| {
                Ok(SearchMatch {
                    score: row.try_get::<f32, _>("score")?,
                    post: post_from_row(row)?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(RepositoryError::Sqlx)
    }
}
