//! # Feature Vector Table Migration
//!
//! One row per decoded frame: exactly one for still images, one per key
//! frame for videos. The `vec` column is a pgvector `vector(108)` holding
//! the HSV feature descriptor.
//!
//! The HNSW index is partial on `post_type = 'image'`: only image vectors
//! participate in approximate search. Video frames are stored but queried
//! only through exact scans.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("CREATE EXTENSION IF NOT EXISTS vector;")
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(FeatureVector::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(FeatureVector::PostId).big_integer().not_null())
                    // Frame ordinal within the post, starting at 0.
                    .col(ColumnDef::new(FeatureVector::Id).integer().not_null())
                    // Denormalized from post; predicate of the partial index.
                    .col(
                        ColumnDef::new(FeatureVector::PostType)
                            .custom(Alias::new("post_type"))
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(FeatureVector::Vec)
                            .custom(Alias::new("vector(108)"))
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(FeatureVector::PostId)
                            .col(FeatureVector::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_feature_vector_post_id")
                            .from(FeatureVector::Table, FeatureVector::PostId)
                            .to(Post::Table, Post::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Approximate nearest-neighbor index over image vectors.
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE INDEX feature_vector_post_type_image_vec_approx
                ON feature_vector
                USING hnsw (vec vector_l2_ops)
                WITH (m = 16, ef_construction = 64)
                WHERE post_type = 'image';
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(FeatureVector::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum FeatureVector {
    Table,
    PostId,
    Id,
    PostType,
    Vec,
}

#[derive(DeriveIden)]
enum Post {
    Table,
    Id,
}
