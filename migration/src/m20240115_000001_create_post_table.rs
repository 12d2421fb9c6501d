//! # Post Table Migration
//!
//! One row per upstream post. Ids are assigned by pr0gramm and are monotonic
//! but not dense; rows are never deleted, only marked `deleted` when the
//! post vanishes upstream.
//!
//! The composite index on (error_status, post_type, deleted,
//! features_indexed) backs the feature worker's scan for unindexed posts.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // =====================================================
        // Create enum types
        // =====================================================
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                DO $$
                BEGIN
                    IF NOT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'post_type') THEN
                        CREATE TYPE post_type AS ENUM ('image', 'animated', 'video', 'unknown');
                    END IF;
                END$$;
                "#,
            )
            .await?;
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                DO $$
                BEGIN
                    IF NOT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'post_error_status') THEN
                        CREATE TYPE post_error_status AS ENUM ('no_media_found', 'media_broken');
                    END IF;
                END$$;
                "#,
            )
            .await?;

        // =====================================================
        // Create post table
        // =====================================================
        manager
            .create_table(
                Table::create()
                    .table(Post::Table)
                    .if_not_exists()
                    // Upstream id, never generated locally.
                    .col(ColumnDef::new(Post::Id).big_integer().not_null().primary_key())
                    .col(
                        ColumnDef::new(Post::Created)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    // Media paths on the pr0gramm CDN hosts.
                    .col(ColumnDef::new(Post::Image).string_len(256).not_null())
                    .col(ColumnDef::new(Post::Thumb).string_len(256))
                    .col(ColumnDef::new(Post::Fullsize).string_len(256))
                    .col(ColumnDef::new(Post::Width).integer().not_null())
                    .col(ColumnDef::new(Post::Height).integer().not_null())
                    .col(ColumnDef::new(Post::Audio).boolean().not_null())
                    .col(ColumnDef::new(Post::Source).string_len(512))
                    // Bitset: bit 0 SFW, bit 1 NSFW, bit 2 NSFL, bit 3 NSFP,
                    // bit 4 POL.
                    .col(ColumnDef::new(Post::Flags).integer().not_null())
                    .col(ColumnDef::new(Post::Username).string_len(32).not_null())
                    .col(
                        ColumnDef::new(Post::PostType)
                            .custom(Alias::new("post_type"))
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Post::ErrorStatus)
                            .custom(Alias::new("post_error_status")),
                    )
                    .col(
                        ColumnDef::new(Post::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Post::FeaturesIndexed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .to_owned(),
            )
            .await?;

        // =====================================================
        // Indexes
        // =====================================================
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE INDEX idx_post_image ON post (image);
                CREATE INDEX idx_post_post_type ON post (post_type);
                CREATE INDEX idx_post_error_status ON post (error_status);
                CREATE INDEX idx_post_features_indexed ON post (features_indexed);
                "#,
            )
            .await?;

        // Fast lookup of posts still waiting for feature extraction.
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE INDEX post_error_status_type_deleted_features_indexed_index
                ON post (error_status, post_type, deleted, features_indexed);
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Post::Table).to_owned())
            .await?;
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                DROP TYPE IF EXISTS post_error_status;
                DROP TYPE IF EXISTS post_type;
                "#,
            )
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Post {
    Table,
    Id,
    Created,
    Image,
    Thumb,
    Fullsize,
    Width,
    Height,
    Audio,
    Source,
    Flags,
    Username,
    PostType,
    ErrorStatus,
    Deleted,
    FeaturesIndexed,
}
