use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Tag::Table)
                    .if_not_exists()
                    // Upstream tag id.
                    .col(ColumnDef::new(Tag::Id).big_integer().not_null().primary_key())
                    .col(ColumnDef::new(Tag::PostId).big_integer().not_null())
                    .col(ColumnDef::new(Tag::Tag).string_len(256).not_null())
                    .col(ColumnDef::new(Tag::Up).integer().not_null())
                    .col(ColumnDef::new(Tag::Down).integer().not_null())
                    .col(ColumnDef::new(Tag::Confidence).float().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tag_post_id")
                            .from(Tag::Table, Tag::PostId)
                            .to(Post::Table, Post::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE INDEX idx_tag_post_id ON tag (post_id);
                CREATE INDEX idx_tag_tag ON tag (tag);
                CREATE INDEX idx_tag_confidence ON tag (confidence);
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tag::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Tag {
    Table,
    Id,
    PostId,
    Tag,
    Up,
    Down,
    Confidence,
}

#[derive(DeriveIden)]
enum Post {
    Table,
    Id,
}
