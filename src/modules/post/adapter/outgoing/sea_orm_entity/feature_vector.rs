use sea_orm::entity::prelude::*;

use super::post::PostType;

/// One feature vector per decoded frame. Still images carry exactly one row
/// (id 0), videos one row per extracted keyframe.
///
/// The `vec` column (`vector(108)`, pgvector) is intentionally absent from
/// this entity: all reads and writes of the vector itself go through the
/// sqlx/pgvector query path in the repository. SeaORM only handles the key
/// columns for deletes and counts.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "feature_vector")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub post_id: i64,

    /// Frame ordinal within the post, starting at 0.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i32,

    /// Denormalized from `post`. Predicate of the partial HNSW index.
    pub post_type: PostType,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Post,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Post => Entity::belongs_to(super::post::Entity)
                .from(Column::PostId)
                .to(super::post::Column::Id)
                .into(),
        }
    }
}

impl Related<super::post::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Post.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
