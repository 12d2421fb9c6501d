use sea_orm::entity::prelude::*;

/// A user-assigned tag. Insert-only; used for filtering and display.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "tag")]
pub struct Model {
    /// Tag id, assigned upstream.
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,

    pub post_id: i64,

    pub tag: String,
    pub up: i32,
    pub down: i32,
    pub confidence: f32,
}

#[derive(Copy, Clone, Debug, EnumIter)]
pub enum Relation {
    Post,
}

impl RelationTrait for Relation {
    fn def(&self) -> RelationDef {
        match self {
            Self::Post => Entity::belongs_to(
                crate::modules::post::adapter::outgoing::sea_orm_entity::post::Entity,
            )
            .from(Column::PostId)
            .to(crate::modules::post::adapter::outgoing::sea_orm_entity::post::Column::Id)
            .into(),
        }
    }
}

impl ActiveModelBehavior for ActiveModel {}
