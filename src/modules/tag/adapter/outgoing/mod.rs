pub mod sea_orm_entity;
pub mod tag_repository_postgres;
