pub use sea_orm_migration::prelude::*;

mod m20240115_000001_create_post_table;
mod m20240115_000002_create_feature_vector_table;
mod m20240115_000003_create_tag_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240115_000001_create_post_table::Migration),
            Box::new(m20240115_000002_create_feature_vector_table::Migration),
            Box::new(m20240115_000003_create_tag_table::Migration),
        ]
    }
}
