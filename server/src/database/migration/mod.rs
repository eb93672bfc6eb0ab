//! Database migrations.

pub use sea_orm_migration::*;

mod m20260101_000001_create_tables;
mod m20260101_000002_create_activity_record_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260101_000001_create_tables::Migration),
            Box::new(m20260101_000002_create_activity_record_table::Migration),
        ]
    }
}
