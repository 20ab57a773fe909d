//! Schema migrations.

use sea_orm_migration::prelude::*;

pub mod m20250105_000001_create_uploads_table;
pub mod m20250105_000002_create_upload_chunks_table;
pub mod m20250105_000003_create_files_table;
pub mod m20250106_000001_create_storage_usage_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250105_000001_create_uploads_table::Migration),
            Box::new(m20250105_000002_create_upload_chunks_table::Migration),
            Box::new(m20250105_000003_create_files_table::Migration),
            Box::new(m20250106_000001_create_storage_usage_table::Migration),
        ]
    }
}
