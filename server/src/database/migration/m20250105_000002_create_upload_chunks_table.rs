use sea_orm_migration::prelude::*;

use super::m20250105_000001_create_uploads_table::Uploads;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250105_000002_create_upload_chunks_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(UploadChunks::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(UploadChunks::UploadId).uuid().not_null())
                    .col(ColumnDef::new(UploadChunks::ChunkIndex).integer().not_null())
                    .col(
                        ColumnDef::new(UploadChunks::SizeBytes)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(UploadChunks::Checksum).string().not_null())
                    .col(ColumnDef::new(UploadChunks::ClientChecksum).string())
                    .col(ColumnDef::new(UploadChunks::ScratchPath).string().not_null())
                    .col(
                        ColumnDef::new(UploadChunks::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(UploadChunks::UploadId)
                            .col(UploadChunks::ChunkIndex),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-upload_chunks-upload_id")
                            .from(UploadChunks::Table, UploadChunks::UploadId)
                            .to(Uploads::Table, Uploads::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(UploadChunks::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum UploadChunks {
    Table,
    UploadId,
    ChunkIndex,
    SizeBytes,
    Checksum,
    ClientChecksum,
    ScratchPath,
    ReceivedAt,
}
