use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250105_000001_create_uploads_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Uploads::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Uploads::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Uploads::UserId).uuid().not_null())
                    .col(ColumnDef::new(Uploads::Filename).string().not_null())
                    .col(ColumnDef::new(Uploads::MimeType).string().not_null())
                    .col(ColumnDef::new(Uploads::TargetPath).string().not_null())
                    .col(ColumnDef::new(Uploads::Strategy).string_len(16).not_null())
                    .col(ColumnDef::new(Uploads::Status).string_len(16).not_null())
                    .col(ColumnDef::new(Uploads::ChunkSizeBytes).big_integer().not_null())
                    .col(ColumnDef::new(Uploads::TotalChunks).integer().not_null())
                    .col(ColumnDef::new(Uploads::TotalSizeBytes).big_integer().not_null())
                    .col(
                        ColumnDef::new(Uploads::ReceivedChunks)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Uploads::ReceivedBytes)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Uploads::RepoName).string().not_null())
                    .col(ColumnDef::new(Uploads::ManifestPath).string())
                    .col(ColumnDef::new(Uploads::ErrorMessage).text())
                    .col(ColumnDef::new(Uploads::FileId).uuid())
                    .col(
                        ColumnDef::new(Uploads::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Uploads::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Uploads::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Uploads::CompletedAt).timestamp_with_time_zone())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-uploads-user_id")
                    .table(Uploads::Table)
                    .col(Uploads::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-uploads-expires_at")
                    .table(Uploads::Table)
                    .col(Uploads::ExpiresAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Uploads::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub(crate) enum Uploads {
    Table,
    Id,
    UserId,
    Filename,
    MimeType,
    TargetPath,
    Strategy,
    Status,
    ChunkSizeBytes,
    TotalChunks,
    TotalSizeBytes,
    ReceivedChunks,
    ReceivedBytes,
    RepoName,
    ManifestPath,
    ErrorMessage,
    FileId,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
    CompletedAt,
}
