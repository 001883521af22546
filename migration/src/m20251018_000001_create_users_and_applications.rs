use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Users are keyed by the opaque identity handed to us by the front-end
        manager
            .create_table(
                Table::create()
                    .table(Users::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Users::Id).string().not_null().primary_key())
                    .col(
                        ColumnDef::new(Users::Credits)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Users::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Users::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Applications::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Applications::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Applications::OwnerId).string().not_null())
                    .col(ColumnDef::new(Applications::Name).string().not_null())
                    .col(
                        ColumnDef::new(Applications::RepositoryUrl)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Applications::MemoryMb).integer().not_null())
                    .col(
                        ColumnDef::new(Applications::RuntimeName)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Applications::RuntimeKind).string_len(16).null())
                    .col(
                        ColumnDef::new(Applications::RuntimeHandle)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(Applications::WorkspacePath)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Applications::LogPath).string().null())
                    .col(
                        ColumnDef::new(Applications::CreditDeficit)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Applications::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Applications::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Applications::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_applications_owner")
                            .from(Applications::Table, Applications::OwnerId)
                            .to(Users::Table, Users::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_applications_runtime_name")
                    .table(Applications::Table)
                    .col(Applications::RuntimeName)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Lookups are always (owner, name) or (owner, status)
        manager
            .create_index(
                Index::create()
                    .name("idx_applications_owner_name")
                    .table(Applications::Table)
                    .col(Applications::OwnerId)
                    .col(Applications::Name)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_applications_owner_status")
                    .table(Applications::Table)
                    .col(Applications::OwnerId)
                    .col(Applications::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Applications::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Users::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Users {
    Table,
    Id,
    Credits,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Applications {
    Table,
    Id,
    OwnerId,
    Name,
    RepositoryUrl,
    MemoryMb,
    RuntimeName,
    RuntimeKind,
    RuntimeHandle,
    WorkspacePath,
    LogPath,
    CreditDeficit,
    Status,
    CreatedAt,
    UpdatedAt,
}
