//! Command and HTTP request queues

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. commands
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Command::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Command::Id)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Command::TargetAgentId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Command::Command).text().not_null())
                    .col(
                        ColumnDef::new(Command::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(Command::Output).text())
                    .col(
                        ColumnDef::new(Command::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Command::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_commands_agent_status")
                    .table(Command::Table)
                    .col(Command::TargetAgentId)
                    .col(Command::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_commands_status_updated_at")
                    .table(Command::Table)
                    .col(Command::Status)
                    .col(Command::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. http_requests
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(HttpRequest::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(HttpRequest::Id)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(HttpRequest::TargetAgentId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(HttpRequest::Url).text().not_null())
                    .col(
                        ColumnDef::new(HttpRequest::Method)
                            .string_len(16)
                            .not_null()
                            .default("GET"),
                    )
                    .col(
                        ColumnDef::new(HttpRequest::Status)
                            .string_len(16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(HttpRequest::Response).text())
                    .col(
                        ColumnDef::new(HttpRequest::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(HttpRequest::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_http_requests_agent_status")
                    .table(HttpRequest::Table)
                    .col(HttpRequest::TargetAgentId)
                    .col(HttpRequest::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_http_requests_status_updated_at")
                    .table(HttpRequest::Table)
                    .col(HttpRequest::Status)
                    .col(HttpRequest::UpdatedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(HttpRequest::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Command::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Command {
    #[sea_orm(iden = "commands")]
    Table,
    Id,
    TargetAgentId,
    Command,
    Status,
    Output,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum HttpRequest {
    #[sea_orm(iden = "http_requests")]
    Table,
    Id,
    TargetAgentId,
    Url,
    Method,
    Status,
    Response,
    CreatedAt,
    UpdatedAt,
}
