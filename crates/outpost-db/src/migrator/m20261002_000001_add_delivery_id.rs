//! Record which poll claimed each queued task
//!
//! SQLite only accepts one column per ALTER TABLE, so each table gets its own statement.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .alter_table(
                Table::alter()
                    .table(Command::Table)
                    .add_column(ColumnDef::new(Command::DeliveryId).string_len(36).null())
                    .to_owned(),
            )
            .await?;

        manager
            .alter_table(
                Table::alter()
                    .table(HttpRequest::Table)
                    .add_column(
                        ColumnDef::new(HttpRequest::DeliveryId)
                            .string_len(36)
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_commands_delivery_id")
                    .table(Command::Table)
                    .col(Command::DeliveryId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_http_requests_delivery_id")
                    .table(HttpRequest::Table)
                    .col(HttpRequest::DeliveryId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_http_requests_delivery_id")
                    .table(HttpRequest::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_commands_delivery_id")
                    .table(Command::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .alter_table(
                Table::alter()
                    .table(HttpRequest::Table)
                    .drop_column(HttpRequest::DeliveryId)
                    .to_owned(),
            )
            .await?;
        manager
            .alter_table(
                Table::alter()
                    .table(Command::Table)
                    .drop_column(Command::DeliveryId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Command {
    #[sea_orm(iden = "commands")]
    Table,
    DeliveryId,
}

#[derive(DeriveIden)]
enum HttpRequest {
    #[sea_orm(iden = "http_requests")]
    Table,
    DeliveryId,
}
