//! Tunnel sessions

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TunnelSession::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TunnelSession::Id)
                            .string_len(36)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TunnelSession::AgentId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(TunnelSession::LocalPort).integer().not_null())
                    .col(ColumnDef::new(TunnelSession::ProcessId).integer())
                    .col(ColumnDef::new(TunnelSession::ProxyBindingId).string_len(64))
                    .col(
                        ColumnDef::new(TunnelSession::Status)
                            .string_len(16)
                            .not_null()
                            .default("requested"),
                    )
                    .col(ColumnDef::new(TunnelSession::FailureReason).text())
                    .col(
                        ColumnDef::new(TunnelSession::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TunnelSession::LastActivityAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(TunnelSession::UpdatedAt)
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
                    .name("idx_tunnel_sessions_agent_status")
                    .table(TunnelSession::Table)
                    .col(TunnelSession::AgentId)
                    .col(TunnelSession::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_sessions_status_port")
                    .table(TunnelSession::Table)
                    .col(TunnelSession::Status)
                    .col(TunnelSession::LocalPort)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TunnelSession::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TunnelSession {
    #[sea_orm(iden = "tunnel_sessions")]
    Table,
    Id,
    AgentId,
    LocalPort,
    ProcessId,
    ProxyBindingId,
    Status,
    FailureReason,
    CreatedAt,
    LastActivityAt,
    UpdatedAt,
}
