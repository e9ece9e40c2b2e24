use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 创建 client_traffic 表（入站内客户端流量）
        manager
            .create_table(
                Table::create()
                    .table(ClientTraffic::Table)
                    .if_not_exists()
                    .col(big_integer(ClientTraffic::Id).auto_increment().primary_key())
                    .col(big_integer(ClientTraffic::InboundId))
                    .col(string(ClientTraffic::Email))
                    .col(boolean(ClientTraffic::Enable).default(true))
                    .col(big_integer(ClientTraffic::Up).default(0))
                    .col(big_integer(ClientTraffic::Down).default(0))
                    .col(big_integer(ClientTraffic::Total).default(0))
                    .col(big_integer(ClientTraffic::TrafficLimit).default(0))
                    .col(big_integer(ClientTraffic::ExpiryTime).default(0))
                    .col(integer(ClientTraffic::Reset).default(0))
                    .col(big_integer(ClientTraffic::LastOnline).default(0))
                    .col(timestamp(ClientTraffic::CreatedAt))
                    .col(timestamp(ClientTraffic::UpdatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_client_traffic_inbound")
                            .from(ClientTraffic::Table, ClientTraffic::InboundId)
                            .to(Inbound::Table, Inbound::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_client_traffic_inbound_email ON client_traffic (inbound_id, email COLLATE NOCASE)",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ClientTraffic::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum ClientTraffic {
    Table,
    Id,
    InboundId,
    Email,
    Enable,
    Up,
    Down,
    Total,
    TrafficLimit,
    ExpiryTime,
    Reset,
    LastOnline,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Inbound {
    Table,
    Id,
}
