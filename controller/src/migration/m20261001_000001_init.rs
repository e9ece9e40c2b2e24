use sea_orm_migration::prelude::*;
use sea_orm_migration::schema::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // 创建 inbound 表
        manager
            .create_table(
                Table::create()
                    .table(Inbound::Table)
                    .if_not_exists()
                    .col(big_integer(Inbound::Id).auto_increment().primary_key())
                    .col(big_integer(Inbound::UserId))
                    .col(big_integer(Inbound::Up).default(0))
                    .col(big_integer(Inbound::Down).default(0))
                    .col(big_integer(Inbound::Total).default(0))
                    .col(big_integer(Inbound::AllTime).default(0))
                    .col(string(Inbound::Remark).default(""))
                    .col(boolean(Inbound::Enable).default(true))
                    .col(big_integer_null(Inbound::ExpiryTime))
                    .col(big_integer_null(Inbound::TrafficLimit))
                    .col(string(Inbound::Listen).default(""))
                    .col(integer(Inbound::Port))
                    .col(string(Inbound::Protocol))
                    .col(text(Inbound::Settings))
                    .col(text(Inbound::StreamSettings))
                    .col(string(Inbound::Tag))
                    .col(text(Inbound::Sniffing))
                    .col(timestamp(Inbound::CreatedAt))
                    .col(timestamp(Inbound::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_inbound_user_id")
                    .table(Inbound::Table)
                    .col(Inbound::UserId)
                    .to_owned(),
            )
            .await?;

        // 创建 outbound_traffic 表
        manager
            .create_table(
                Table::create()
                    .table(OutboundTraffic::Table)
                    .if_not_exists()
                    .col(big_integer(OutboundTraffic::Id).auto_increment().primary_key())
                    .col(string(OutboundTraffic::Tag))
                    .col(big_integer(OutboundTraffic::Up).default(0))
                    .col(big_integer(OutboundTraffic::Down).default(0))
                    .col(big_integer(OutboundTraffic::Total).default(0))
                    .to_owned(),
            )
            .await?;

        // tag 比较不区分大小写，端口只在启用的入站之间唯一
        let db = manager.get_connection();
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_inbound_tag ON inbound (tag COLLATE NOCASE)",
        )
        .await?;
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_inbound_enabled_port ON inbound (port) WHERE enable = 1",
        )
        .await?;
        db.execute_unprepared(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_outbound_traffic_tag ON outbound_traffic (tag COLLATE NOCASE)",
        )
        .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OutboundTraffic::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Inbound::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Inbound {
    Table,
    Id,
    UserId,
    Up,
    Down,
    Total,
    AllTime,
    Remark,
    Enable,
    ExpiryTime,
    TrafficLimit,
    Listen,
    Port,
    Protocol,
    Settings,
    StreamSettings,
    Tag,
    Sniffing,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum OutboundTraffic {
    Table,
    Id,
    Tag,
    Up,
    Down,
    Total,
}
