use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::prelude::*;
use std::fs::create_dir_all;
use std::path::Path;
use std::time::Duration;

mod m20261001_000001_init;
mod m20261001_000002_create_client_traffic;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000001_init::Migration),
            Box::new(m20261001_000002_create_client_traffic::Migration),
        ]
    }
}

/// 打开 SQLite 数据库文件，不存在时自动创建
pub async fn init_sqlite(db_path: &str, acquire_timeout: Duration) -> anyhow::Result<DatabaseConnection> {
    let path = Path::new(db_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            create_dir_all(parent)?;
        }
    }

    let mut opt = ConnectOptions::new(format!("sqlite://{}?mode=rwc", db_path));
    opt.max_connections(8)
        .acquire_timeout(acquire_timeout)
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    Ok(db)
}

/// 内存数据库，仅单连接，测试使用
pub async fn init_memory() -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new("sqlite::memory:");
    opt.max_connections(1)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .sqlx_logging(false);

    let db = Database::connect(opt).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}
