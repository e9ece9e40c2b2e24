//! 数据库访问封装
//!
//! 所有带读-改-写步骤的写操作都先获取进程内写锁再开启事务，
//! 保证同一时间只有一个写事务；写锁在控制通道调用之前释放。

use sea_orm::{DatabaseConnection, DatabaseTransaction, DbErr, TransactionTrait};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::error::{ServiceError, ServiceResult};

pub struct Datastore {
    conn: DatabaseConnection,
    write_gate: Mutex<()>,
    op_timeout: Duration,
}

impl Datastore {
    pub fn new(conn: DatabaseConnection, op_timeout: Duration) -> Self {
        Self {
            conn,
            write_gate: Mutex::new(()),
            op_timeout,
        }
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// 带超时的只读查询
    pub async fn read<T, F>(&self, fut: F) -> ServiceResult<T>
    where
        F: Future<Output = Result<T, DbErr>>,
    {
        bounded(self.op_timeout, "数据库查询", fut).await
    }

    /// 获取写锁并开启事务
    pub async fn begin_write(&self) -> ServiceResult<WriteTxn<'_>> {
        let guard = tokio::time::timeout(self.op_timeout, self.write_gate.lock())
            .await
            .map_err(|_| {
                warn!("⚠️ 等待数据库写锁超时");
                ServiceError::Persistence("等待数据库写锁超时".to_string())
            })?;
        let txn = bounded(self.op_timeout, "开启事务", self.conn.begin()).await?;
        Ok(WriteTxn {
            _guard: guard,
            txn,
            op_timeout: self.op_timeout,
        })
    }
}

/// 持有写锁的事务，未提交即丢弃时自动回滚
pub struct WriteTxn<'a> {
    _guard: MutexGuard<'a, ()>,
    txn: DatabaseTransaction,
    op_timeout: Duration,
}

impl WriteTxn<'_> {
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.txn
    }

    pub async fn commit(self) -> ServiceResult<()> {
        bounded(self.op_timeout, "提交事务", self.txn.commit()).await
    }
}

async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> ServiceResult<T>
where
    F: Future<Output = Result<T, DbErr>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(ServiceError::from),
        Err(_) => Err(ServiceError::Persistence(format!("{}超时", what))),
    }
}
