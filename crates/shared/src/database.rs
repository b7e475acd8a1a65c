//! 参与者表连接池
//!
//! 仅在仓储后端为 Postgres 时建立。连接参数全部来自 `DatabaseConfig`，
//! 日志只输出主机、端口与库名，连接串中的账号密码不落日志。

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{Result, SharedError};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 建立连接池并执行一次探活查询，库不可达时启动直接失败
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)?;

        info!(
            host = options.get_host(),
            port = options.get_port(),
            database = options.get_database().unwrap_or("-"),
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            acquire_timeout_seconds = config.connect_timeout_seconds,
            idle_timeout_seconds = config.idle_timeout_seconds,
            "连接参与者数据库"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.health_check().await?;
        info!(pool_size = db.pool.size(), "参与者数据库连接池已就绪");

        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(SharedError::from)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("参与者数据库连接池已关闭");
    }
}
