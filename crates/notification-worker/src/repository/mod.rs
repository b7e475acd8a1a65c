//! 参与者仓储层
//!
//! 按活动分页查询已确认的参与者。两种数据来源：
//!
//! - 预订服务 HTTP API（默认）
//! - 本地 Postgres participants 表
//!
//! 处理器只依赖 `ParticipantRepository` trait，便于 mock 测试。

mod booking_api;
mod postgres;
mod traits;

use std::sync::Arc;

use notifier_shared::config::{AppConfig, RepositoryBackend};
use notifier_shared::database::Database;
use tracing::info;

use crate::error::NotificationError;

pub use booking_api::BookingApiRepository;
pub use postgres::PgParticipantRepository;
pub use traits::*;

/// 根据配置构建参与者仓储
pub async fn build_repository(
    config: &AppConfig,
) -> Result<Arc<dyn ParticipantRepository>, NotificationError> {
    let repository: Arc<dyn ParticipantRepository> = match config.repository.backend {
        RepositoryBackend::BookingApi => {
            Arc::new(BookingApiRepository::new(&config.booking_service)?)
        }
        RepositoryBackend::Postgres => {
            let db = Database::connect(&config.database).await?;
            Arc::new(PgParticipantRepository::new(db.pool().clone()))
        }
    };

    info!(backend = ?config.repository.backend, "参与者仓储已初始化");
    Ok(repository)
}
