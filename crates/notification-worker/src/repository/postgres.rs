//! Postgres 参与者仓储
//!
//! 查询本地 `participants` 表中状态为 confirmed 的记录，按主键排序保证分页稳定。

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

use super::traits::{ParticipantPage, ParticipantRepository};
use crate::error::RepositoryError;
use crate::model::{EventId, Participant};

#[derive(FromRow)]
struct ParticipantRow {
    user_email: String,
}

pub struct PgParticipantRepository {
    pool: PgPool,
}

impl PgParticipantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ParticipantRepository for PgParticipantRepository {
    async fn fetch_participants(
        &self,
        event_id: &EventId,
        offset: usize,
        limit: usize,
    ) -> Result<ParticipantPage, RepositoryError> {
        let rows = sqlx::query_as::<_, ParticipantRow>(
            r#"
            SELECT user_email
            FROM participants
            WHERE event_id = $1 AND COALESCE(status, 'confirmed') = 'confirmed'
            ORDER BY id
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(event_id.as_str())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ParticipantPage::new(
            rows.into_iter()
                .map(|row| Participant::from_email(row.user_email))
                .collect(),
        ))
    }

    async fn count_participants(&self, event_id: &EventId) -> Result<u64, RepositoryError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM participants
            WHERE event_id = $1 AND COALESCE(status, 'confirmed') = 'confirmed'
            "#,
        )
        .bind(event_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notifier_shared::config::DatabaseConfig;
    use notifier_shared::database::Database;

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_paginates_confirmed_participants() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let repo = PgParticipantRepository::new(db.pool().clone());
        let event_id = EventId::new("integration-test-event");

        let total = repo.count_participants(&event_id).await.unwrap();
        let page = repo.fetch_participants(&event_id, 0, 100).await.unwrap();
        assert_eq!(page.participants.len() as u64, total.min(100));

        db.close().await;
    }
}
