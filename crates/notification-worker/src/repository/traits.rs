//! 仓储 Trait 定义

use async_trait::async_trait;

use crate::error::RepositoryError;
use crate::model::{EventId, Participant};

/// 一页参与者
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantPage {
    pub participants: Vec<Participant>,
    /// 数据源明确告知已无后续数据
    pub exhausted: bool,
}

impl ParticipantPage {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self {
            participants,
            exhausted: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            participants: Vec::new(),
            exhausted: true,
        }
    }
}

/// 参与者仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ParticipantRepository: Send + Sync {
    /// 分页获取已确认参与者，按稳定顺序排列，可能返回空页
    async fn fetch_participants(
        &self,
        event_id: &EventId,
        offset: usize,
        limit: usize,
    ) -> Result<ParticipantPage, RepositoryError>;

    /// 参与者总数，只用于日志与报告
    async fn count_participants(&self, event_id: &EventId) -> Result<u64, RepositoryError>;
}
