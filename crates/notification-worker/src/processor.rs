//! 通知处理器
//!
//! 对单条通知消息：渲染模板，按批分页拉取参与者，逐批交给批量发送器，汇总处理报告。
//! 批次严格按分页顺序处理，任一时刻内存中只有一页参与者。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{Instrument, info, info_span, warn};

use crate::error::ProcessError;
use crate::model::{Batch, NotificationMessage, ProcessingReport};
use crate::repository::ParticipantRepository;
use crate::sender::BatchSender;
use crate::templates::TemplateRenderer;

/// 消息处理 trait，监听器只依赖该抽象
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &NotificationMessage)
    -> Result<ProcessingReport, ProcessError>;
}

pub struct NotificationProcessor {
    repository: Arc<dyn ParticipantRepository>,
    renderer: Arc<dyn TemplateRenderer>,
    sender: BatchSender,
    batch_size: usize,
}

impl NotificationProcessor {
    pub fn new(
        repository: Arc<dyn ParticipantRepository>,
        renderer: Arc<dyn TemplateRenderer>,
        sender: BatchSender,
        batch_size: usize,
    ) -> Self {
        Self {
            repository,
            renderer,
            sender,
            batch_size: batch_size.max(1),
        }
    }

    async fn run(&self, message: &NotificationMessage) -> Result<ProcessingReport, ProcessError> {
        let started = Instant::now();
        let event_id = message.event_id();

        // 模板在拉取参与者之前解析，配置错误不会产生任何外部调用
        let email = self
            .renderer
            .render(message.kind(), event_id, message.event())?;

        let mut report = ProcessingReport::new(event_id.clone(), message.kind());

        match self.repository.count_participants(event_id).await {
            Ok(count) => {
                report.expected_participants = Some(count);
                info!(expected = count, "开始处理通知");
            }
            Err(e) => warn!(error = %e, "获取参与者总数失败，继续分页处理"),
        }

        let mut offset = 0usize;
        let mut index = 0usize;
        loop {
            let page = self
                .repository
                .fetch_participants(event_id, offset, self.batch_size)
                .await?;

            if page.participants.is_empty() {
                break;
            }

            let page_len = page.participants.len();
            let batch = Batch {
                index,
                participants: page.participants,
            };

            let result = self.sender.send(&batch, &email).await;
            if result.failed.is_empty() {
                info!(batch_index = index, sent = result.sent_count, "批次发送完成");
            } else {
                warn!(
                    batch_index = index,
                    sent = result.sent_count,
                    failed = result.failed_count(),
                    "批次存在发送失败的收件人"
                );
            }
            report.absorb(&result);

            // 无论发送结果如何游标都前进，失败的收件人不会在本条消息内再次出现
            offset += self.batch_size;
            index += 1;

            if page_len < self.batch_size || page.exhausted {
                break;
            }
        }

        if let Some(expected) = report.expected_participants
            && expected != report.total_participants as u64
        {
            warn!(
                expected,
                actual = report.total_participants,
                "实际处理人数与预期不一致"
            );
        }

        info!(
            total_participants = report.total_participants,
            total_sent = report.total_sent,
            total_failed = report.total_failed,
            batches_processed = report.batches_processed,
            duration_ms = started.elapsed().as_millis() as u64,
            "通知处理完成"
        );

        Ok(report)
    }
}

#[async_trait]
impl MessageProcessor for NotificationProcessor {
    async fn process(
        &self,
        message: &NotificationMessage,
    ) -> Result<ProcessingReport, ProcessError> {
        let span = info_span!(
            "process_notification",
            event_id = %message.event_id(),
            kind = %message.kind()
        );
        self.run(message).instrument(span).await
    }
}
