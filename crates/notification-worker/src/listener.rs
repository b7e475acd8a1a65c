//! 队列监听器
//!
//! 顺序消费通知消息：一条消息的全部批次与重试完成并确认后，才拉取下一条。
//! 消息的确认语义映射到 Kafka 上：
//!
//! - 确认：提交偏移量
//! - 拒绝不重投：记录错误后提交偏移量
//! - 拒绝并重投：带递增的重投计数头重新发布到原 topic，再提交偏移量
//!
//! 同一条消息最多重投一次，再次失败只记录日志供人工排查。
//!
//! 处置本身失败（重新发布或提交偏移量出错）时短暂重试；仍失败则停止消费，
//! 未提交的偏移量在重启后重新被消费，不会被后续消息的提交越过。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notifier_shared::error::SharedError;
use notifier_shared::kafka::{ConsumerMessage, KafkaConsumer, KafkaProducer};
use notifier_shared::observability::metrics;
use notifier_shared::retry::RetryPolicy;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::error::NotificationError;
use crate::model::NotificationMessage;
use crate::processor::MessageProcessor;

/// 单条消息允许的最大重投次数
pub const MAX_REDELIVERIES: u32 = 1;

/// 处置失败时的重试策略
fn settle_policy() -> RetryPolicy {
    RetryPolicy::fixed(2, Duration::from_secs(1))
}

/// 消息处置结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

impl Disposition {
    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Reject { requeue: false } => "reject",
            Self::Reject { requeue: true } => "requeue",
        }
    }
}

// ---------------------------------------------------------------------------
// Acknowledger
// ---------------------------------------------------------------------------

/// 消息确认 trait
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, msg: &ConsumerMessage) -> Result<(), SharedError>;

    async fn reject(&self, msg: &ConsumerMessage, requeue: bool) -> Result<(), SharedError>;
}

/// 基于偏移量提交与重新发布的确认实现
pub struct KafkaAcknowledger {
    consumer: KafkaConsumer,
    producer: KafkaProducer,
}

impl KafkaAcknowledger {
    pub fn new(consumer: KafkaConsumer, producer: KafkaProducer) -> Self {
        Self { consumer, producer }
    }
}

#[async_trait]
impl Acknowledger for KafkaAcknowledger {
    async fn ack(&self, msg: &ConsumerMessage) -> Result<(), SharedError> {
        self.consumer.commit(msg)
    }

    async fn reject(&self, msg: &ConsumerMessage, requeue: bool) -> Result<(), SharedError> {
        if requeue {
            // 重新发布失败时不提交，由调用方决定重试或停止消费
            let count = self.producer.redeliver(msg).await?;
            info!(
                topic = %msg.topic,
                offset = msg.offset,
                redelivery = count,
                "消息已重新投递"
            );
        }
        self.consumer.commit(msg)
    }
}

// ---------------------------------------------------------------------------
// 处置决策
// ---------------------------------------------------------------------------

/// 解码并处理消息，给出处置结果
pub async fn decide(processor: &dyn MessageProcessor, payload: &[u8]) -> Disposition {
    let message = match NotificationMessage::decode(payload) {
        Ok(message) => message,
        Err(e) => {
            error!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "消息解码失败，拒绝且不重投"
            );
            return Disposition::Reject { requeue: false };
        }
    };

    match processor.process(&message).await {
        Ok(report) if report.total_failed == 0 => Disposition::Ack,
        Ok(report) if report.is_partial_failure() => {
            warn!(
                event_id = %report.event_id,
                total_sent = report.total_sent,
                total_failed = report.total_failed,
                "部分收件人发送失败，消息仍确认"
            );
            Disposition::Ack
        }
        Ok(report) => {
            // 一封都没发出去，整条消息重投不会造成重复邮件
            error!(
                event_id = %report.event_id,
                total_failed = report.total_failed,
                "全部收件人发送失败"
            );
            Disposition::Reject { requeue: true }
        }
        Err(e) => {
            error!(
                event_id = %message.event_id(),
                kind = %message.kind(),
                error = %e,
                "通知处理失败"
            );
            Disposition::Reject {
                requeue: e.is_requeueable(),
            }
        }
    }
}

/// 限制重投次数，已达上限的消息改为拒绝不重投
pub fn apply_redelivery_limit(disposition: Disposition, msg: &ConsumerMessage) -> Disposition {
    match disposition {
        Disposition::Reject { requeue: true } if msg.redelivery_count() >= MAX_REDELIVERIES => {
            error!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                key = ?msg.key,
                redelivery = msg.redelivery_count(),
                "消息重投后仍处理失败，需人工排查"
            );
            Disposition::Reject { requeue: false }
        }
        other => other,
    }
}

/// 处理并处置单条消息
pub async fn handle_message(
    processor: &dyn MessageProcessor,
    acker: &dyn Acknowledger,
    msg: &ConsumerMessage,
) -> Result<Disposition, SharedError> {
    let started = Instant::now();

    let disposition = apply_redelivery_limit(decide(processor, &msg.payload).await, msg);
    settle(acker, msg, disposition).await?;

    metrics::record_message(disposition.label(), started.elapsed().as_secs_f64());
    Ok(disposition)
}

/// 执行处置，可重试的基础设施错误按固定间隔重试
async fn settle(
    acker: &dyn Acknowledger,
    msg: &ConsumerMessage,
    disposition: Disposition,
) -> Result<(), SharedError> {
    let policy = settle_policy();
    let mut attempt = 0;

    loop {
        let settled = match disposition {
            Disposition::Ack => acker.ack(msg).await,
            Disposition::Reject { requeue } => acker.reject(msg, requeue).await,
        };

        match settled {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                warn!(
                    error = %e,
                    offset = msg.offset,
                    disposition = disposition.label(),
                    attempt = attempt + 1,
                    "消息处置失败，等待后重试"
                );
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueListener
// ---------------------------------------------------------------------------

pub struct QueueListener {
    consumer: KafkaConsumer,
    acker: Arc<dyn Acknowledger>,
    processor: Arc<dyn MessageProcessor>,
    topic: String,
}

impl QueueListener {
    pub fn new(
        consumer: KafkaConsumer,
        producer: KafkaProducer,
        processor: Arc<dyn MessageProcessor>,
        topic: impl Into<String>,
    ) -> Self {
        let acker = Arc::new(KafkaAcknowledger::new(consumer.clone(), producer));
        Self {
            consumer,
            acker,
            processor,
            topic: topic.into(),
        }
    }

    /// 启动消费循环，直到收到 shutdown 信号
    ///
    /// 正在处理的消息会完整处理并处置后才退出。处置失败时返回错误，由进程退出后重新消费。
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), NotificationError> {
        self.consumer.subscribe(&[self.topic.as_str()])?;
        info!(topic = %self.topic, "通知监听器已启动");

        let processor = self.processor.as_ref();
        let acker = self.acker.as_ref();

        let consumed = self
            .consumer
            .start(shutdown, |msg| async move {
                handle_message(processor, acker, &msg).await.map(|_| ())
            })
            .await;

        self.consumer.close();
        consumed?;
        info!("通知监听器已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigurationError, ProcessError, RepositoryError};
    use crate::model::{EventId, NotificationType, ProcessingReport};
    use crate::processor::MockMessageProcessor;
    use notifier_shared::kafka::headers;
    use std::collections::HashMap;

    fn consumer_message(payload: &[u8], redelivery: Option<u32>) -> ConsumerMessage {
        let mut message_headers = HashMap::new();
        if let Some(count) = redelivery {
            message_headers.insert(headers::REDELIVERY_COUNT.to_string(), count.to_string());
        }
        ConsumerMessage {
            topic: "event.notifications".to_string(),
            partition: 0,
            offset: 7,
            key: Some("42".to_string()),
            payload: payload.to_vec(),
            timestamp: None,
            headers: message_headers,
        }
    }

    const VALID: &[u8] = br#"{"type": "UPDATED", "event_id": 42}"#;

    fn report(sent: usize, failed: usize) -> ProcessingReport {
        ProcessingReport {
            event_id: EventId::new("42"),
            kind: NotificationType::Updated,
            total_participants: sent + failed,
            total_sent: sent,
            total_failed: failed,
            batches_processed: 1,
            expected_participants: None,
        }
    }

    fn processor_returning(
        result: impl Fn() -> Result<ProcessingReport, ProcessError> + Send + 'static,
    ) -> MockMessageProcessor {
        let mut processor = MockMessageProcessor::new();
        processor
            .expect_process()
            .times(1)
            .returning(move |_| result());
        processor
    }

    fn expect_ack() -> MockAcknowledger {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|_| Ok(()));
        acker.expect_reject().never();
        acker
    }

    fn expect_reject(requeue: bool) -> MockAcknowledger {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_reject()
            .withf(move |_, r| *r == requeue)
            .times(1)
            .returning(|_, _| Ok(()));
        acker
    }

    #[tokio::test]
    async fn test_unknown_type_rejected_without_processing() {
        let mut processor = MockMessageProcessor::new();
        processor.expect_process().never();
        let acker = expect_reject(false);

        let msg = consumer_message(br#"{"type": "BOGUS", "event_id": 1}"#, None);
        let disposition = handle_message(&processor, &acker, &msg).await.unwrap();
        assert_eq!(disposition, Disposition::Reject { requeue: false });
    }

    #[tokio::test]
    async fn test_malformed_json_rejected_without_processing() {
        let mut processor = MockMessageProcessor::new();
        processor.expect_process().never();

        let msg = consumer_message(b"{not json", None);
        let disposition = handle_message(&processor, &expect_reject(false), &msg)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Reject { requeue: false });
    }

    #[tokio::test]
    async fn test_full_success_acknowledged() {
        let processor = processor_returning(|| Ok(report(100, 0)));
        let msg = consumer_message(VALID, None);

        let disposition = handle_message(&processor, &expect_ack(), &msg).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_zero_participants_acknowledged() {
        let processor = processor_returning(|| Ok(report(0, 0)));
        let msg = consumer_message(VALID, None);

        let disposition = handle_message(&processor, &expect_ack(), &msg).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_partial_failure_acknowledged_not_requeued() {
        let processor = processor_returning(|| Ok(report(90, 10)));
        let msg = consumer_message(VALID, None);

        let disposition = handle_message(&processor, &expect_ack(), &msg).await.unwrap();
        assert_eq!(disposition, Disposition::Ack);
    }

    #[tokio::test]
    async fn test_total_failure_requeued_once() {
        let processor = processor_returning(|| Ok(report(0, 10)));
        let msg = consumer_message(VALID, None);

        let disposition = handle_message(&processor, &expect_reject(true), &msg)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Reject { requeue: true });
    }

    #[tokio::test]
    async fn test_repository_failure_requeued_on_first_delivery() {
        let processor = processor_returning(|| {
            Err(ProcessError::Repository(RepositoryError::UnexpectedStatus {
                status: 503,
                body: String::new(),
            }))
        });
        let msg = consumer_message(VALID, Some(0));

        let disposition = handle_message(&processor, &expect_reject(true), &msg)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Reject { requeue: true });
    }

    #[tokio::test]
    async fn test_repository_failure_after_redelivery_not_requeued_again() {
        let processor = processor_returning(|| {
            Err(ProcessError::Repository(RepositoryError::UnexpectedStatus {
                status: 503,
                body: String::new(),
            }))
        });
        let msg = consumer_message(VALID, Some(1));

        let disposition = handle_message(&processor, &expect_reject(false), &msg)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Reject { requeue: false });
    }

    #[tokio::test]
    async fn test_configuration_error_rejected_without_requeue() {
        let processor = processor_returning(|| {
            Err(ProcessError::Configuration(ConfigurationError::MissingTemplate {
                kind: "UPDATED".to_string(),
            }))
        });
        let msg = consumer_message(VALID, None);

        let disposition = handle_message(&processor, &expect_reject(false), &msg)
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Reject { requeue: false });
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_failure_propagates_after_retries() {
        let processor = processor_returning(|| Ok(report(1, 0)));
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(3)
            .returning(|_| Err(SharedError::Kafka("commit failed".to_string())));

        let msg = consumer_message(VALID, None);
        let result = handle_message(&processor, &acker, &msg).await;
        assert!(matches!(result, Err(SharedError::Kafka(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requeue_is_not_swallowed() {
        let processor = processor_returning(|| Ok(report(0, 10)));
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_reject()
            .withf(|_, requeue| *requeue)
            .times(3)
            .returning(|_, _| Err(SharedError::Kafka("produce timed out".to_string())));

        let msg = consumer_message(VALID, None);
        let result = handle_message(&processor, &acker, &msg).await;
        assert!(matches!(result, Err(SharedError::Kafka(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_recovers_after_transient_settle_failure() {
        let processor = processor_returning(|| Ok(report(0, 10)));
        let mut acker = MockAcknowledger::new();
        let mut calls = 0;
        acker
            .expect_reject()
            .withf(|_, requeue| *requeue)
            .times(2)
            .returning(move |_, _| {
                calls += 1;
                if calls == 1 {
                    Err(SharedError::Kafka("produce timed out".to_string()))
                } else {
                    Ok(())
                }
            });

        let msg = consumer_message(VALID, None);
        let disposition = handle_message(&processor, &acker, &msg).await.unwrap();
        assert_eq!(disposition, Disposition::Reject { requeue: true });
    }

    #[tokio::test]
    async fn test_non_retryable_settle_failure_not_retried() {
        let processor = processor_returning(|| Ok(report(1, 0)));
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|_| Err(SharedError::Internal("consumer closed".to_string())));

        let msg = consumer_message(VALID, None);
        let result = handle_message(&processor, &acker, &msg).await;
        assert!(matches!(result, Err(SharedError::Internal(_))));
    }

    #[test]
    fn test_disposition_labels() {
        assert_eq!(Disposition::Ack.label(), "ack");
        assert_eq!(Disposition::Reject { requeue: false }.label(), "reject");
        assert_eq!(Disposition::Reject { requeue: true }.label(), "requeue");
    }
}
