//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射、手动提交与优雅关闭语义，避免各服务重复编写样板代码。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::SharedError;

/// 框架层使用的消息头
pub mod headers {
    /// 消息已被重新投递的次数，缺省视为 0
    pub const REDELIVERY_COUNT: &str = "x-notifier-redelivery";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for header in h.iter() {
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp: msg.timestamp().to_millis(),
            headers,
        }
    }

    /// 已重新投递的次数，头缺失或无法解析时为 0
    pub fn redelivery_count(&self) -> u32 {
        self.headers
            .get(headers::REDELIVERY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// 5 秒内仍无法投递即视为失败，交由调用方决定是否重试。
    pub fn new(config: &KafkaConfig) -> Result<Self, SharedError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| SharedError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息，可附带消息头
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        headers: &[(&str, &str)],
    ) -> Result<(i32, i64), SharedError> {
        let mut owned_headers = OwnedHeaders::new();
        for (name, value) in headers {
            owned_headers = owned_headers.insert(Header {
                key: *name,
                value: Some(*value),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(owned_headers);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| SharedError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), SharedError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| SharedError::Kafka(format!("序列化失败: {e}")))?;

        self.send(topic, key, &payload, &[]).await
    }

    /// 将消息原样重新投递到其来源 topic，并递增重投计数头
    pub async fn redeliver(&self, msg: &ConsumerMessage) -> Result<u32, SharedError> {
        let next = msg.redelivery_count() + 1;
        let count = next.to_string();
        let key = msg.key.as_deref().unwrap_or_default();

        self.send(
            &msg.topic,
            key,
            &msg.payload,
            &[(headers::REDELIVERY_COUNT, count.as_str())],
        )
        .await?;

        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 关闭自动提交：偏移量只在消息被处理并确认后才由调用方显式提交，
/// 进程在处理中途崩溃时消息会被重新投递。
/// 内部 `StreamConsumer` 以 Arc 共享，克隆出的句柄可在处理闭包中提交偏移量。
#[derive(Clone)]
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

impl KafkaConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组，
    /// 例如 "event-notifier.notifications"。
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, SharedError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| SharedError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化（手动提交）");
        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), SharedError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| SharedError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    /// 同步提交该消息之后的偏移量，等价于确认这条消息
    pub fn commit(&self, msg: &ConsumerMessage) -> Result<(), SharedError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(|e| SharedError::Kafka(format!("构造提交偏移量失败: {e}")))?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| SharedError::Kafka(format!("提交偏移量失败: {e}")))?;

        debug!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            "偏移量已提交"
        );
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - 收到消息时调用 handler 并等待其完成后才拉取下一条，保证同一时刻至多一条未确认消息；
    /// - handler 返回错误表示该消息未能提交，循环立即停止并返回错误。偏移量提交是累积的，
    ///   继续消费后续消息会越过这条消息，停止后从已提交位置重新消费。
    /// - 关闭信号变为 `true` 时退出循环；正在执行的 handler 总是先自然完成。
    pub async fn start<F, Fut>(
        &self,
        mut shutdown: watch::Receiver<bool>,
        handler: F,
    ) -> Result<(), SharedError>
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), SharedError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("Kafka 消费循环已启动");

        loop {
            if *shutdown.borrow() {
                info!("关闭信号已置位，Kafka 消费循环退出");
                break;
            }

            tokio::select! {
                // 偏向关闭信号，保证收到关闭时不再拉取新消息
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                "收到 Kafka 消息"
                            );

                            let (partition, offset) = (msg.partition, msg.offset);
                            if let Err(e) = handler(msg).await {
                                error!(
                                    error = %e,
                                    code = e.code(),
                                    partition,
                                    offset,
                                    "消息未能提交，Kafka 消费循环停止"
                                );
                                return Err(e);
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// 取消订阅，释放分区分配
    pub fn close(&self) {
        self.consumer.unsubscribe();
        info!("Kafka 消费者已取消订阅");
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn message_with_headers(headers: HashMap<String, String>) -> ConsumerMessage {
        ConsumerMessage {
            topic: "event.notifications".to_string(),
            partition: 0,
            offset: 42,
            key: Some("evt-1".to_string()),
            payload: br#"{"type":"CREATED","event_id":1}"#.to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers,
        }
    }

    #[test]
    fn test_redelivery_count_defaults_to_zero() {
        let msg = message_with_headers(HashMap::new());
        assert_eq!(msg.redelivery_count(), 0);
    }

    #[test]
    fn test_redelivery_count_from_header() {
        let msg = message_with_headers(HashMap::from([(
            headers::REDELIVERY_COUNT.to_string(),
            "1".to_string(),
        )]));
        assert_eq!(msg.redelivery_count(), 1);
    }

    #[test]
    fn test_redelivery_count_ignores_garbage() {
        let msg = message_with_headers(HashMap::from([(
            headers::REDELIVERY_COUNT.to_string(),
            "many".to_string(),
        )]));
        assert_eq!(msg.redelivery_count(), 0);
    }
}
