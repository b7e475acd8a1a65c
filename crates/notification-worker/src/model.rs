//! 通知领域模型
//!
//! 入站消息在解码时一次性完成校验并转为不可变的 `NotificationMessage`；
//! 批次、发送结果与处理报告只在单条消息的处理过程中存在，不做持久化。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

// ---------------------------------------------------------------------------
// NotificationType 通知类型
// ---------------------------------------------------------------------------

/// 活动生命周期通知类型
///
/// 封闭枚举：解码阶段就把字符串解析为变体，之后模板选择等逻辑都是穷尽匹配。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Created,
    Updated,
    Cancelled,
}

impl NotificationType {
    pub const ALL: [NotificationType; 3] = [Self::Created, Self::Updated, Self::Cancelled];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for NotificationType {
    type Err = DecodeError;

    /// 除标准名称外兼容历史生产者使用的 `event_*` 小写名称
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" | "event_created" => Ok(Self::Created),
            "UPDATED" | "event_updated" | "event_update" => Ok(Self::Updated),
            "CANCELLED" | "event_cancelled" => Ok(Self::Cancelled),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EventId
// ---------------------------------------------------------------------------

/// 活动标识
///
/// 上游既有整数 ID 也有 UUID 字符串，统一规整为字符串。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, DecodeError> {
        match value {
            serde_json::Value::Number(n) if n.is_u64() || n.is_i64() => Ok(Self(n.to_string())),
            serde_json::Value::String(s) if !s.trim().is_empty() => Ok(Self(s.trim().to_string())),
            other => Err(DecodeError::InvalidEventId(other.to_string())),
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// EventDetails
// ---------------------------------------------------------------------------

/// 活动描述信息，仅用于邮件模板渲染，全部可选
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seats: Option<i64>,
}

// ---------------------------------------------------------------------------
// NotificationMessage 入站消息
// ---------------------------------------------------------------------------

/// 入站通知消息
///
/// 字段私有，只能通过 [`NotificationMessage::decode`] 或 [`NotificationMessage::new`]
/// 构造，构造后不可变。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationMessage {
    #[serde(rename = "type")]
    kind: NotificationType,
    event_id: EventId,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<EventDetails>,
}

/// 解码中间态：先宽松接收，再逐字段校验，以便给出精确的错误原因
#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    event_id: Option<serde_json::Value>,
    event: Option<serde_json::Value>,
}

impl NotificationMessage {
    pub fn new(kind: NotificationType, event_id: EventId, event: Option<EventDetails>) -> Self {
        Self {
            kind,
            event_id,
            event,
        }
    }

    /// 从队列消息体解码并校验
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawMessage = serde_json::from_slice(payload)
            .map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

        let kind = raw
            .kind
            .ok_or(DecodeError::MissingField("type"))?
            .parse::<NotificationType>()?;

        let event_id = raw
            .event_id
            .as_ref()
            .ok_or(DecodeError::MissingField("event_id"))
            .and_then(EventId::from_json)?;

        let event = match raw.event {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => Some(
                serde_json::from_value::<EventDetails>(value)
                    .map_err(|e| DecodeError::InvalidEvent(e.to_string()))?,
            ),
        };

        Ok(Self {
            kind,
            event_id,
            event,
        })
    }

    pub fn kind(&self) -> NotificationType {
        self.kind
    }

    pub fn event_id(&self) -> &EventId {
        &self.event_id
    }

    pub fn event(&self) -> Option<&EventDetails> {
        self.event.as_ref()
    }
}

impl fmt::Display for NotificationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NotificationMessage(type={}, event_id={})",
            self.kind, self.event_id
        )
    }
}

// ---------------------------------------------------------------------------
// Participant / Batch
// ---------------------------------------------------------------------------

/// 活动参与者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub email: String,
    pub name: String,
}

impl Participant {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
        }
    }

    /// 数据源没有姓名时，以邮箱 @ 之前的部分作为称呼
    pub fn from_email(email: impl Into<String>) -> Self {
        let email = email.into();
        let name = email
            .split('@')
            .next()
            .filter(|local| !local.is_empty())
            .unwrap_or("User")
            .to_string();
        Self { email, name }
    }
}

/// 一页参与者，大小不超过 batch_size
#[derive(Debug, Clone)]
pub struct Batch {
    /// 分页序号，从 0 开始
    pub index: usize,
    pub participants: Vec<Participant>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

// ---------------------------------------------------------------------------
// 发送结果
// ---------------------------------------------------------------------------

/// 单个收件人的最终结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// 重试耗尽后仍为瞬时失败，保留最后一次原因
    FailedTransient(String),
    FailedPermanent(String),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }

    /// 指标标签
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::FailedTransient(_) => "failed_transient",
            Self::FailedPermanent(_) => "failed_permanent",
        }
    }
}

/// 批次中发送失败的收件人
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecipient {
    pub participant: Participant,
    pub reason: String,
    pub attempts: u32,
    pub permanent: bool,
}

/// 单个批次的发送汇总，在批次内所有收件人到达终态后产生
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub batch_index: usize,
    pub sent_count: usize,
    pub failed: Vec<FailedRecipient>,
}

impl BatchResult {
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// 批次收件人总数，恒等于 sent_count + failed.len()
    pub fn total(&self) -> usize {
        self.sent_count + self.failed.len()
    }
}

/// 单条消息的处理报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingReport {
    pub event_id: EventId,
    pub kind: NotificationType,
    /// 实际分页拉取到的参与者数
    pub total_participants: usize,
    pub total_sent: usize,
    pub total_failed: usize,
    pub batches_processed: usize,
    /// 仓储计数接口给出的预期人数，仅用于日志对照
    pub expected_participants: Option<u64>,
}

impl ProcessingReport {
    pub fn new(event_id: EventId, kind: NotificationType) -> Self {
        Self {
            event_id,
            kind,
            total_participants: 0,
            total_sent: 0,
            total_failed: 0,
            batches_processed: 0,
            expected_participants: None,
        }
    }

    /// 累加一个批次的结果
    pub fn absorb(&mut self, batch: &BatchResult) {
        self.total_participants += batch.total();
        self.total_sent += batch.sent_count;
        self.total_failed += batch.failed_count();
        self.batches_processed += 1;
    }

    pub fn is_partial_failure(&self) -> bool {
        self.total_failed > 0 && self.total_sent > 0
    }

    /// 有收件人但一封都没发出去
    pub fn is_total_failure(&self) -> bool {
        self.total_failed > 0 && self.total_sent == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_decode_standard_message() {
        let msg = assert_ok!(NotificationMessage::decode(
            br#"{"type": "UPDATED", "event_id": 42}"#
        ));
        assert_eq!(msg.kind(), NotificationType::Updated);
        assert_eq!(msg.event_id().as_str(), "42");
        assert!(msg.event().is_none());
    }

    #[test]
    fn test_decode_string_event_id_and_details() {
        let payload = br#"{
            "type": "event_cancelled",
            "event_id": "0b6f2c1e-6a8e-4c55-9d54-3b8f3e0c7a11",
            "event": {"event_name": "Rust Meetup", "location": "Hall A", "remaining_seats": 12}
        }"#;

        let msg = assert_ok!(NotificationMessage::decode(payload));
        assert_eq!(msg.kind(), NotificationType::Cancelled);
        assert_eq!(
            msg.event_id().as_str(),
            "0b6f2c1e-6a8e-4c55-9d54-3b8f3e0c7a11"
        );
        let event = msg.event().expect("应携带活动信息");
        assert_eq!(event.event_name.as_deref(), Some("Rust Meetup"));
        assert_eq!(event.remaining_seats, Some(12));
        assert!(event.description.is_none());
    }

    #[test]
    fn test_decode_legacy_aliases() {
        for (raw, expected) in [
            ("event_created", NotificationType::Created),
            ("event_updated", NotificationType::Updated),
            ("event_update", NotificationType::Updated),
            ("event_cancelled", NotificationType::Cancelled),
        ] {
            assert_eq!(raw.parse::<NotificationType>().unwrap(), expected);
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = assert_err!(NotificationMessage::decode(
            br#"{"type": "BOGUS", "event_id": 1}"#
        ));
        assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "BOGUS"));
    }

    #[test]
    fn test_decode_reminder_is_unknown_type() {
        let err = assert_err!(NotificationMessage::decode(
            br#"{"type": "event_reminder", "event_id": 1, "reminder_type": "one_day"}"#
        ));
        assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "event_reminder"));
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        assert!(matches!(
            NotificationMessage::decode(b"not valid json"),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(
            NotificationMessage::decode(br#"{"event_id": 1}"#),
            Err(DecodeError::MissingField("type"))
        ));
        assert!(matches!(
            NotificationMessage::decode(br#"{"type": "CREATED"}"#),
            Err(DecodeError::MissingField("event_id"))
        ));
        assert!(matches!(
            NotificationMessage::decode(br#"{"type": "CREATED", "event_id": ""}"#),
            Err(DecodeError::InvalidEventId(_))
        ));
        assert!(matches!(
            NotificationMessage::decode(br#"{"type": "CREATED", "event_id": 1.5}"#),
            Err(DecodeError::InvalidEventId(_))
        ));
        assert!(matches!(
            NotificationMessage::decode(br#"{"type": "CREATED", "event_id": 1, "event": "x"}"#),
            Err(DecodeError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_serialize_matches_inbound_schema() {
        let msg = NotificationMessage::new(NotificationType::Created, EventId::new("7"), None);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"type": "CREATED", "event_id": "7"}));

        // 序列化结果必须能被消费端重新解码
        let bytes = serde_json::to_vec(&msg).unwrap();
        assert_eq!(NotificationMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_participant_name_from_email() {
        assert_eq!(Participant::from_email("alice@example.com").name, "alice");
        assert_eq!(Participant::from_email("@example.com").name, "User");
    }

    #[test]
    fn test_report_absorbs_batches() {
        let mut report = ProcessingReport::new(EventId::new("1"), NotificationType::Updated);
        report.absorb(&BatchResult {
            batch_index: 0,
            sent_count: 90,
            failed: vec![
                FailedRecipient {
                    participant: Participant::from_email("bad@example.com"),
                    reason: "550 mailbox unavailable".to_string(),
                    attempts: 1,
                    permanent: true,
                };
                10
            ],
        });

        assert_eq!(report.total_participants, 100);
        assert_eq!(report.total_sent, 90);
        assert_eq!(report.total_failed, 10);
        assert_eq!(report.batches_processed, 1);
        assert!(report.is_partial_failure());
        assert!(!report.is_total_failure());
    }
}
