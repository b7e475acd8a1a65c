//! 通知服务错误类型
//!
//! 按影响范围分两层：
//! - 消息级（解码、模板配置、参与者查询）：中止整条消息，决定确认/拒绝/重投；
//! - 收件人级（瞬时/永久发送失败）：只记录在批次结果中，绝不向上升级。

use notifier_shared::error::SharedError;
use thiserror::Error;

/// 入站消息解码失败，永久性错误，重投也不会成功
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("消息不是合法的 JSON: {0}")]
    InvalidJson(String),

    #[error("缺少必填字段: {0}")]
    MissingField(&'static str),

    #[error("未知的通知类型: {0}")]
    UnknownType(String),

    #[error("event_id 无效: {0}")]
    InvalidEventId(String),

    #[error("event 字段格式错误: {0}")]
    InvalidEvent(String),
}

/// 模板配置错误，对该消息是致命的
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("通知类型 {kind} 没有可用的邮件模板")]
    MissingTemplate { kind: String },

    #[error("邮件模板渲染失败: {0}")]
    Render(String),
}

/// 参与者查询失败
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("预订服务请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("预订服务返回异常状态: status={status}, body={body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("参与者数据库查询失败: {0}")]
    Database(#[from] sqlx::Error),
}

/// 单次投递失败，按是否值得重试分类
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// 网络抖动、超时、服务端 5xx 等，重试可能成功
    #[error("瞬时发送失败: {0}")]
    Transient(String),

    /// 地址无效、被拒收等，重试也不会成功
    #[error("永久发送失败: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Transient(reason) | Self::Permanent(reason) => reason,
        }
    }
}

/// 消息级处理失败
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ProcessError {
    /// 是否值得把消息重新放回队列
    ///
    /// 参与者查询失败多为下游暂时不可用；配置错误重投多少次结果都一样。
    pub fn is_requeueable(&self) -> bool {
        matches!(self, Self::Repository(_))
    }
}

/// 服务顶层错误
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("邮件通道初始化失败: {0}")]
    TransportSetup(String),

    #[error(transparent)]
    Shared(#[from] SharedError),
}
