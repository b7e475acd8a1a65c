//! 通知触发入口
//!
//! 提供 HTTP 接口手动触发某个活动的通知：请求校验后按入站消息格式写入 Kafka，立即返回 202，
//! 实际发送由队列监听器异步完成。

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use notifier_shared::error::SharedError;
use notifier_shared::kafka::KafkaProducer;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::{DecodeError, NotificationError};
use crate::model::NotificationMessage;

/// 通知消息发布 trait
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), SharedError>;
}

/// 发布到 Kafka，以活动 ID 作为消息键，同一活动的通知落在同一分区
pub struct KafkaPublisher {
    producer: KafkaProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(producer: KafkaProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, message: &NotificationMessage) -> Result<(), SharedError> {
        self.producer
            .send_json(&self.topic, message.event_id().as_str(), message)
            .await
            .map(|_| ())
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub publisher: Arc<dyn MessagePublisher>,
    pub service_name: String,
}

// ---------------------------------------------------------------------------
// 错误响应
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    InvalidRequest(#[from] DecodeError),

    #[error(transparent)]
    Publish(#[from] SharedError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Publish(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Publish(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 基础设施错误只返回通用提示，详细信息记录日志
        let message = match &self {
            Self::Publish(e) => {
                error!(error = %e, "通知消息发布失败");
                "通知入队失败，请稍后重试".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": message,
        });

        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// 路由与处理函数
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/notifications/send", post(send_notification))
        .route("/api/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 请求体与队列消息格式一致，复用同一套解码校验
async fn send_notification(
    State(state): State<ApiState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let message = NotificationMessage::decode(&body)?;
    state.publisher.publish(&message).await?;

    info!(
        event_id = %message.event_id(),
        kind = %message.kind(),
        "通知已入队"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "success": true,
            "message": format!("Notification processing queued for event {}", message.event_id()),
            "event_id": message.event_id().as_str(),
        })),
    ))
}

async fn health_check(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": state.service_name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 启动 HTTP 服务，shutdown 置位后停止接收新连接并等待已有请求完成
pub async fn serve(
    addr: &str,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), NotificationError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| SharedError::Internal(format!("监听 {addr} 失败: {e}")))?;
    info!(addr, "通知触发接口已启动");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|e| SharedError::Internal(format!("HTTP 服务异常退出: {e}")))?;

    info!("通知触发接口已停止");
    Ok(())
}
