//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

/// 注册通知服务的指标描述，出现在 /metrics 的 HELP 注释中
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "notification_messages_total",
        "Total number of queue messages by disposition"
    );
    metrics::describe_histogram!(
        "notification_message_duration_seconds",
        "End-to-end processing time of one notification message"
    );

    metrics::describe_counter!(
        "notification_emails_total",
        "Total number of participant emails by final outcome"
    );
    metrics::describe_counter!(
        "notification_send_attempts_total",
        "Total number of transport delivery attempts"
    );
    metrics::describe_histogram!(
        "notification_batch_duration_seconds",
        "Time to bring every recipient of one batch to a terminal state"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一条队列消息的处置结果（ack / reject / requeue）
#[inline]
pub fn record_message(disposition: &str, duration_secs: f64) {
    metrics::counter!(
        "notification_messages_total",
        "disposition" => disposition.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "notification_message_duration_seconds",
        "disposition" => disposition.to_string()
    )
    .record(duration_secs);
}

/// 记录单个收件人的最终结果（sent / failed_transient / failed_permanent）
#[inline]
pub fn record_email(outcome: &str) {
    metrics::counter!(
        "notification_emails_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录一次底层发送尝试
#[inline]
pub fn record_send_attempt(retry: bool) {
    metrics::counter!(
        "notification_send_attempts_total",
        "retry" => retry.to_string()
    )
    .increment(1);
}

/// 记录批次耗时
#[inline]
pub fn record_batch(size: usize, duration_secs: f64) {
    metrics::histogram!("notification_batch_duration_seconds").record(duration_secs);
    metrics::counter!("notification_batch_recipients_total").increment(size as u64);
}
