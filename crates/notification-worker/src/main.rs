//! 活动参与者通知服务
//!
//! 消费 Kafka 中的活动变更通知，向活动参与者批量发送邮件；可选提供 HTTP 触发入口。

use std::sync::Arc;

use anyhow::Result;
use notifier_shared::config::AppConfig;
use notifier_shared::kafka::{KafkaConsumer, KafkaProducer};
use notifier_shared::observability;
use notifier_shared::retry::RetryPolicy;
use tokio::sync::watch;
use tracing::{error, info, warn};

use notification_worker::{
    api::{self, ApiState, KafkaPublisher},
    listener::QueueListener,
    processor::NotificationProcessor,
    repository::build_repository,
    sender::BatchSender,
    templates::HtmlTemplateRenderer,
    transport::build_transport,
};

const SERVICE_NAME: &str = "notification-worker";

#[tokio::main]
async fn main() -> Result<()> {
    // 1. .env 只在本地开发存在，缺失不是错误
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Failed to load .env: {e}");
    }

    // 2. 加载配置，非法的处理参数在这里直接终止启动
    let config = AppConfig::load(SERVICE_NAME)?;

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        topic = %config.kafka.topic,
        batch_size = config.processor.batch_size,
        max_retries = config.processor.max_retries,
        retry_delay_seconds = config.processor.retry_delay_seconds,
        send_concurrency = config.processor.send_concurrency,
        "Starting notification-worker..."
    );

    // 3. 组装处理链路
    let repository = build_repository(&config).await?;
    let transport = build_transport(&config.email)?;
    let sender = BatchSender::new(
        transport,
        RetryPolicy::from_config(&config.processor),
        config.processor.send_concurrency,
    );
    let processor = Arc::new(NotificationProcessor::new(
        repository,
        Arc::new(HtmlTemplateRenderer::new()),
        sender,
        config.processor.batch_size,
    ));

    let producer = KafkaProducer::new(&config.kafka)?;
    let consumer = KafkaConsumer::new(&config.kafka, Some("notifications"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 4. 可选的 HTTP 触发入口
    let api_handle = if config.api.enabled {
        let state = ApiState {
            publisher: Arc::new(KafkaPublisher::new(producer.clone(), &config.kafka.topic)),
            service_name: config.service_name.clone(),
        };
        let addr = config.api_addr();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&addr, state, rx).await {
                error!(error = %e, "通知触发接口异常退出");
            }
        }))
    } else {
        None
    };

    // 5. 关闭信号转发到 watch 通道，由监听器与 HTTP 服务共同消费
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let listener = QueueListener::new(consumer, producer, processor, &config.kafka.topic);
    listener.run(shutdown_rx).await?;

    if let Some(handle) = api_handle
        && let Err(e) = handle.await
    {
        warn!(error = %e, "等待 HTTP 服务退出失败");
    }

    info!("notification-worker shutdown complete");
    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
