//! 邮件发送通道
//!
//! 通过 `EmailTransport` trait 抽象单封邮件的投递，每次投递的结果只有三种：
//! 成功、瞬时失败、永久失败。重试由上层批量发送器负责，通道本身只做一次尝试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use notifier_shared::config::{EmailConfig, EmailProvider};
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DeliveryError, NotificationError};

/// 邮件投递 trait，实现必须可在多个并发发送任务间共享
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn deliver(
        &self,
        to_email: &str,
        to_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError>;

    /// 通道名称，用于日志
    fn name(&self) -> &'static str;
}

/// 根据配置选择发送通道
pub fn build_transport(config: &EmailConfig) -> Result<Arc<dyn EmailTransport>, NotificationError> {
    if config.dummy_mode {
        info!("邮件通道处于模拟模式，不会真正发信");
        return Ok(Arc::new(DummyTransport::new()));
    }

    let transport: Arc<dyn EmailTransport> = match config.provider {
        EmailProvider::Smtp => Arc::new(SmtpTransport::new(config)?),
        EmailProvider::SendGrid => Arc::new(SendGridTransport::new(config)?),
    };
    info!(transport = transport.name(), "邮件通道已初始化");
    Ok(transport)
}

// ---------------------------------------------------------------------------
// 模拟通道
// ---------------------------------------------------------------------------

/// 模拟发送通道，只记录日志
pub struct DummyTransport {
    latency: Duration,
}

impl DummyTransport {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_millis(10),
        }
    }
}

impl Default for DummyTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailTransport for DummyTransport {
    async fn deliver(
        &self,
        to_email: &str,
        to_name: &str,
        subject: &str,
        _body: &str,
    ) -> Result<(), DeliveryError> {
        tokio::time::sleep(self.latency).await;

        info!(
            transport = "dummy",
            message_id = %Uuid::now_v7(),
            participant = to_email,
            name = to_name,
            subject,
            "模拟发送邮件"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}

// ---------------------------------------------------------------------------
// SMTP 通道
// ---------------------------------------------------------------------------

/// SMTP 发送通道
///
/// 连接池由 lettre 维护，启动时构建一次，所有发送任务共享。
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(config: &EmailConfig) -> Result<Self, NotificationError> {
        let from_address: Address = config.from_email.parse().map_err(|e| {
            NotificationError::TransportSetup(format!("发件地址无效 {}: {e}", config.from_email))
        })?;
        let from = Mailbox::new(Some(config.from_name.clone()), from_address);

        let mut builder = if config.smtp_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| NotificationError::TransportSetup(e.to_string()))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };

        builder = builder
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.timeout_seconds)));

        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }

    fn build_message(
        &self,
        to_email: &str,
        to_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<Message, DeliveryError> {
        let address: Address = to_email
            .parse()
            .map_err(|e| DeliveryError::Permanent(format!("收件地址无效: {e}")))?;

        Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(Some(to_name.to_string()), address))
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Permanent(format!("构造邮件失败: {e}")))
    }
}

#[async_trait]
impl EmailTransport for SmtpTransport {
    async fn deliver(
        &self,
        to_email: &str,
        to_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let message = self.build_message(to_email, to_name, subject, body)?;

        match self.mailer.send(message).await {
            Ok(response) => {
                debug!(participant = to_email, code = %response.code(), "SMTP 投递成功");
                Ok(())
            }
            // 5xx 表示服务器明确拒收；4xx、连接与超时错误都可能在重试时恢复
            Err(e) if e.is_permanent() => Err(DeliveryError::Permanent(e.to_string())),
            Err(e) => Err(DeliveryError::Transient(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

// ---------------------------------------------------------------------------
// SendGrid 通道
// ---------------------------------------------------------------------------

/// SendGrid HTTP API 发送通道
pub struct SendGridTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from_email: String,
    from_name: String,
}

impl SendGridTransport {
    pub fn new(config: &EmailConfig) -> Result<Self, NotificationError> {
        let api_key = config
            .sendgrid_api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| NotificationError::TransportSetup("缺少 sendgrid_api_key".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| NotificationError::TransportSetup(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/v3/mail/send",
                config.sendgrid_base_url.trim_end_matches('/')
            ),
            api_key,
            from_email: config.from_email.clone(),
            from_name: config.from_name.clone(),
        })
    }
}

/// 按 HTTP 状态码划分失败类型：429 与 5xx 可重试，其余 4xx 不可重试
fn classify_status(status: StatusCode, body: String) -> DeliveryError {
    let reason = format!("SendGrid 返回 {status}: {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryError::Transient(reason)
    } else {
        DeliveryError::Permanent(reason)
    }
}

#[async_trait]
impl EmailTransport for SendGridTransport {
    async fn deliver(
        &self,
        to_email: &str,
        to_name: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let payload = json!({
            "personalizations": [{
                "to": [{"email": to_email, "name": to_name}]
            }],
            "from": {"email": self.from_email, "name": self.from_name},
            "subject": subject,
            "content": [{"type": "text/html", "value": body}]
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("SendGrid 请求失败: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(participant = to_email, %status, "SendGrid 投递成功");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    fn name(&self) -> &'static str {
        "sendgrid"
    }
}
