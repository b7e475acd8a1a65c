//! 邮件模板
//!
//! 每种通知类型对应一套 HTML 模板。模板在每条消息处理前渲染一次，
//! 收件人称呼以占位符保留在正文中，发送时再按收件人替换。

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime};

use crate::error::ConfigurationError;
use crate::model::{EventDetails, EventId, NotificationType};

/// 正文中收件人称呼的占位符
const RECIPIENT_PLACEHOLDER: &str = "{{recipient_name}}";

/// 渲染完成的邮件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

impl RenderedEmail {
    /// 为具体收件人生成正文
    pub fn body_for(&self, recipient_name: &str) -> String {
        self.body
            .replace(RECIPIENT_PLACEHOLDER, &escape_html(recipient_name))
    }
}

/// 模板渲染 trait
///
/// 找不到模板或渲染失败属于配置问题，对当前消息是致命的。
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        kind: NotificationType,
        event_id: &EventId,
        event: Option<&EventDetails>,
    ) -> Result<RenderedEmail, ConfigurationError>;
}

// ---------------------------------------------------------------------------
// EmailTemplate
// ---------------------------------------------------------------------------

/// 单个通知类型的 HTML 模板定义
#[derive(Debug, Clone)]
pub struct EmailTemplate {
    /// 标题前缀，后接活动名称
    pub subject_prefix: &'static str,
    pub heading: &'static str,
    pub intro: &'static str,
    pub closing: &'static str,
    /// 主题色
    pub accent: &'static str,
    /// 取消类通知只展示原定时间段，不展示剩余座位
    pub cancelled_layout: bool,
}

impl EmailTemplate {
    fn created() -> Self {
        Self {
            subject_prefix: "New Event",
            heading: "New Event Created",
            intro: "You have been added as a participant to a new event. We're excited to have you join us!",
            closing: "We look forward to seeing you at the event!",
            accent: "#2196F3",
            cancelled_layout: false,
        }
    }

    fn updated() -> Self {
        Self {
            subject_prefix: "Event Updated",
            heading: "Event Updated",
            intro: "The event you are registered for has been updated. Please review the latest details below:",
            closing: "Please make note of any changes to the event schedule or location.",
            accent: "#4CAF50",
            cancelled_layout: false,
        }
    }

    fn cancelled() -> Self {
        Self {
            subject_prefix: "Event Cancelled",
            heading: "Event Cancelled",
            intro: "We regret to inform you that the following event has been cancelled:",
            closing: "We apologize for any inconvenience this may cause.",
            accent: "#f44336",
            cancelled_layout: true,
        }
    }

    fn render(&self, event_id: &EventId, event: Option<&EventDetails>) -> RenderedEmail {
        let empty = EventDetails::default();
        let event = event.unwrap_or(&empty);

        let event_name = event
            .event_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("event #{event_id}"));

        let location = escape_html(event.location.as_deref().unwrap_or("TBA"));
        let start = event
            .start_time
            .as_deref()
            .map(format_start_time)
            .unwrap_or_else(|| "TBA".to_string());
        let end = event
            .end_time
            .as_deref()
            .map(format_end_time)
            .unwrap_or_else(|| "TBA".to_string());

        let mut rows = vec![detail_row("Location", &location)];
        if self.cancelled_layout {
            rows.push(detail_row(
                "Was Scheduled",
                &format!("{} - {}", escape_html(&start), escape_html(&end)),
            ));
        } else {
            rows.push(detail_row("Start Time", &escape_html(&start)));
            rows.push(detail_row("End Time", &escape_html(&end)));
            if let Some(seats) = event.remaining_seats {
                rows.push(detail_row(
                    "Available Seats",
                    &format!("{seats} seats remaining"),
                ));
            }
        }
        if let Some(description) = event.description.as_deref().filter(|d| !d.trim().is_empty()) {
            rows.push(detail_row("Description", &escape_html(description)));
        }

        let body = format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <style>
        body {{ font-family: Arial, sans-serif; line-height: 1.6; color: #333; }}
        .container {{ max-width: 600px; margin: 0 auto; padding: 20px; }}
        .header {{ background-color: {accent}; color: white; padding: 20px; text-align: center; }}
        .content {{ background-color: #f9f9f9; padding: 30px; }}
        .event-details {{ background-color: white; padding: 20px; margin: 20px 0; border-left: 4px solid {accent}; }}
        .label {{ font-weight: bold; color: #555; }}
        .footer {{ text-align: center; margin-top: 20px; color: #777; font-size: 12px; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="header"><h1>{heading}</h1></div>
        <div class="content">
            <p>Hello {recipient},</p>
            <p>{intro}</p>
            <div class="event-details">
                <h2 style="margin-top: 0; color: {accent};">{name}</h2>
{rows}
            </div>
            <p>{closing}</p>
        </div>
        <div class="footer">
            <p>Event ID: {event_id}</p>
            <p>This is an automated notification. Please do not reply to this email.</p>
        </div>
    </div>
</body>
</html>
"#,
            accent = self.accent,
            heading = self.heading,
            recipient = RECIPIENT_PLACEHOLDER,
            intro = escape_html(self.intro),
            name = escape_html(&event_name),
            rows = rows.join("\n"),
            closing = escape_html(self.closing),
            event_id = escape_html(event_id.as_str()),
        );

        RenderedEmail {
            subject: format!("{}: {}", self.subject_prefix, event_name),
            body,
        }
    }
}

fn detail_row(label: &str, value: &str) -> String {
    format!(
        r#"                <div class="detail-row"><span class="label">{label}:</span> <span class="value">{value}</span></div>"#
    )
}

// ---------------------------------------------------------------------------
// HtmlTemplateRenderer
// ---------------------------------------------------------------------------

/// 内置 HTML 模板渲染器
pub struct HtmlTemplateRenderer {
    templates: HashMap<NotificationType, EmailTemplate>,
}

impl HtmlTemplateRenderer {
    /// 加载全部内置模板
    pub fn new() -> Self {
        let templates = NotificationType::ALL
            .into_iter()
            .map(|kind| {
                let template = match kind {
                    NotificationType::Created => EmailTemplate::created(),
                    NotificationType::Updated => EmailTemplate::updated(),
                    NotificationType::Cancelled => EmailTemplate::cancelled(),
                };
                (kind, template)
            })
            .collect();
        Self { templates }
    }

    /// 使用自定义模板集合
    pub fn with_templates(templates: HashMap<NotificationType, EmailTemplate>) -> Self {
        Self { templates }
    }
}

impl Default for HtmlTemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for HtmlTemplateRenderer {
    fn render(
        &self,
        kind: NotificationType,
        event_id: &EventId,
        event: Option<&EventDetails>,
    ) -> Result<RenderedEmail, ConfigurationError> {
        let template = self
            .templates
            .get(&kind)
            .ok_or_else(|| ConfigurationError::MissingTemplate {
                kind: kind.to_string(),
            })?;

        Ok(template.render(event_id, event))
    }
}

// ---------------------------------------------------------------------------
// 格式化工具
// ---------------------------------------------------------------------------

fn parse_time(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.naive_local())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// 开始时间格式化为 "March 05, 2025 at 02:30 PM"，无法解析时原样返回
fn format_start_time(raw: &str) -> String {
    parse_time(raw)
        .map(|dt| dt.format("%B %d, %Y at %I:%M %p").to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// 结束时间只保留时分
fn format_end_time(raw: &str) -> String {
    parse_time(raw)
        .map(|dt| dt.format("%I:%M %p").to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// 花括号一并转义，活动字段里出现的收件人占位符不会被替换
fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            '{' => escaped.push_str("&#123;"),
            '}' => escaped.push_str("&#125;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
