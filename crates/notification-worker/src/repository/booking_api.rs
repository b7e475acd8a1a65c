//! 预订服务 HTTP 仓储
//!
//! - `GET {base}/bookings/batch?event_id&offset&batch_size` 返回预订数组
//! - `GET {base}/bookings/count?event_id` 返回 `{"total_bookings": n}`
//!
//! 分页与有效预订的口径都由预订服务决定，这里不再做二次过滤，否则短页会被误判为最后一页。

use std::time::Duration;

use async_trait::async_trait;
use notifier_shared::config::BookingServiceConfig;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use super::traits::{ParticipantPage, ParticipantRepository};
use crate::error::{NotificationError, RepositoryError};
use crate::model::{EventId, Participant};

/// 预订记录，只取发信需要的字段
#[derive(Debug, Deserialize)]
struct BookingRecord {
    user_email: String,
}

#[derive(Debug, Deserialize)]
struct BookingCount {
    #[serde(default)]
    total_bookings: u64,
}

pub struct BookingApiRepository {
    client: reqwest::Client,
    base_url: String,
}

impl BookingApiRepository {
    pub fn new(config: &BookingServiceConfig) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| NotificationError::TransportSetup(format!("创建 HTTP 客户端失败: {e}")))?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!(base_url = %base_url, "预订服务客户端已初始化");

        Ok(Self { client, base_url })
    }
}

async fn unexpected_status(response: reqwest::Response) -> RepositoryError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RepositoryError::UnexpectedStatus { status, body }
}

#[async_trait]
impl ParticipantRepository for BookingApiRepository {
    async fn fetch_participants(
        &self,
        event_id: &EventId,
        offset: usize,
        limit: usize,
    ) -> Result<ParticipantPage, RepositoryError> {
        let response = self
            .client
            .get(format!("{}/bookings/batch", self.base_url))
            .query(&[
                ("event_id", event_id.as_str().to_string()),
                ("offset", offset.to_string()),
                ("batch_size", limit.to_string()),
            ])
            .send()
            .await?;

        // 404 表示该偏移量之后没有数据
        if response.status() == StatusCode::NOT_FOUND {
            debug!(event_id = %event_id, offset, "预订服务返回 404，视为空页");
            return Ok(ParticipantPage::empty());
        }
        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }

        let records: Vec<BookingRecord> = response.json().await?;
        let participants: Vec<Participant> = records
            .into_iter()
            .map(|r| Participant::from_email(r.user_email))
            .collect();

        debug!(event_id = %event_id, offset, count = participants.len(), "已获取一页预订");
        Ok(ParticipantPage::new(participants))
    }

    async fn count_participants(&self, event_id: &EventId) -> Result<u64, RepositoryError> {
        let response = self
            .client
            .get(format!("{}/bookings/count", self.base_url))
            .query(&[("event_id", event_id.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(unexpected_status(response).await);
        }

        let count: BookingCount = response.json().await?;
        Ok(count.total_bookings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repository(server: &MockServer) -> BookingApiRepository {
        BookingApiRepository::new(&BookingServiceConfig {
            base_url: format!("{}/", server.uri()),
            timeout_seconds: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_page_maps_bookings() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bookings/batch"))
            .and(query_param("event_id", "42"))
            .and(query_param("offset", "100"))
            .and(query_param("batch_size", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"booking_id": "b1", "event_id": "42", "user_id": "u1", "user_email": "alice@example.com"},
                {"booking_id": "b2", "event_id": "42", "user_id": "u2", "user_email": "bob@example.com", "status": "confirmed"},
                {"booking_id": "b3", "event_id": "42", "user_id": "u3", "user_email": "carol@example.com", "status": "cancelled"}
            ])))
            .mount(&server)
            .await;

        let page = repository(&server)
            .fetch_participants(&EventId::new("42"), 100, 100)
            .await
            .unwrap();

        assert!(!page.exhausted);
        assert_eq!(
            page.participants,
            vec![
                Participant::new("alice@example.com", "alice"),
                Participant::new("bob@example.com", "bob"),
                Participant::new("carol@example.com", "carol"),
            ]
        );
    }

    #[tokio::test]
    async fn test_not_found_is_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bookings/batch"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let page = repository(&server)
            .fetch_participants(&EventId::new("42"), 0, 100)
            .await
            .unwrap();
        assert!(page.participants.is_empty());
        assert!(page.exhausted);
    }

    #[tokio::test]
    async fn test_server_error_is_repository_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bookings/batch"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = repository(&server)
            .fetch_participants(&EventId::new("42"), 0, 100)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::UnexpectedStatus { status: 503, ref body } if body == "maintenance"
        ));
    }

    #[tokio::test]
    async fn test_count_participants() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bookings/count"))
            .and(query_param("event_id", "42"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"event_id": "42", "total_bookings": 250})),
            )
            .mount(&server)
            .await;

        let count = repository(&server)
            .count_participants(&EventId::new("42"))
            .await
            .unwrap();
        assert_eq!(count, 250);
    }
}
