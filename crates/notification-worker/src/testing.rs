//! 测试用的可编排邮件通道

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::DeliveryError;
use crate::transport::EmailTransport;

#[derive(Debug, Clone, Copy)]
enum Script {
    AlwaysTransient,
    AlwaysPermanent,
    TransientTimes(u32),
}

/// 按收件人预设投递结果，未预设的收件人一律成功
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: HashMap<String, Script>,
    latency: Option<Duration>,
    attempts: Mutex<HashMap<String, u32>>,
    bodies: Mutex<HashMap<String, String>>,
    first_attempted: Mutex<HashMap<String, Instant>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_transient(mut self, email: &str) -> Self {
        self.scripts.insert(email.to_string(), Script::AlwaysTransient);
        self
    }

    pub fn always_permanent(mut self, email: &str) -> Self {
        self.scripts.insert(email.to_string(), Script::AlwaysPermanent);
        self
    }

    /// 前 n 次瞬时失败，之后成功
    pub fn transient_times(mut self, email: &str, times: u32) -> Self {
        self.scripts.insert(email.to_string(), Script::TransientTimes(times));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn attempts(&self, email: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(email)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.lock().unwrap().values().sum()
    }

    pub fn last_body(&self, email: &str) -> Option<String> {
        self.bodies.lock().unwrap().get(email).cloned()
    }

    /// 收件人第一次被投递的时刻
    pub fn first_attempted_at(&self, email: &str) -> Option<Instant> {
        self.first_attempted.lock().unwrap().get(email).copied()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailTransport for ScriptedTransport {
    async fn deliver(
        &self,
        to_email: &str,
        _to_name: &str,
        _subject: &str,
        body: &str,
    ) -> Result<(), DeliveryError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let counter = attempts.entry(to_email.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.bodies
            .lock()
            .unwrap()
            .insert(to_email.to_string(), body.to_string());
        self.first_attempted
            .lock()
            .unwrap()
            .entry(to_email.to_string())
            .or_insert_with(Instant::now);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.scripts.get(to_email) {
            None => Ok(()),
            Some(Script::AlwaysTransient) => Err(DeliveryError::Transient("smtp timeout".into())),
            Some(Script::AlwaysPermanent) => {
                Err(DeliveryError::Permanent("550 mailbox unavailable".into()))
            }
            Some(Script::TransientTimes(times)) if attempt <= *times => {
                Err(DeliveryError::Transient("421 try again later".into()))
            }
            Some(Script::TransientTimes(_)) => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
