//! 批量发送器
//!
//! 对一个批次内的收件人并发发送，同时在途的发送数受 `concurrency` 限制，与批大小无关。
//! 许可只在一次投递期间持有，重试等待前归还。
//! 每个收件人独立走一遍状态机：
//!
//! ```text
//! Pending -> Attempting(1) -> Sent
//!                          -> Failed(permanent)
//!                          -> Retrying(1) -> Attempting(2) -> ... -> Failed(transient)
//! ```
//!
//! 重试等待只挂起当前收件人的任务，不影响同批次其他收件人。

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use notifier_shared::observability::metrics;
use notifier_shared::retry::RetryPolicy;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::DeliveryError;
use crate::model::{Batch, BatchResult, FailedRecipient, Participant, SendOutcome};
use crate::templates::RenderedEmail;
use crate::transport::EmailTransport;

/// 单个收件人的投递状态
#[derive(Debug, Clone, PartialEq, Eq)]
enum RecipientState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32, reason: String },
    Sent { attempts: u32 },
    Failed { attempts: u32, outcome: SendOutcome },
}

/// 收件人到达终态后的结果
struct RecipientResult {
    participant: Participant,
    outcome: SendOutcome,
    attempts: u32,
}

pub struct BatchSender {
    transport: Arc<dyn EmailTransport>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl BatchSender {
    pub fn new(transport: Arc<dyn EmailTransport>, policy: RetryPolicy, concurrency: usize) -> Self {
        Self {
            transport,
            policy,
            concurrency: concurrency.max(1),
        }
    }

    /// 发送一个批次，所有收件人到达终态后返回
    ///
    /// 返回值满足 `sent_count + failed.len() == batch.len()`。
    pub async fn send(&self, batch: &Batch, email: &RenderedEmail) -> BatchResult {
        let started = Instant::now();

        let permits = Semaphore::new(self.concurrency);

        let pending: Vec<_> = batch
            .participants
            .iter()
            .map(|participant| self.deliver_to(participant, email, &permits))
            .collect();
        let results = join_all(pending).await;

        let mut result = BatchResult {
            batch_index: batch.index,
            ..Default::default()
        };
        for recipient in results {
            metrics::record_email(recipient.outcome.label());
            match recipient.outcome {
                SendOutcome::Sent => result.sent_count += 1,
                SendOutcome::FailedTransient(reason) => result.failed.push(FailedRecipient {
                    participant: recipient.participant,
                    reason,
                    attempts: recipient.attempts,
                    permanent: false,
                }),
                SendOutcome::FailedPermanent(reason) => result.failed.push(FailedRecipient {
                    participant: recipient.participant,
                    reason,
                    attempts: recipient.attempts,
                    permanent: true,
                }),
            }
        }

        metrics::record_batch(batch.len(), started.elapsed().as_secs_f64());
        result
    }

    async fn deliver_to(
        &self,
        participant: &Participant,
        email: &RenderedEmail,
        permits: &Semaphore,
    ) -> RecipientResult {
        let body = email.body_for(&participant.name);
        let mut state = RecipientState::Pending;

        loop {
            state = match state {
                RecipientState::Pending => RecipientState::Attempting { attempt: 1 },

                RecipientState::Attempting { attempt } => {
                    let delivered = match permits.acquire().await {
                        Ok(_permit) => {
                            metrics::record_send_attempt(attempt > 1);
                            self.transport
                                .deliver(&participant.email, &participant.name, &email.subject, &body)
                                .await
                        }
                        Err(e) => Err(DeliveryError::Transient(format!("发送许可不可用: {e}"))),
                    };
                    self.next_state(attempt, delivered)
                }

                RecipientState::Retrying { attempt, reason } => {
                    let delay = self.policy.delay_for_attempt(attempt - 1);
                    warn!(
                        participant = %participant.email,
                        attempt,
                        max_attempts = self.policy.max_attempts(),
                        reason = %reason,
                        delay_ms = delay.as_millis() as u64,
                        "发送瞬时失败，等待后重试"
                    );
                    tokio::time::sleep(delay).await;
                    RecipientState::Attempting {
                        attempt: attempt + 1,
                    }
                }

                RecipientState::Sent { attempts } => {
                    debug!(participant = %participant.email, attempts, "邮件已发送");
                    return RecipientResult {
                        participant: participant.clone(),
                        outcome: SendOutcome::Sent,
                        attempts,
                    };
                }

                RecipientState::Failed { attempts, outcome } => {
                    warn!(
                        participant = %participant.email,
                        attempts,
                        outcome = outcome.label(),
                        reason = ?outcome,
                        "邮件发送失败"
                    );
                    return RecipientResult {
                        participant: participant.clone(),
                        outcome,
                        attempts,
                    };
                }
            };
        }
    }

    /// 根据一次投递结果推进状态
    ///
    /// 已重试次数为 attempt - 1，因此瞬时失败的收件人最多被尝试 1 + max_retries 次。
    fn next_state(&self, attempt: u32, delivered: Result<(), DeliveryError>) -> RecipientState {
        match delivered {
            Ok(()) => RecipientState::Sent { attempts: attempt },
            Err(DeliveryError::Permanent(reason)) => RecipientState::Failed {
                attempts: attempt,
                outcome: SendOutcome::FailedPermanent(reason),
            },
            Err(DeliveryError::Transient(reason)) if self.policy.should_retry(attempt - 1) => {
                RecipientState::Retrying { attempt, reason }
            }
            Err(DeliveryError::Transient(reason)) => RecipientState::Failed {
                attempts: attempt,
                outcome: SendOutcome::FailedTransient(reason),
            },
        }
    }
}
