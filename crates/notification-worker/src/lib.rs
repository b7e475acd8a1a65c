//! 活动参与者通知服务
//!
//! 从 Kafka 消费活动变更通知，分页拉取该活动的参与者，按批并发发送邮件。
//! 单个收件人的失败只记录在批次结果里，不影响其他收件人与后续批次；
//! 消息级的失败（解码、模板、参与者查询）决定消息被确认、拒绝还是重投。

pub mod api;
pub mod error;
pub mod listener;
pub mod model;
pub mod processor;
pub mod repository;
pub mod sender;
pub mod templates;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;
