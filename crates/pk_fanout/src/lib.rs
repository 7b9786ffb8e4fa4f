//! # pk_fanout - Peek Fanout Hub
//!
//! 扇出中心：管理实时订阅者 (全局 / 按流)，按提交顺序投递每次变更。
//! 投递走 `tokio::sync::broadcast` 通道：订阅者落后超过容量时最旧事件被覆盖，
//! 接收端收到 `Gap` 标记；写入方从不阻塞。

pub mod hub;
pub mod subscription;

pub use hub::{FanoutHub, HubConfig, DEFAULT_QUEUE_CAPACITY};
pub use subscription::{Subscription, SubscriptionFilter};
