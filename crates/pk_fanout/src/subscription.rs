//! 订阅句柄
//!
//! 每个订阅者持有一个广播接收端。落后超过通道容量时最旧的事件被覆盖，
//! 接收端下一次读取先拿到 `Gap`，随后从仍保留的最旧事件继续。

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use pk_core::FeedEvent;

/// 订阅过滤器
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// 所有流
    All,
    /// 单个流
    Stream(String),
}

impl SubscriptionFilter {
    /// 是否匹配某个流
    pub fn matches(&self, stream: &str) -> bool {
        match self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Stream(slug) => slug == stream,
        }
    }

    /// 单流过滤时返回 slug
    pub fn stream(&self) -> Option<&str> {
        match self {
            SubscriptionFilter::All => None,
            SubscriptionFilter::Stream(slug) => Some(slug),
        }
    }
}

/// 订阅句柄
///
/// 丢弃句柄即退订；传输层连接关闭时句柄随之释放。
pub struct Subscription {
    id: u64,
    filter: SubscriptionFilter,
    receiver: broadcast::Receiver<FeedEvent>,
}

impl Subscription {
    pub(crate) fn new(id: u64, filter: SubscriptionFilter, receiver: broadcast::Receiver<FeedEvent>) -> Self {
        Self {
            id,
            filter,
            receiver,
        }
    }

    /// 等待下一个事件；订阅关闭后返回 `None`
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(dropped)) => Some(FeedEvent::Gap { dropped }),
            Err(RecvError::Closed) => None,
        }
    }

    /// 非阻塞读取
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(dropped)) => Some(FeedEvent::Gap { dropped }),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// 订阅 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 过滤器
    pub fn filter(&self) -> &SubscriptionFilter {
        &self.filter
    }

    /// 显式退订
    pub fn unsubscribe(self) {
        tracing::debug!(subscription = self.id, "Subscriber detached");
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish()
    }
}
