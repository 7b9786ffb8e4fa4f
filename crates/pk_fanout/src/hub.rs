//! 扇出中心
//!
//! 按全局序列号顺序把已提交的变更投递给匹配的订阅者。不同流的提交可能乱序到达，
//! 先到的高序号事件会暂存，直到前面的空位被发布或被 `skip` 释放。
//! 投递只向广播通道发送，慢订阅者不会拖住写入方。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use pk_core::{FeedEvent, Sequence};

use crate::subscription::{Subscription, SubscriptionFilter};

/// 默认订阅通道容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// 扇出中心配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 每个广播通道的容量 (订阅者最多可落后的事件数)
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// 广播通道：一个全局通道，外加每个流一个
struct Channels {
    all: broadcast::Sender<FeedEvent>,
    streams: HashMap<String, broadcast::Sender<FeedEvent>>,
}

impl Channels {
    fn receiver_count(&self) -> usize {
        self.all.receiver_count()
            + self
                .streams
                .values()
                .map(|sender| sender.receiver_count())
                .sum::<usize>()
    }
}

/// 重排缓冲
struct Reorder {
    /// 下一个应投递的序列号
    next: Sequence,
    /// 暂存的乱序事件；`None` 表示该序号已放弃
    pending: BTreeMap<Sequence, Option<FeedEvent>>,
}

struct HubInner {
    capacity: usize,
    next_id: AtomicU64,
    /// 停机后为 `None`，发送端随之释放
    channels: RwLock<Option<Channels>>,
    reorder: Mutex<Reorder>,
}

impl HubInner {
    fn deliver(&self, event: &FeedEvent) {
        let Some(stream) = event.stream() else {
            return;
        };
        let channels = self.channels.read();
        let Some(channels) = channels.as_ref() else {
            return;
        };
        // 没有接收端时 send 返回错误，直接忽略
        let _ = channels.all.send(event.clone());
        if let Some(sender) = channels.streams.get(stream) {
            let _ = sender.send(event.clone());
        }
    }

    fn settle(&self, sequence: Sequence, event: Option<FeedEvent>) {
        let mut reorder = self.reorder.lock();
        if sequence < reorder.next {
            tracing::warn!(sequence, next = reorder.next, "Ignoring late publication");
            return;
        }
        reorder.pending.insert(sequence, event);

        loop {
            let next = reorder.next;
            let Some(entry) = reorder.pending.remove(&next) else {
                break;
            };
            reorder.next = next + 1;
            if let Some(event) = entry {
                self.deliver(&event);
            }
        }
    }

    fn receiver(&self, filter: &SubscriptionFilter) -> broadcast::Receiver<FeedEvent> {
        let mut channels = self.channels.write();
        let Some(channels) = channels.as_mut() else {
            // 已停机：返回一个立即结束的接收端
            let (sender, receiver) = broadcast::channel(1);
            drop(sender);
            return receiver;
        };
        match filter {
            SubscriptionFilter::All => channels.all.subscribe(),
            SubscriptionFilter::Stream(slug) => channels
                .streams
                .entry(slug.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
        }
    }
}

/// 扇出中心 (可廉价克隆)
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    /// 创建扇出中心；`last_sequence` 为日志中已持久化的最大序列号
    pub fn new(config: HubConfig, last_sequence: Sequence) -> Self {
        let capacity = config.queue_capacity.max(1);
        Self {
            inner: Arc::new(HubInner {
                capacity,
                next_id: AtomicU64::new(1),
                channels: RwLock::new(Some(Channels {
                    all: broadcast::channel(capacity).0,
                    streams: HashMap::new(),
                })),
                reorder: Mutex::new(Reorder {
                    next: last_sequence + 1,
                    pending: BTreeMap::new(),
                }),
            }),
        }
    }

    /// 预先为已知流创建广播通道
    pub fn with_streams<'a>(self, streams: impl IntoIterator<Item = &'a str>) -> Self {
        if let Some(channels) = self.inner.channels.write().as_mut() {
            for slug in streams {
                channels
                    .streams
                    .entry(slug.to_string())
                    .or_insert_with(|| broadcast::channel(self.inner.capacity).0);
            }
        }
        self
    }

    /// 注册订阅者
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.inner.receiver(&filter);
        tracing::debug!(subscription = id, ?filter, "Subscriber attached");
        Subscription::new(id, filter, receiver)
    }

    /// 注册订阅者，同时返回接入时刻已投递到的序列号
    ///
    /// 投递在重排锁内进行，接入也持有该锁：序号不大于返回值的事件不会进入新订阅，
    /// 大于返回值的事件一定会进入。
    pub fn subscribe_at(&self, filter: SubscriptionFilter) -> (Subscription, Sequence) {
        let reorder = self.inner.reorder.lock();
        let subscription = self.subscribe(filter);
        (subscription, reorder.next - 1)
    }

    /// 发布已提交的变更 (按序列号排序后投递)
    pub fn publish(&self, sequence: Sequence, event: FeedEvent) {
        self.inner.settle(sequence, Some(event));
    }

    /// 释放一个未能提交的序列号
    pub fn skip(&self, sequence: Sequence) {
        self.inner.settle(sequence, None);
    }

    /// 已投递 (或放弃) 的最大序列号
    pub fn delivered_through(&self) -> Sequence {
        self.inner.reorder.lock().next - 1
    }

    /// 暂存等待空位的事件数
    pub fn held_back(&self) -> usize {
        self.inner.reorder.lock().pending.len()
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .channels
            .read()
            .as_ref()
            .map(Channels::receiver_count)
            .unwrap_or(0)
    }

    /// 关闭全部订阅 (停机时使用)；接收端读完已缓冲的事件后结束
    pub fn close_all(&self) {
        let closed = self.inner.channels.write().take();
        let count = closed.as_ref().map(Channels::receiver_count).unwrap_or(0);
        tracing::info!("Closed {} live subscription(s)", count);
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(HubConfig::default(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pk_core::{Item, RenderedView, Retraction};
    use tokio_test::{assert_pending, assert_ready, task};

    fn upsert(stream: &str, id: &str, sequence: Sequence) -> FeedEvent {
        let now = Utc::now();
        FeedEvent::Upsert(Arc::new(Item {
            stream: stream.into(),
            id: id.into(),
            sequence,
            created_at: now,
            updated_at: now,
            data: serde_json::json!({}),
            view: RenderedView::default(),
            highlights: vec![],
        }))
    }

    fn sequences(sub: &mut Subscription) -> Vec<Option<Sequence>> {
        std::iter::from_fn(|| sub.try_recv()).map(|e| e.sequence()).collect()
    }

    #[test]
    fn test_filtered_delivery() {
        let hub = FanoutHub::default();
        let mut all = hub.subscribe(SubscriptionFilter::All);
        let mut deploys = hub.subscribe(SubscriptionFilter::Stream("deploys".into()));

        hub.publish(1, upsert("deploys", "a", 1));
        hub.publish(2, upsert("alerts", "b", 2));

        assert_eq!(sequences(&mut all), vec![Some(1), Some(2)]);
        assert_eq!(sequences(&mut deploys), vec![Some(1)]);
    }

    #[test]
    fn test_out_of_order_publications_are_held() {
        let hub = FanoutHub::default();
        let mut all = hub.subscribe(SubscriptionFilter::All);

        hub.publish(2, upsert("b", "x", 2));
        assert!(all.try_recv().is_none());
        assert_eq!(hub.held_back(), 1);

        hub.publish(1, upsert("a", "y", 1));
        assert_eq!(sequences(&mut all), vec![Some(1), Some(2)]);
        assert_eq!(hub.delivered_through(), 2);
    }

    #[test]
    fn test_skip_releases_gap() {
        let hub = FanoutHub::new(HubConfig::default(), 10);
        let mut all = hub.subscribe(SubscriptionFilter::All);

        hub.publish(12, upsert("a", "x", 12));
        hub.skip(11);
        assert_eq!(sequences(&mut all), vec![Some(12)]);
    }

    #[test]
    fn test_overflow_yields_gap_marker() {
        let hub = FanoutHub::new(HubConfig { queue_capacity: 2 }, 0);
        let mut sub = hub.subscribe(SubscriptionFilter::All);

        for seq in 1..=5 {
            hub.publish(seq, upsert("a", &format!("i{}", seq), seq));
        }

        match sub.try_recv() {
            Some(FeedEvent::Gap { dropped }) => assert_eq!(dropped, 3),
            other => panic!("expected gap, got {:?}", other),
        }
        assert_eq!(sequences(&mut sub), vec![Some(4), Some(5)]);
    }

    #[test]
    fn test_subscribe_at_reports_delivered_cursor() {
        let hub = FanoutHub::default();
        hub.publish(1, upsert("a", "x", 1));
        hub.publish(3, upsert("a", "z", 3));

        // 2 尚未结算，3 被暂存
        let (mut sub, cursor) = hub.subscribe_at(SubscriptionFilter::All);
        assert_eq!(cursor, 1);
        assert!(sub.try_recv().is_none());

        hub.publish(2, upsert("b", "y", 2));
        assert_eq!(sequences(&mut sub), vec![Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn test_retraction_delivery() {
        let hub = FanoutHub::default();
        let mut sub = hub.subscribe(SubscriptionFilter::Stream("a".into()));
        hub.publish(
            1,
            FeedEvent::Retract(Retraction {
                stream: "a".into(),
                id: "x".into(),
                sequence: 1,
            }),
        );
        match sub.recv().await {
            Some(FeedEvent::Retract(r)) => assert_eq!(r.id, "x"),
            other => panic!("expected retraction, got {:?}", other),
        }
    }

    #[test]
    fn test_recv_wakes_on_publish() {
        let hub = FanoutHub::default();
        let mut sub = hub.subscribe(SubscriptionFilter::All);
        let mut recv = task::spawn(sub.recv());
        assert_pending!(recv.poll());

        hub.publish(1, upsert("a", "x", 1));
        assert!(recv.is_woken());
        let event = assert_ready!(recv.poll());
        assert_eq!(event.and_then(|e| e.sequence()), Some(1));
    }

    #[test]
    fn test_unsubscribe_releases_receiver() {
        let hub = FanoutHub::default().with_streams(["a"]);
        let all = hub.subscribe(SubscriptionFilter::All);
        let stream = hub.subscribe(SubscriptionFilter::Stream("a".into()));
        assert_eq!(hub.subscriber_count(), 2);
        all.unsubscribe();
        drop(stream);
        assert_eq!(hub.subscriber_count(), 0);
        hub.publish(1, upsert("a", "x", 1));
    }

    #[test]
    fn test_close_all_ends_receivers() {
        let hub = FanoutHub::default();
        let mut sub = hub.subscribe(SubscriptionFilter::All);
        let mut recv = task::spawn(sub.recv());
        assert_pending!(recv.poll());

        hub.close_all();
        assert!(assert_ready!(recv.poll()).is_none());
        drop(recv);
        assert_eq!(hub.subscriber_count(), 0);

        let mut late = hub.subscribe(SubscriptionFilter::All);
        assert!(tokio_test::block_on(late.recv()).is_none());
    }
}
