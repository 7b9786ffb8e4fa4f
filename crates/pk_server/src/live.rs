//! SSE 实时推送
//!
//! 事件类型：`message` (完整条目，`id` 为序列号)、`retract`、`gap`。
//! 带回放起点时先接入订阅并取得已投递游标，再补发游标之前的快照，
//! 之后的实时 upsert 按序列号去重。

use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;

use pk_core::{FeedEvent, Item, Sequence};
use pk_fanout::{Subscription, SubscriptionFilter};
use pk_ingest::Ingestor;

use crate::error::ApiResult;

/// 心跳间隔
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Serialize)]
struct GapNotice {
    dropped: u64,
}

fn item_event(item: &Item) -> Result<Event, axum::Error> {
    Event::default()
        .event("message")
        .id(item.sequence.to_string())
        .json_data(item)
}

fn feed_event(event: &FeedEvent) -> Result<Event, axum::Error> {
    match event {
        FeedEvent::Upsert(item) => item_event(item),
        FeedEvent::Retract(retraction) => Event::default()
            .event(event.kind())
            .id(retraction.sequence.to_string())
            .json_data(retraction),
        FeedEvent::Gap { dropped } => Event::default()
            .event(event.kind())
            .json_data(GapNotice { dropped: *dropped }),
    }
}

/// 订阅队列 -> SSE 事件流；`replayed_through` 及之前的 upsert 已通过回放发出
fn live_events(
    subscription: Subscription,
    replayed_through: Sequence,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    stream::unfold(subscription, move |mut subscription| async move {
        loop {
            let event = subscription.recv().await?;
            if let FeedEvent::Upsert(item) = &event {
                if item.sequence <= replayed_through {
                    continue;
                }
            }
            if let FeedEvent::Gap { dropped } = &event {
                tracing::debug!(subscription = subscription.id(), dropped, "Live client fell behind");
            }
            return Some((feed_event(&event), subscription));
        }
    })
}

/// 建立实时推送响应
pub fn open(
    ingestor: &Ingestor,
    filter: SubscriptionFilter,
    after: Option<Sequence>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let (subscription, backlog, replayed_through): (Subscription, Vec<Arc<Item>>, Sequence) =
        match after {
            Some(after) => ingestor.subscribe_from(filter, after)?,
            None => (ingestor.subscribe(filter)?, Vec::new(), 0),
        };

    tracing::info!(
        subscription = subscription.id(),
        filter = ?subscription.filter(),
        backlog = backlog.len(),
        "Live client attached"
    );

    let replay = stream::iter(backlog).map(|item| item_event(&item));
    let events = replay.chain(live_events(subscription, replayed_through));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(KEEP_ALIVE_INTERVAL)
            .text("keep-alive"),
    ))
}
