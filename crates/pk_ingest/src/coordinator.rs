//! 摄取协调器
//!
//! 每个流一条串行通道 (lane)：同一流的摄取 / 删除依次执行
//! `Resolving -> Rendering -> Committing -> Publishing`，不同流完全并行。
//! 进入 Committing 之后的步骤在独立任务中运行，调用方被取消也会跑完。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use pk_core::{FeedEvent, Item, PeekError, Result, Retraction, Sequence};
use pk_durable::{CommitRequest, EventStore, ListQuery, Page, StreamStore};
use pk_fanout::{FanoutHub, HubConfig, Subscription, SubscriptionFilter};
use pk_render::{ConfigSet, Rendered, StreamConfig};

use crate::resolver::{resolve, ResolvedKey};

/// 已分配但尚未结算的序列号；未结算即被丢弃时自动释放，保证扇出不会停滞
struct SequenceTicket<'a> {
    hub: &'a FanoutHub,
    sequence: Sequence,
    settled: bool,
}

impl<'a> SequenceTicket<'a> {
    fn new(hub: &'a FanoutHub, sequence: Sequence) -> Self {
        Self {
            hub,
            sequence,
            settled: false,
        }
    }

    fn publish(mut self, event: FeedEvent) {
        self.settled = true;
        self.hub.publish(self.sequence, event);
    }
}

impl Drop for SequenceTicket<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.hub.skip(self.sequence);
        }
    }
}

struct Shared {
    configs: Arc<ConfigSet>,
    log: EventStore,
    store: StreamStore,
    hub: FanoutHub,
    lanes: HashMap<String, Arc<Mutex<()>>>,
}

impl Shared {
    async fn commit_and_publish(
        &self,
        stream: String,
        key: ResolvedKey,
        rendered: Rendered,
        data: Value,
    ) -> Result<Arc<Item>> {
        let key = key.into_key();
        let prepared = CommitRequest {
            stream: stream.clone(),
            key: key.clone(),
            view: rendered.view,
            highlights: rendered.highlights,
            data,
        }
        .prepare()?;

        let slot = self.log.reserve().await;
        let ticket = SequenceTicket::new(&self.hub, slot.sequence());
        let item = match slot.commit(&prepared).await {
            Ok(item) => Arc::new(item),
            Err(err) => {
                tracing::error!(
                    stream = %stream,
                    id = key.as_deref().unwrap_or("<new>"),
                    sequence = ticket.sequence,
                    error = %err,
                    "Commit failed"
                );
                return Err(err);
            }
        };

        self.store.apply(item.clone());
        ticket.publish(FeedEvent::Upsert(item.clone()));

        tracing::info!(
            stream = %item.stream,
            id = %item.id,
            sequence = item.sequence,
            "Ingested item"
        );
        Ok(item)
    }

    async fn delete_and_retract(&self, stream: String, id: String) -> Result<()> {
        let slot = self.log.reserve().await;
        let ticket = SequenceTicket::new(&self.hub, slot.sequence());

        if let Err(err) = slot.delete(&stream, &id).await {
            match &err {
                PeekError::NotFound { .. } => {
                    tracing::info!(stream = %stream, id = %id, "Delete of missing item")
                }
                _ => tracing::error!(stream = %stream, id = %id, error = %err, "Delete failed"),
            }
            return Err(err);
        }

        self.store.remove(&stream, &id);
        let sequence = ticket.sequence;
        ticket.publish(FeedEvent::Retract(Retraction {
            stream: stream.clone(),
            id: id.clone(),
            sequence,
        }));

        tracing::info!(stream = %stream, id = %id, sequence, "Deleted item");
        Ok(())
    }
}

/// 摄取协调器 (可廉价克隆)
#[derive(Clone)]
pub struct Ingestor {
    shared: Arc<Shared>,
}

impl Ingestor {
    /// 启动：按序列号升序重放日志重建内存索引，并以日志高水位初始化扇出中心
    pub async fn start(configs: Arc<ConfigSet>, log: EventStore, hub_config: HubConfig) -> Result<Self> {
        let items = log.replay().await?;
        let orphaned = items
            .iter()
            .filter(|item| !configs.contains(&item.stream))
            .count();
        if orphaned > 0 {
            tracing::warn!("{} stored item(s) belong to streams that are no longer configured", orphaned);
        }

        let store = StreamStore::rebuild(items);
        let hub = FanoutHub::new(hub_config, log.last_sequence()).with_streams(configs.slugs());
        let lanes = configs
            .slugs()
            .map(|slug| (slug.to_string(), Arc::new(Mutex::new(()))))
            .collect();

        tracing::info!(
            "Ingestor ready: {} stream(s), {} item(s), last sequence {}",
            configs.len(),
            store.len(),
            log.last_sequence()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                configs,
                log,
                store,
                hub,
                lanes,
            }),
        })
    }

    fn stream(&self, slug: &str) -> Result<(&Arc<StreamConfig>, &Arc<Mutex<()>>)> {
        let config = self
            .shared
            .configs
            .get(slug)
            .ok_or_else(|| PeekError::UnknownStream(slug.to_string()))?;
        let lane = self
            .shared
            .lanes
            .get(slug)
            .ok_or_else(|| PeekError::UnknownStream(slug.to_string()))?;
        Ok((config, lane))
    }

    /// 摄取一条原始载荷，返回已提交的条目
    pub async fn ingest(&self, slug: &str, payload: Value) -> Result<Arc<Item>> {
        let (config, lane) = self.stream(slug)?;
        if !payload.is_object() {
            return Err(PeekError::InvalidPayload("Expected a JSON object".to_string()));
        }

        let guard = lane.clone().lock_owned().await;

        let key = resolve(config, &payload);
        let rendered = config.render(&payload).map_err(|err| {
            tracing::warn!(
                stream = %slug,
                id = ?key,
                error = %err,
                "Template rendering failed, event not committed"
            );
            PeekError::from(err)
        })?;

        let shared = self.shared.clone();
        let stream = slug.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            shared.commit_and_publish(stream, key, rendered, payload).await
        })
        .await
        .map_err(|err| PeekError::Persistence(format!("commit task aborted: {}", err)))?
    }

    /// 删除条目并发布撤回事件
    pub async fn delete(&self, slug: &str, id: &str) -> Result<()> {
        let (_, lane) = self.stream(slug)?;
        let guard = lane.clone().lock_owned().await;

        if self.shared.store.get(slug, id).is_none() {
            return Err(PeekError::not_found(slug, id));
        }

        let shared = self.shared.clone();
        let stream = slug.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            shared.delete_and_retract(stream, id).await
        })
        .await
        .map_err(|err| PeekError::Persistence(format!("delete task aborted: {}", err)))?
    }

    /// 读取单条
    pub fn get(&self, slug: &str, id: &str) -> Result<Arc<Item>> {
        self.stream(slug)?;
        self.shared
            .store
            .get(slug, id)
            .ok_or_else(|| PeekError::not_found(slug, id))
    }

    /// 单流列表
    pub fn list(&self, slug: &str, mut query: ListQuery) -> Result<Page> {
        self.stream(slug)?;
        query.streams = Some(vec![slug.to_string()]);
        Ok(self.shared.store.list(&query))
    }

    /// 跨流列表
    pub fn list_all(&self, query: &ListQuery) -> Page {
        self.shared.store.list(query)
    }

    /// 注册实时订阅
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription> {
        if let Some(slug) = filter.stream() {
            self.stream(slug)?;
        }
        Ok(self.shared.hub.subscribe(filter))
    }

    /// 注册订阅并回放 `after` 之后的已存条目
    ///
    /// 接入订阅的同时取得已投递游标 `cursor`：回放只含序号不超过 `cursor` 的条目，
    /// 之后的变更全部经由订阅送达，尚在提交中的低序号事件也不会漏掉。
    /// 返回的游标即回放覆盖到的位置。
    pub fn subscribe_from(
        &self,
        filter: SubscriptionFilter,
        after: Sequence,
    ) -> Result<(Subscription, Vec<Arc<Item>>, Sequence)> {
        if let Some(slug) = filter.stream() {
            self.stream(slug)?;
        }
        let (subscription, cursor) = self.shared.hub.subscribe_at(filter);
        let backlog: Vec<Arc<Item>> = self
            .shared
            .store
            .since(subscription.filter().stream(), after)
            .into_iter()
            .filter(|item| item.sequence <= cursor)
            .collect();
        Ok((subscription, backlog, cursor.max(after)))
    }

    /// 只读配置快照
    pub fn configs(&self) -> &Arc<ConfigSet> {
        &self.shared.configs
    }

    /// 扇出中心
    pub fn hub(&self) -> &FanoutHub {
        &self.shared.hub
    }

    /// 日志中已分配的最大序列号
    pub fn last_sequence(&self) -> Sequence {
        self.shared.log.last_sequence()
    }

    /// 停机：关闭全部实时订阅
    pub fn shutdown(&self) {
        self.shared.hub.close_all();
    }

    /// 关闭事件日志连接池 (服务停止后调用)
    pub async fn close(&self) {
        self.shared.log.close().await;
    }
}
