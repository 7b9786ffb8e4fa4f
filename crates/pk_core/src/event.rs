//! 扇出事件定义

use std::sync::Arc;

use serde::Serialize;

use crate::item::{Item, ItemId, Sequence};

/// 推送给实时订阅者的事件
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// 条目被创建或合并更新
    Upsert(Arc<Item>),
    /// 条目被删除
    Retract(Retraction),
    /// 订阅队列溢出，丢弃了 `dropped` 个事件；客户端应重新拉取列表
    Gap { dropped: u64 },
}

/// 删除通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Retraction {
    pub stream: String,
    pub id: ItemId,
    pub sequence: Sequence,
}

impl FeedEvent {
    /// 事件所属的流 (Gap 不属于任何流)
    pub fn stream(&self) -> Option<&str> {
        match self {
            FeedEvent::Upsert(item) => Some(&item.stream),
            FeedEvent::Retract(r) => Some(&r.stream),
            FeedEvent::Gap { .. } => None,
        }
    }

    /// 事件的全局序列号
    pub fn sequence(&self) -> Option<Sequence> {
        match self {
            FeedEvent::Upsert(item) => Some(item.sequence),
            FeedEvent::Retract(r) => Some(r.sequence),
            FeedEvent::Gap { .. } => None,
        }
    }

    /// SSE 事件名
    pub fn kind(&self) -> &'static str {
        match self {
            FeedEvent::Upsert(_) => "message",
            FeedEvent::Retract(_) => "retract",
            FeedEvent::Gap { .. } => "gap",
        }
    }
}
