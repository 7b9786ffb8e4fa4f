//! 内存流索引
//!
//! 事件日志的派生缓存：按 `(stream, id)` O(1) 查找，按序列号有序迭代。
//! 只在日志提交成功后经由 `apply` / `remove` 修改，启动时按序列号升序重放重建。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use pk_core::{Item, ItemId, Sequence};

/// 列表默认条数
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// 列表最大条数
pub const MAX_LIST_LIMIT: usize = 500;

/// 列表查询
#[derive(Debug, Clone)]
pub struct ListQuery {
    /// 限定的流；`None` 表示全部
    pub streams: Option<Vec<String>>,
    /// 自由文本过滤
    pub text: Option<String>,
    /// 载荷字段精确过滤
    pub fields: Vec<(String, String)>,
    /// 游标：只返回序列号小于该值的条目
    pub before: Option<Sequence>,
    /// 返回条数上限
    pub limit: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            streams: None,
            text: None,
            fields: Vec::new(),
            before: None,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

impl ListQuery {
    /// 单流查询
    pub fn stream(slug: impl Into<String>) -> Self {
        Self {
            streams: Some(vec![slug.into()]),
            ..Default::default()
        }
    }

    fn matches(&self, item: &Item) -> bool {
        if let Some(streams) = &self.streams {
            if !streams.iter().any(|s| s == &item.stream) {
                return false;
            }
        }
        if !self
            .fields
            .iter()
            .all(|(key, value)| item.matches_field(key, value))
        {
            return false;
        }
        match &self.text {
            Some(text) => item.matches_text(text),
            None => true,
        }
    }
}

/// 列表结果页
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// 按序列号降序
    pub items: Vec<Arc<Item>>,
    /// 还有更多结果时，下一页游标
    pub next_cursor: Option<Sequence>,
}

#[derive(Default)]
struct Index {
    /// stream -> id -> 当前序列号
    by_key: HashMap<String, HashMap<ItemId, Sequence>>,
    /// 序列号 -> 条目
    by_seq: BTreeMap<Sequence, Arc<Item>>,
}

/// 内存流索引
#[derive(Default)]
pub struct StreamStore {
    index: RwLock<Index>,
}

impl StreamStore {
    /// 创建空索引
    pub fn new() -> Self {
        Self::default()
    }

    /// 从日志重放结果重建
    pub fn rebuild(items: impl IntoIterator<Item = Item>) -> Self {
        let store = Self::new();
        for item in items {
            store.apply(Arc::new(item));
        }
        store
    }

    /// 应用一次已提交的变更：新 ID 插入，已有 ID 替换并移动到新序列号
    ///
    /// 返回 `false` 表示该条目比索引中的版本旧，已忽略。
    pub fn apply(&self, item: Arc<Item>) -> bool {
        let mut index = self.index.write();
        let Index { by_key, by_seq } = &mut *index;

        let ids = by_key.entry(item.stream.clone()).or_default();
        if let Some(previous) = ids.get(&item.id).copied() {
            if previous >= item.sequence {
                return false;
            }
            by_seq.remove(&previous);
        }
        ids.insert(item.id.clone(), item.sequence);
        by_seq.insert(item.sequence, item);
        true
    }

    /// 移除条目
    pub fn remove(&self, stream: &str, id: &str) -> Option<Arc<Item>> {
        let mut index = self.index.write();
        let Index { by_key, by_seq } = &mut *index;
        let sequence = by_key.get_mut(stream)?.remove(id)?;
        by_seq.remove(&sequence)
    }

    /// 按 ID 查找
    pub fn get(&self, stream: &str, id: &str) -> Option<Arc<Item>> {
        let index = self.index.read();
        let sequence = index.by_key.get(stream)?.get(id)?;
        index.by_seq.get(sequence).cloned()
    }

    /// 最近优先的分页列表
    pub fn list(&self, query: &ListQuery) -> Page {
        let limit = query.limit.clamp(1, MAX_LIST_LIMIT);
        let index = self.index.read();

        let range = match query.before {
            Some(before) => index.by_seq.range(..before),
            None => index.by_seq.range(..),
        };

        let mut items: Vec<Arc<Item>> = range
            .rev()
            .map(|(_, item)| item)
            .filter(|item| query.matches(item))
            .take(limit + 1)
            .cloned()
            .collect();

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|item| item.sequence)
        } else {
            None
        };

        Page { items, next_cursor }
    }

    /// 序列号大于 `after` 的全部条目 (升序)，用于断线重连回放
    pub fn since(&self, stream: Option<&str>, after: Sequence) -> Vec<Arc<Item>> {
        let index = self.index.read();
        index
            .by_seq
            .range(after.saturating_add(1)..)
            .map(|(_, item)| item)
            .filter(|item| stream.map_or(true, |s| item.stream == s))
            .cloned()
            .collect()
    }

    /// 索引中最大的序列号
    pub fn max_sequence(&self) -> Option<Sequence> {
        self.index.read().by_seq.keys().next_back().copied()
    }

    /// 条目总数
    pub fn len(&self) -> usize {
        self.index.read().by_seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pk_core::RenderedView;
    use serde_json::json;

    fn item(stream: &str, id: &str, sequence: Sequence, title: &str) -> Arc<Item> {
        let now = Utc::now();
        Arc::new(Item {
            stream: stream.into(),
            id: id.into(),
            sequence,
            created_at: now,
            updated_at: now,
            data: json!({ "title": title, "env": if sequence % 2 == 0 { "prod" } else { "dev" } }),
            view: RenderedView {
                title: title.into(),
                ..Default::default()
            },
            highlights: vec![],
        })
    }

    #[test]
    fn test_apply_replaces_and_reorders() {
        let store = StreamStore::new();
        store.apply(item("s", "a", 1, "first"));
        store.apply(item("s", "b", 2, "second"));
        store.apply(item("s", "a", 3, "updated"));

        assert_eq!(store.len(), 2);
        let page = store.list(&ListQuery::stream("s"));
        let ids: Vec<_> = page.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.get("s", "a").unwrap().view.title, "updated");
    }

    #[test]
    fn test_stale_apply_is_ignored() {
        let store = StreamStore::new();
        store.apply(item("s", "a", 5, "new"));
        assert!(!store.apply(item("s", "a", 4, "old")));
        assert_eq!(store.get("s", "a").unwrap().sequence, 5);
    }

    #[test]
    fn test_pagination_cursor() {
        let store = StreamStore::new();
        for seq in 1..=5 {
            store.apply(item("s", &format!("i{}", seq), seq, "t"));
        }
        let first = store.list(&ListQuery {
            limit: 2,
            ..ListQuery::stream("s")
        });
        assert_eq!(first.items.iter().map(|i| i.sequence).collect::<Vec<_>>(), vec![5, 4]);
        assert_eq!(first.next_cursor, Some(4));

        let second = store.list(&ListQuery {
            limit: 2,
            before: first.next_cursor,
            ..ListQuery::stream("s")
        });
        assert_eq!(second.items.iter().map(|i| i.sequence).collect::<Vec<_>>(), vec![3, 2]);

        let last = store.list(&ListQuery {
            limit: 2,
            before: Some(2),
            ..ListQuery::stream("s")
        });
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_cursor, None);
    }

    #[test]
    fn test_filters() {
        let store = StreamStore::new();
        store.apply(item("a", "1", 1, "alpha"));
        store.apply(item("b", "2", 2, "beta"));
        store.apply(item("a", "3", 3, "gamma"));

        let all = store.list(&ListQuery::default());
        assert_eq!(all.items.len(), 3);

        let text = store.list(&ListQuery {
            text: Some("BETA".into()),
            ..Default::default()
        });
        assert_eq!(text.items.len(), 1);
        assert_eq!(text.items[0].stream, "b");

        let fields = store.list(&ListQuery {
            fields: vec![("env".into(), "dev".into())],
            ..ListQuery::stream("a")
        });
        assert_eq!(fields.items.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec!["3", "1"]);
    }

    #[test]
    fn test_remove_and_since() {
        let store = StreamStore::new();
        store.apply(item("a", "1", 1, "x"));
        store.apply(item("b", "2", 2, "y"));
        store.apply(item("a", "3", 3, "z"));

        assert_eq!(store.since(None, 1).len(), 2);
        assert_eq!(store.since(Some("a"), 0).iter().map(|i| i.sequence).collect::<Vec<_>>(), vec![1, 3]);

        assert!(store.remove("a", "1").is_some());
        assert!(store.get("a", "1").is_none());
        assert!(store.remove("a", "1").is_none());
        assert_eq!(store.max_sequence(), Some(3));
    }
}
