//! 事件条目定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 全局序列号 (跨所有流单调递增)
pub type Sequence = u64;

/// 条目 ID (合并键或生成的 UUID)
pub type ItemId = String;

/// 渲染后的展示视图
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedView {
    pub badge: String,
    pub title: String,
    pub link: String,
    pub description: String,
}

/// 单条事件记录
///
/// `(stream, id)` 唯一；每次提交 (创建或合并更新) 都会分配新的 `sequence`，
/// `created_at` 与 `id` 在更新中保持不变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// 所属流 slug
    pub stream: String,
    /// 流内唯一 ID
    pub id: ItemId,
    /// 全局序列号
    pub sequence: Sequence,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最近一次提交时间
    pub updated_at: DateTime<Utc>,
    /// 原始载荷
    pub data: serde_json::Value,
    /// 渲染视图
    pub view: RenderedView,
    /// 高亮 CSS 类 (按规则顺序)
    pub highlights: Vec<String>,
}

impl Item {
    /// 生成新的进程内唯一条目 ID
    pub fn generate_id() -> ItemId {
        Uuid::new_v4().to_string()
    }

    /// 自由文本匹配 (不区分大小写)，覆盖视图字段与载荷顶层值
    pub fn matches_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        if needle.is_empty() {
            return true;
        }

        let view = [
            &self.view.badge,
            &self.view.title,
            &self.view.link,
            &self.view.description,
        ];
        if view.iter().any(|part| part.to_lowercase().contains(&needle)) {
            return true;
        }

        match &self.data {
            serde_json::Value::Object(map) => map
                .values()
                .any(|value| display_value(value).to_lowercase().contains(&needle)),
            _ => false,
        }
    }

    /// 载荷字段精确匹配；缺失字段按 `None` 比较
    pub fn matches_field(&self, key: &str, expected: &str) -> bool {
        let actual = self
            .data
            .get(key)
            .map(display_value)
            .unwrap_or_else(|| NONE_LITERAL.to_string());
        actual == expected
    }
}

const NONE_LITERAL: &str = "None";

/// 载荷值的文本形式
///
/// 字符串取原文；`null` 与布尔值写作 `None` / `True` / `False`，
/// 与既有客户端发出的过滤值一致；其余取紧凑 JSON。
pub fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => NONE_LITERAL.to_string(),
        serde_json::Value::Bool(true) => "True".to_string(),
        serde_json::Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Item {
        let now = Utc::now();
        Item {
            stream: "deploys".into(),
            id: "api".into(),
            sequence: 7,
            created_at: now,
            updated_at: now,
            data: json!({"slug": "api", "title": "Finished", "attempt": 3, "canary": true, "owner": null}),
            view: RenderedView {
                badge: "PROD".into(),
                title: "Finished".into(),
                link: "https://ci.example/api".into(),
                description: String::new(),
            },
            highlights: vec![],
        }
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        assert_ne!(Item::generate_id(), Item::generate_id());
    }

    #[test]
    fn test_text_match_covers_view_and_payload() {
        let item = sample();
        assert!(item.matches_text("prod"));
        assert!(item.matches_text("FINISHED"));
        assert!(item.matches_text("3"));
        assert!(!item.matches_text("staging"));
    }

    #[test]
    fn test_field_match_uses_display_form() {
        let item = sample();
        assert!(item.matches_field("slug", "api"));
        assert!(item.matches_field("attempt", "3"));
        assert!(!item.matches_field("missing", "x"));
        assert!(!item.matches_field("missing", ""));
        assert!(item.matches_field("missing", "None"));
        assert!(item.matches_field("owner", "None"));
        assert!(item.matches_field("canary", "True"));
        assert!(!item.matches_field("canary", "true"));
    }
}
