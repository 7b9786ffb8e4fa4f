//! 合并键解析

use serde_json::Value;

use pk_render::StreamConfig;

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedKey {
    /// 新建条目 (生成新 ID)
    Create,
    /// 按键创建或原地更新
    Upsert(String),
}

impl ResolvedKey {
    /// 转换为日志提交所需的可选键
    pub fn into_key(self) -> Option<String> {
        match self {
            ResolvedKey::Create => None,
            ResolvedKey::Upsert(key) => Some(key),
        }
    }
}

/// 根据流的合并键模板判定新建还是更新
///
/// 未配置模板、渲染结果为空白或求值失败时一律新建；失败只记录日志，不中断摄取。
/// 非空结果原样作为条目 ID。
pub fn resolve(config: &StreamConfig, payload: &Value) -> ResolvedKey {
    match config.coalesce_key(payload) {
        Ok(Some(key)) if !key.trim().is_empty() => ResolvedKey::Upsert(key),
        Ok(_) => ResolvedKey::Create,
        Err(err) => {
            tracing::warn!(
                stream = %config.slug,
                error = %err,
                "Coalesce template failed, creating a new item"
            );
            ResolvedKey::Create
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(coalesce: Option<&str>) -> StreamConfig {
        let mut text = String::from(
            "display_name = \"Deploys\"\n[fields]\nbadge = \"\"\ntitle = \"{{ title }}\"\nlink = \"\"\ndescription = \"\"\n",
        );
        if let Some(tpl) = coalesce {
            text.push_str(&format!("coalesce = {:?}\n", tpl));
        }
        StreamConfig::from_toml_str("deploys", &text, "deploys.toml").unwrap()
    }

    #[test]
    fn test_no_template_creates() {
        let cfg = config(None);
        assert_eq!(resolve(&cfg, &json!({"slug": "x"})), ResolvedKey::Create);
    }

    #[test]
    fn test_rendered_key_is_used_verbatim() {
        let cfg = config(Some("{{ slug }}"));
        assert_eq!(
            resolve(&cfg, &json!({"slug": " deploy "})),
            ResolvedKey::Upsert(" deploy ".to_string())
        );
    }

    #[test]
    fn test_blank_key_creates() {
        let cfg = config(Some("{{ slug }}"));
        assert_eq!(resolve(&cfg, &json!({})), ResolvedKey::Create);
        assert_eq!(resolve(&cfg, &json!({"slug": "   "})), ResolvedKey::Create);
    }

    #[test]
    fn test_failing_template_creates() {
        let cfg = config(Some("{{ tags | join(',') }}"));
        assert_eq!(resolve(&cfg, &json!({"tags": 5})), ResolvedKey::Create);
        assert_eq!(
            resolve(&cfg, &json!({"tags": ["a", "b"]})),
            ResolvedKey::Upsert("a,b".to_string())
        );
    }
}
