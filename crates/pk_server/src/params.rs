//! 查询参数解析

use pk_core::Sequence;
use pk_durable::{ListQuery, MAX_LIST_LIMIT};

use crate::error::{ApiError, ApiResult};

/// 不会被当作字段过滤的参数名
const RESERVED_PARAMS: [&str; 5] = ["limit", "cursor", "q", "config", "after"];

/// 列表参数
#[derive(Debug, Default)]
pub struct ListParams {
    pub query: ListQuery,
    /// `config=<slug>` (可重复)，仅聚合列表使用
    pub configs: Vec<String>,
}

impl ListParams {
    /// 从原始 `key=value` 对解析
    pub fn parse(pairs: &[(String, String)]) -> ApiResult<Self> {
        let mut params = ListParams::default();

        for (key, value) in pairs {
            match key.as_str() {
                "limit" => {
                    let limit: i64 = value
                        .trim()
                        .parse()
                        .map_err(|_| ApiError::bad_request(format!("limit must be an integer, got '{}'", value)))?;
                    params.query.limit = limit.clamp(1, MAX_LIST_LIMIT as i64) as usize;
                }
                "cursor" => params.query.before = Some(parse_sequence("cursor", value)?),
                "q" => {
                    if !value.trim().is_empty() {
                        params.query.text = Some(value.trim().to_string());
                    }
                }
                "config" => {
                    if !value.is_empty() {
                        params.configs.push(value.clone());
                    }
                }
                key if RESERVED_PARAMS.contains(&key) => {}
                _ => params.query.fields.push((key.clone(), value.clone())),
            }
        }

        Ok(params)
    }
}

/// 解析序列号参数
pub fn parse_sequence(name: &str, value: &str) -> ApiResult<Sequence> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("{} must be a non-negative integer, got '{}'", name, value)))
}

/// 实时端点的回放起点：`?after=` 优先，其次 `Last-Event-ID`
pub fn replay_after(pairs: &[(String, String)], last_event_id: Option<&str>) -> ApiResult<Option<Sequence>> {
    if let Some((_, value)) = pairs.iter().find(|(key, _)| key == "after") {
        return parse_sequence("after", value).map(Some);
    }
    match last_event_id {
        Some(value) if !value.trim().is_empty() => parse_sequence("Last-Event-ID", value).map(Some),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pk_durable::DEFAULT_LIST_LIMIT;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let params = ListParams::parse(&[]).unwrap();
        assert_eq!(params.query.limit, DEFAULT_LIST_LIMIT);
        assert!(params.query.text.is_none());
        assert!(params.query.fields.is_empty());
    }

    #[test]
    fn test_limit_is_clamped() {
        let params = ListParams::parse(&pairs(&[("limit", "100000")])).unwrap();
        assert_eq!(params.query.limit, MAX_LIST_LIMIT);
        let params = ListParams::parse(&pairs(&[("limit", "-3")])).unwrap();
        assert_eq!(params.query.limit, 1);
        assert!(ListParams::parse(&pairs(&[("limit", "ten")])).is_err());
    }

    #[test]
    fn test_fields_cursor_and_configs() {
        let params = ListParams::parse(&pairs(&[
            ("cursor", "42"),
            ("q", " boom "),
            ("env", "prod"),
            ("config", "deploys"),
            ("config", "alerts"),
        ]))
        .unwrap();
        assert_eq!(params.query.before, Some(42));
        assert_eq!(params.query.text.as_deref(), Some("boom"));
        assert_eq!(params.query.fields, vec![("env".to_string(), "prod".to_string())]);
        assert_eq!(params.configs, vec!["deploys", "alerts"]);
        assert!(ListParams::parse(&pairs(&[("cursor", "x")])).is_err());
    }

    #[test]
    fn test_replay_after() {
        assert_eq!(replay_after(&[], None).unwrap(), None);
        assert_eq!(replay_after(&[], Some("7")).unwrap(), Some(7));
        assert_eq!(replay_after(&pairs(&[("after", "3")]), Some("7")).unwrap(), Some(3));
        assert!(replay_after(&pairs(&[("after", "x")]), None).is_err());
    }
}
