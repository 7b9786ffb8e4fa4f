//! 全局错误处理机制

use thiserror::Error;

/// Peek 统一错误类型
#[derive(Error, Debug)]
pub enum PeekError {
    /// 未配置的流 slug
    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    /// 模板渲染 / 高亮规则求值失败
    #[error("Template error: {0}")]
    Template(String),

    /// 持久化存储失败
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 条目不存在
    #[error("Item '{id}' not found in stream '{stream}'")]
    NotFound { stream: String, id: String },

    /// 配置加载失败
    #[error("Config error: {0}")]
    Config(String),

    /// 请求载荷不合法
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PeekError {
    /// 构造 NotFound 错误
    pub fn not_found(stream: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            stream: stream.into(),
            id: id.into(),
        }
    }

    /// 是否为调用方错误 (4xx 语义)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownStream(_)
                | Self::Template(_)
                | Self::NotFound { .. }
                | Self::InvalidPayload(_)
        )
    }
}

/// 统一 Result 类型别名
pub type Result<T> = std::result::Result<T, PeekError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(PeekError::UnknownStream("x".into()).is_client_error());
        assert!(PeekError::not_found("deploys", "abc").is_client_error());
        assert!(!PeekError::Persistence("disk full".into()).is_client_error());
        assert_eq!(
            PeekError::not_found("deploys", "abc").to_string(),
            "Item 'abc' not found in stream 'deploys'"
        );
    }
}
