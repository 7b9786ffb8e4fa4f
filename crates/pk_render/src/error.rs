//! 模板错误

use thiserror::Error;

use pk_core::PeekError;

/// 模板编译 / 求值错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// 语法错误 (加载配置时发现)
    #[error("syntax error: {0}")]
    Syntax(String),

    /// 求值错误 (渲染载荷时发现)
    #[error("evaluation error: {0}")]
    Eval(String),
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

impl From<RenderError> for PeekError {
    fn from(err: RenderError) -> Self {
        PeekError::Template(err.to_string())
    }
}
