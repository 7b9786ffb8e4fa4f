//! # pk_render - Peek Render
//!
//! 渲染协作层：沙箱表达式语言、字符串模板与按流配置加载。
//! 渲染是纯函数 `render(config, payload) -> (view, highlights)`，失败时返回模板错误。

pub mod config;
pub mod error;
pub mod expr;
pub mod template;

pub use config::{ConfigSet, HighlightRule, Rendered, StreamConfig};
pub use error::{RenderError, RenderResult};
pub use expr::Expr;
pub use template::Template;
