//! # pk_core - Peek Core Primitives
//!
//! 核心原语层，定义事件条目 (Item)、扇出事件枚举、全局错误处理机制。
//! 此 crate 是整个项目的基础依赖，不依赖其他业务 crate。

pub mod error;
pub mod event;
pub mod item;

pub use error::{PeekError, Result};
pub use event::{FeedEvent, Retraction};
pub use item::{Item, ItemId, RenderedView, Sequence};
