//! # pk_ingest - Peek Ingestion Coordinator
//!
//! 摄取入口 `ingest(stream, payload) -> Item`：合并键解析 → 渲染 → 持久化 → 索引 → 扇出。
//! 同一流内串行，不同流并行；提交失败时不产生任何可见变更。

pub mod coordinator;
pub mod resolver;

pub use coordinator::Ingestor;
pub use resolver::{resolve, ResolvedKey};

pub use pk_core::{PeekError, Result};
