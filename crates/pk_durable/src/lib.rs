//! # pk_durable - Peek Durable Log
//!
//! 持久化底座：SQLite 事件日志 (唯一事实来源) 与可重建的内存流索引。

pub mod event_store;
pub mod stream_store;

pub use event_store::{CommitRequest, EventStore, EventStoreConfig, PreparedCommit, WriteSlot};
pub use stream_store::{ListQuery, Page, StreamStore, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
