//! 事件日志存储引擎 (SQLite)
//!
//! 每个 `(stream, id)` 一行；每次提交分配新的全局序列号。
//! 序列号在写锁内分配，写锁一直持有到事务提交，所以落盘顺序与序列号顺序一致。
//! 序列号高水位写入 `log_meta`，与提交在同一事务内推进，重启后不会复用。

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tokio::sync::{Mutex, MutexGuard};

use pk_core::{Item, PeekError, RenderedView, Result, Sequence};

/// 事件存储配置
#[derive(Debug, Clone)]
pub struct EventStoreConfig {
    /// 数据库路径
    pub database_path: PathBuf,
    /// 连接池大小
    pub max_connections: u32,
    /// 是否启用 WAL
    pub enable_wal: bool,
    /// 写锁等待超时
    pub busy_timeout: Duration,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/peek.db"),
            max_connections: 5,
            enable_wal: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// 提交请求
#[derive(Debug, Clone)]
pub struct CommitRequest {
    /// 目标流
    pub stream: String,
    /// 合并键；`None` 表示新建并生成 ID
    pub key: Option<String>,
    /// 渲染视图
    pub view: RenderedView,
    /// 高亮类
    pub highlights: Vec<String>,
    /// 原始载荷
    pub data: serde_json::Value,
}

/// 已编码、等待写入的提交
#[derive(Debug, Clone)]
pub struct PreparedCommit {
    stream: String,
    id: String,
    data: String,
    view: String,
    highlights: String,
}

impl CommitRequest {
    /// 编码为列值；合并键缺省时生成新 ID
    pub fn prepare(self) -> Result<PreparedCommit> {
        let encode = |what: &str, result: serde_json::Result<String>| {
            result.map_err(|e| PeekError::Persistence(format!("encode {}: {}", what, e)))
        };
        Ok(PreparedCommit {
            id: self.key.unwrap_or_else(Item::generate_id),
            data: encode("data", serde_json::to_string(&self.data))?,
            view: encode("view", serde_json::to_string(&self.view))?,
            highlights: encode("highlights", serde_json::to_string(&self.highlights))?,
            stream: self.stream,
        })
    }
}

/// 事件日志
#[derive(Debug)]
pub struct EventStore {
    pool: SqlitePool,
    /// 已分配的最大序列号
    last_sequence: AtomicU64,
    /// 写锁：序列号分配到事务提交之间独占
    writer: Mutex<()>,
}

/// 持有写锁的一次写入机会
///
/// 创建时分配序列号；无论写入成功与否，该序列号都已消耗。
#[derive(Debug)]
pub struct WriteSlot<'a> {
    store: &'a EventStore,
    sequence: Sequence,
    _writer: MutexGuard<'a, ()>,
}

const ITEM_COLUMNS: &str = "stream, id, sequence, created_at, updated_at, data, view, highlights";

impl EventStore {
    /// 按配置打开 (必要时创建) 数据库
    pub async fn connect(config: EventStoreConfig) -> Result<Self> {
        let path = config.database_path.as_path();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let journal = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| db_err("open database", e))?;

        let store = Self::with_pool(pool).await?;
        tracing::info!(
            "Event store opened at {} (last sequence {})",
            path.display(),
            store.last_sequence()
        );
        Ok(store)
    }

    /// 从路径打开
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect(EventStoreConfig {
            database_path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
        .await
    }

    /// 内存数据库 (测试与临时运行)
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| db_err("parse memory url", e))?;
        // 内存库随连接消失，必须固定单连接
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .map_err(|e| db_err("open memory database", e))?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self {
            pool,
            last_sequence: AtomicU64::new(0),
            writer: Mutex::new(()),
        };
        store.init_schema().await?;
        let high_water = store.load_high_water().await?;
        store.last_sequence.store(high_water, Ordering::SeqCst);
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                stream TEXT NOT NULL,
                id TEXT NOT NULL,
                sequence INTEGER NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                data TEXT NOT NULL,
                view TEXT NOT NULL,
                highlights TEXT NOT NULL,
                PRIMARY KEY (stream, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("create items table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS log_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("create log_meta table", e))?;

        sqlx::query("INSERT OR IGNORE INTO log_meta (key, value) VALUES ('last_sequence', 0)")
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("seed log_meta", e))?;

        Ok(())
    }

    async fn load_high_water(&self) -> Result<Sequence> {
        let row = sqlx::query(
            r#"
            SELECT MAX(
                COALESCE((SELECT value FROM log_meta WHERE key = 'last_sequence'), 0),
                COALESCE((SELECT MAX(sequence) FROM items), 0)
            ) AS high_water
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("load sequence high-water mark", e))?;
        let value: i64 = row
            .try_get("high_water")
            .map_err(|e| db_err("decode high-water mark", e))?;
        Ok(value.max(0) as Sequence)
    }

    /// 当前已分配的最大序列号
    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence.load(Ordering::SeqCst)
    }

    /// 获取写锁并分配下一个序列号
    pub async fn reserve(&self) -> WriteSlot<'_> {
        let writer = self.writer.lock().await;
        let sequence = self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        WriteSlot {
            store: self,
            sequence,
            _writer: writer,
        }
    }

    /// 提交 (新建或原地更新)
    pub async fn commit(&self, request: CommitRequest) -> Result<Item> {
        let prepared = request.prepare()?;
        self.reserve().await.commit(&prepared).await
    }

    /// 删除条目；删除同样消耗一个序列号
    pub async fn delete(&self, stream: &str, id: &str) -> Result<()> {
        self.reserve().await.delete(stream, id).await
    }

    /// 读取单条
    pub async fn get(&self, stream: &str, id: &str) -> Result<Option<Item>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM items WHERE stream = ?1 AND id = ?2",
            ITEM_COLUMNS
        ))
        .bind(stream)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("get item", e))?;
        row.as_ref().map(decode_item).transpose()
    }

    /// 按序列号升序读取全部条目 (用于重建内存索引)
    pub async fn replay(&self) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM items ORDER BY sequence ASC",
            ITEM_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("replay items", e))?;
        rows.iter().map(decode_item).collect()
    }

    /// 条目总数
    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM items")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("count items", e))?;
        let n: i64 = row.try_get("n").map_err(|e| db_err("decode count", e))?;
        Ok(n.max(0) as u64)
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl WriteSlot<'_> {
    /// 本次写入的序列号
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// 提交 (新建或原地更新)
    ///
    /// 单条 upsert 语句完成查找或创建、字段更新与序列号写入，同一事务内推进高水位。
    /// 已存在的行保留 `id` 与 `created_at`。
    pub async fn commit(self, prepared: &PreparedCommit) -> Result<Item> {
        let sequence = self.sequence;
        let now = format_ts(Utc::now());

        let mut tx = self
            .store
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin commit", e))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO items ({cols})
            VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7)
            ON CONFLICT (stream, id) DO UPDATE SET
                sequence = excluded.sequence,
                updated_at = MAX(items.created_at, excluded.updated_at),
                data = excluded.data,
                view = excluded.view,
                highlights = excluded.highlights
            RETURNING {cols}
            "#,
            cols = ITEM_COLUMNS
        ))
        .bind(&prepared.stream)
        .bind(&prepared.id)
        .bind(sequence as i64)
        .bind(&now)
        .bind(&prepared.data)
        .bind(&prepared.view)
        .bind(&prepared.highlights)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_err("upsert item", e))?;

        advance_high_water(&mut tx, sequence).await?;

        tx.commit().await.map_err(|e| db_err("commit item", e))?;

        let item = decode_item(&row)?;
        tracing::debug!(stream = %item.stream, id = %item.id, sequence, "Committed item");
        Ok(item)
    }

    /// 删除条目
    pub async fn delete(self, stream: &str, id: &str) -> Result<()> {
        let sequence = self.sequence;
        let mut tx = self
            .store
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin delete", e))?;

        let result = sqlx::query("DELETE FROM items WHERE stream = ?1 AND id = ?2")
            .bind(stream)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("delete item", e))?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| db_err("rollback delete", e))?;
            return Err(PeekError::not_found(stream, id));
        }

        advance_high_water(&mut tx, sequence).await?;
        tx.commit().await.map_err(|e| db_err("commit delete", e))?;
        tracing::debug!(stream, id, sequence, "Deleted item");
        Ok(())
    }
}

async fn advance_high_water(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sequence: Sequence,
) -> Result<()> {
    sqlx::query("UPDATE log_meta SET value = MAX(value, ?1) WHERE key = 'last_sequence'")
        .bind(sequence as i64)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_err("advance sequence high-water mark", e))?;
    Ok(())
}

fn db_err(action: &str, err: sqlx::Error) -> PeekError {
    PeekError::Persistence(format!("{}: {}", action, err))
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| PeekError::Persistence(format!("corrupt timestamp '{}': {}", raw, e)))
}

fn decode_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| PeekError::Persistence(format!("corrupt {} column: {}", column, e)))
}

fn decode_item(row: &SqliteRow) -> Result<Item> {
    let column = |name: &str| -> Result<String> {
        row.try_get::<String, _>(name)
            .map_err(|e| db_err("decode item row", e))
    };
    let sequence: i64 = row
        .try_get("sequence")
        .map_err(|e| db_err("decode item row", e))?;

    Ok(Item {
        stream: column("stream")?,
        id: column("id")?,
        sequence: sequence as Sequence,
        created_at: parse_ts(&column("created_at")?)?,
        updated_at: parse_ts(&column("updated_at")?)?,
        data: decode_json("data", &column("data")?)?,
        view: decode_json("view", &column("view")?)?,
        highlights: decode_json("highlights", &column("highlights")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn request(stream: &str, key: Option<&str>, title: &str) -> CommitRequest {
        CommitRequest {
            stream: stream.to_string(),
            key: key.map(str::to_string),
            view: RenderedView {
                title: title.to_string(),
                ..Default::default()
            },
            highlights: vec![],
            data: json!({ "title": title }),
        }
    }

    #[tokio::test]
    async fn test_create_generates_ids() {
        let store = EventStore::in_memory().await.unwrap();
        let a = store
            .commit(request("s", None, "a"))
            .await
            .unwrap();
        let b = store
            .commit(request("s", None, "b"))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert!(b.sequence > a.sequence);
        assert_eq!(a.created_at, a.updated_at);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_upsert_preserves_identity() {
        let store = EventStore::in_memory().await.unwrap();
        let first = store
            .commit(request("deploys", Some("deploy"), "started"))
            .await
            .unwrap();
        let second = store
            .commit(request("deploys", Some("deploy"), "finished"))
            .await
            .unwrap();

        assert_eq!(first.id, "deploy");
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert!(second.sequence > first.sequence);
        assert_eq!(second.view.title, "finished");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_same_key_in_different_streams() {
        let store = EventStore::in_memory().await.unwrap();
        store
            .commit(request("a", Some("k"), "x"))
            .await
            .unwrap();
        store
            .commit(request("b", Some("k"), "y"))
            .await
            .unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = EventStore::in_memory().await.unwrap();
        let err = assert_err!(store.delete("s", "nope").await);
        assert!(matches!(err, PeekError::NotFound { .. }));
        // 失败的写入同样消耗序列号
        assert_eq!(store.last_sequence(), 1);
        assert_eq!(store.reserve().await.sequence(), 2);
    }

    #[tokio::test]
    async fn test_replay_is_ascending() {
        let store = EventStore::in_memory().await.unwrap();
        for key in ["a", "b", "a", "c"] {
            store
                .commit(request("s", Some(key), key))
                .await
                .unwrap();
        }
        let items = store.replay().await.unwrap();
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert!(items.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_land_in_sequence_order() {
        let store = Arc::new(EventStore::in_memory().await.unwrap());
        let tasks: Vec<_> = (0..24)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    let stream = if n % 2 == 0 { "a" } else { "b" };
                    store.commit(request(stream, None, &n.to_string())).await
                })
            })
            .collect();
        for task in tasks {
            assert_ok!(task.await.unwrap());
        }

        let sequences: Vec<_> = store
            .replay()
            .await
            .unwrap()
            .iter()
            .map(|item| item.sequence)
            .collect();
        assert_eq!(sequences, (1..=24).collect::<Vec<_>>());
        assert_eq!(store.last_sequence(), 24);
    }

    #[tokio::test]
    async fn test_reserve_holds_the_writer() {
        let store = EventStore::in_memory().await.unwrap();
        let slot = store.reserve().await;
        assert_eq!(slot.sequence(), 1);

        let mut second = tokio_test::task::spawn(store.reserve());
        tokio_test::assert_pending!(second.poll());
        drop(slot);
        let next = tokio_test::assert_ready!(second.poll());
        assert_eq!(next.sequence(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_persistence_error() {
        let store = EventStore::in_memory().await.unwrap();
        assert_ok!(store.commit(request("s", Some("a"), "a")).await);
        sqlx::query("UPDATE items SET view = 'not json'")
            .execute(&store.pool)
            .await
            .unwrap();

        let err = assert_err!(store.replay().await);
        assert!(matches!(err, PeekError::Persistence(_)), "{:?}", err);
    }
}
