//! Peek Daemon - 事件摄取与实时看板后端

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pk_durable::{EventStore, EventStoreConfig};
use pk_fanout::HubConfig;
use pk_ingest::Ingestor;
use pk_render::ConfigSet;

/// 默认配置目录 (容器内)
const DEFAULT_CONFIG_DIR: &str = "/app/config";

#[derive(Debug, Parser)]
#[command(name = "peek-daemon", version, about = "Ingest JSON events into live, configurable streams")]
struct Args {
    /// 配置目录列表 (按平台路径分隔符分隔)
    #[arg(long, env = "CONFIG_PATHS")]
    config_paths: Option<String>,

    /// 单个配置目录 (未设置 CONFIG_PATHS 时使用)
    #[arg(long, env = "CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// SQLite 数据库文件
    #[arg(long, env = "DB_PATH", default_value = "./data/peek.db")]
    db_path: PathBuf,

    /// 监听地址
    #[arg(long, env = "PEEK_LISTEN", default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// 每个实时订阅的队列容量
    #[arg(long, env = "PEEK_QUEUE_CAPACITY", default_value_t = pk_fanout::DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,
}

impl Args {
    fn config_dirs(&self) -> Vec<PathBuf> {
        if let Some(paths) = self.config_paths.as_deref().filter(|p| !p.trim().is_empty()) {
            return std::env::split_paths(paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        vec![self
            .config_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "peek_daemon=info,pk_ingest=info,pk_server=info,pk_render=info,pk_durable=info,pk_fanout=info,tower_http=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Peek Daemon starting...");

    // 加载流配置
    let config_dirs = args.config_dirs();
    let configs = ConfigSet::load(&config_dirs).context("failed to load stream configs")?;
    tracing::info!(
        "Stream configs loaded: {}",
        configs.slugs().collect::<Vec<_>>().join(", ")
    );

    // 打开事件日志
    let log = EventStore::connect(EventStoreConfig {
        database_path: args.db_path.clone(),
        ..Default::default()
    })
    .await
    .with_context(|| format!("failed to open database {}", args.db_path.display()))?;
    tracing::info!("Event store initialized at {}", args.db_path.display());

    // 重放日志，启动摄取协调器
    let ingestor = Ingestor::start(
        Arc::new(configs),
        log,
        HubConfig {
            queue_capacity: args.queue_capacity,
        },
    )
    .await
    .context("failed to replay event log")?;

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    tracing::info!("Peek Daemon is ready!");
    tracing::info!("Press Ctrl+C to shutdown...");

    // 等待关闭信号：先结束实时推送，再停止服务
    let shutdown_handle = ingestor.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down...");
        shutdown_handle.shutdown();
    };

    pk_server::serve(listener, ingestor.clone(), shutdown).await?;

    ingestor.close().await;
    tracing::info!("Peek Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_dirs_fallbacks() {
        let args = Args::parse_from(["peek-daemon"]);
        if args.config_paths.is_none() && args.config_dir.is_none() {
            assert_eq!(args.config_dirs(), vec![PathBuf::from(DEFAULT_CONFIG_DIR)]);
        }

        let args = Args::parse_from(["peek-daemon", "--config-dir", "/etc/peek"]);
        if args.config_paths.is_none() {
            assert_eq!(args.config_dirs(), vec![PathBuf::from("/etc/peek")]);
        }
    }

    #[test]
    fn test_config_paths_are_split() {
        let joined = std::env::join_paths(["/a", "/b"]).unwrap();
        let args = Args::parse_from([
            "peek-daemon",
            "--config-paths",
            joined.to_str().unwrap(),
        ]);
        assert_eq!(args.config_dirs(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(args.queue_capacity, pk_fanout::DEFAULT_QUEUE_CAPACITY);
    }
}
