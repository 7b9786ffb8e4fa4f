//! # pk_server - Peek Transport
//!
//! REST 摄取 / 列表接口与 SSE 实时推送。
//!
//! | 路由 | 说明 |
//! |---|---|
//! | `POST /api/{slug}` | 摄取 JSON 对象 |
//! | `GET /api/{slug}` / `GET /api/items` | 最近优先列表 |
//! | `GET /api/{slug}/stream` / `GET /api/stream` | SSE 实时推送 |
//! | `GET /api/{slug}/{id}` / `DELETE /api/{slug}/{id}` | 单条读取 / 删除 |
//! | `GET /api/streams` | 流目录 |

pub mod error;
pub mod live;
pub mod params;
pub mod routes;

use std::future::Future;

use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use pk_core::Result;
use pk_ingest::Ingestor;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::build_router;

/// 构建带中间件的完整应用
pub fn app(ingestor: Ingestor) -> axum::Router {
    build_router(ingestor).layer(TraceLayer::new_for_http()).layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// 在已绑定的监听器上运行服务，`shutdown` 完成后优雅退出
pub async fn serve(
    listener: TcpListener,
    ingestor: Ingestor,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "API server listening");

    axum::serve(listener, app(ingestor))
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("API server stopped");
    Ok(())
}
