//! API 路由

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;

use pk_core::{Item, PeekError, Sequence};
use pk_durable::Page;
use pk_fanout::SubscriptionFilter;
use pk_ingest::Ingestor;

use crate::error::{ApiError, ApiResult};
use crate::live;
use crate::params::{replay_after, ListParams};

type RawQuery = Query<Vec<(String, String)>>;

/// 构建 API 路由
pub fn build_router(ingestor: Ingestor) -> Router {
    Router::new()
        .route("/api/streams", get(list_streams))
        .route("/api/items", get(list_all))
        .route("/api/stream", get(live_all))
        .route("/api/:slug", get(list_stream).post(ingest))
        .route("/api/:slug/stream", get(live_stream))
        .route("/api/:slug/:id", get(get_item).delete(delete_item))
        .with_state(ingestor)
}

#[derive(Serialize)]
struct StreamInfo {
    slug: String,
    display_name: String,
}

#[derive(Serialize)]
struct ListResponse<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    display_name: Option<&'a str>,
    count: usize,
    items: Vec<&'a Item>,
    next_cursor: Option<Sequence>,
}

impl<'a> ListResponse<'a> {
    fn new(page: &'a Page) -> Self {
        Self {
            config: None,
            display_name: None,
            count: page.items.len(),
            items: page.items.iter().map(|item| item.as_ref()).collect(),
            next_cursor: page.next_cursor,
        }
    }
}

async fn list_streams(State(ingestor): State<Ingestor>) -> Json<Vec<StreamInfo>> {
    let mut streams: Vec<StreamInfo> = ingestor
        .configs()
        .iter()
        .map(|config| StreamInfo {
            slug: config.slug.clone(),
            display_name: config.display_name.clone(),
        })
        .collect();
    streams.sort_by_key(|s| s.display_name.to_lowercase());
    Json(streams)
}

async fn list_all(State(ingestor): State<Ingestor>, Query(pairs): RawQuery) -> ApiResult<impl IntoResponse> {
    let ListParams { mut query, configs } = ListParams::parse(&pairs)?;
    if !configs.is_empty() {
        if let Some(unknown) = configs.iter().find(|slug| !ingestor.configs().contains(slug.as_str())) {
            return Err(PeekError::UnknownStream(unknown.clone()).into());
        }
        query.streams = Some(configs);
    }

    let page = ingestor.list_all(&query);
    Ok(Json(serde_json::to_value(ListResponse::new(&page)).map_err(PeekError::from)?))
}

async fn list_stream(
    State(ingestor): State<Ingestor>,
    Path(slug): Path<String>,
    Query(pairs): RawQuery,
) -> ApiResult<impl IntoResponse> {
    let ListParams { query, .. } = ListParams::parse(&pairs)?;
    let page = ingestor.list(&slug, query)?;
    let display_name = ingestor
        .configs()
        .get(&slug)
        .map(|config| config.display_name.as_str());

    let response = ListResponse {
        config: Some(&slug),
        display_name,
        ..ListResponse::new(&page)
    };
    Ok(Json(serde_json::to_value(response).map_err(PeekError::from)?))
}

async fn ingest(
    State(ingestor): State<Ingestor>,
    Path(slug): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if !ingestor.configs().contains(&slug) {
        return Err(ApiError::UnknownStream(slug));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidPayload(format!("Body is not valid JSON: {}", e)))?;

    let item = ingestor.ingest(&slug, payload).await?;
    Ok((StatusCode::OK, Json(serde_json::to_value(item.as_ref()).map_err(PeekError::from)?)))
}

async fn get_item(
    State(ingestor): State<Ingestor>,
    Path((slug, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let item = ingestor.get(&slug, &id)?;
    Ok(Json(serde_json::to_value(item.as_ref()).map_err(PeekError::from)?))
}

async fn delete_item(
    State(ingestor): State<Ingestor>,
    Path((slug, id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    ingestor.delete(&slug, &id).await?;
    Ok(Json(serde_json::json!({ "deleted": true, "stream": slug, "id": id })))
}

fn last_event_id(headers: &HeaderMap) -> Option<&str> {
    headers.get("last-event-id").and_then(|v| v.to_str().ok())
}

async fn live_all(
    State(ingestor): State<Ingestor>,
    headers: HeaderMap,
    Query(pairs): RawQuery,
) -> ApiResult<impl IntoResponse> {
    let after = replay_after(&pairs, last_event_id(&headers))?;
    live::open(&ingestor, SubscriptionFilter::All, after)
}

async fn live_stream(
    State(ingestor): State<Ingestor>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    Query(pairs): RawQuery,
) -> ApiResult<impl IntoResponse> {
    let after = replay_after(&pairs, last_event_id(&headers))?;
    live::open(&ingestor, SubscriptionFilter::Stream(slug), after)
}
