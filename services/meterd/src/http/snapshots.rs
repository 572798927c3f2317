//! Audit history queries: gateway snapshots, node snapshots, node events.

use super::entries::RangeQuery;
use super::response::{field_errors, internal_error};
use super::{ApiContext, authorize, check_item_limit, check_time_range, strip_wildcard};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use meter_store::StoreError;
use serde::Serialize;

/// GET /gatewaysnapshots/{gateway_uuid}
pub async fn gateway_snapshots(
    State(ctx): State<ApiContext>,
    Path(gateway_uuid): Path<String>,
    headers: HeaderMap,
    Query(params): Query<RangeQuery>,
) -> Response {
    history(&ctx, &headers, &gateway_uuid, &params, "gateway_snapshots", |ctx, uuid, q, limit| {
        ctx.data
            .lock()
            .expect("data manager lock poisoned")
            .gateway_snapshots(uuid, q.time_from, q.time_to, Some(limit))
    })
}

/// GET /nodesnapshots/{node_uuid}
pub async fn node_snapshots(
    State(ctx): State<ApiContext>,
    Path(node_uuid): Path<String>,
    headers: HeaderMap,
    Query(params): Query<RangeQuery>,
) -> Response {
    history(&ctx, &headers, &node_uuid, &params, "node_snapshots", |ctx, uuid, q, limit| {
        ctx.data
            .lock()
            .expect("data manager lock poisoned")
            .node_snapshots(uuid, q.time_from, q.time_to, Some(limit))
    })
}

/// GET /nodeevents/{node_uuid}
pub async fn node_events(
    State(ctx): State<ApiContext>,
    Path(node_uuid): Path<String>,
    headers: HeaderMap,
    Query(params): Query<RangeQuery>,
) -> Response {
    history(&ctx, &headers, &node_uuid, &params, "node_events", |ctx, uuid, q, limit| {
        ctx.data
            .lock()
            .expect("data manager lock poisoned")
            .node_events(uuid, q.time_from, q.time_to, Some(limit))
    })
}

fn history<T: Serialize>(
    ctx: &ApiContext,
    headers: &HeaderMap,
    uuid: &str,
    params: &RangeQuery,
    result_key: &str,
    query: impl FnOnce(&ApiContext, Option<&str>, &RangeQuery, i64) -> Result<Vec<T>, StoreError>,
) -> Response {
    if let Err(denied) = authorize(ctx, headers) {
        return denied;
    }
    let target = strip_wildcard(uuid);

    let mut messages = Vec::new();
    check_time_range(params.time_from, params.time_to, &mut messages);
    let item_limit = check_item_limit(params.item_limit, &mut messages);
    if !messages.is_empty() {
        return field_errors(messages);
    }

    match query(ctx, target, params, item_limit) {
        Ok(rows) => Json(serde_json::json!({
            "request": {
                "uuid": target,
                "item_limit": item_limit,
                "time_from": params.time_from,
                "time_to": params.time_to,
            },
            "result": { result_key: rows },
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}
