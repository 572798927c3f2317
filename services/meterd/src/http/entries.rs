//! Meter entry and consumption queries.

use super::response::{field_errors, internal_error};
use super::{ApiContext, authorize, check_item_limit, check_time_range, strip_wildcard};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub item_limit: Option<i64>,
}

/// GET /meterentries/{node_uuid}
pub async fn meter_entries(
    State(ctx): State<ApiContext>,
    Path(node_uuid): Path<String>,
    headers: HeaderMap,
    Query(params): Query<RangeQuery>,
) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }
    let node = strip_wildcard(&node_uuid);

    let mut messages = Vec::new();
    check_time_range(params.time_from, params.time_to, &mut messages);
    let item_limit = check_item_limit(params.item_limit, &mut messages);
    if !messages.is_empty() {
        return field_errors(messages);
    }

    let result = ctx
        .data
        .lock()
        .expect("data manager lock poisoned")
        .meter_entries(node, params.time_from, params.time_to, Some(item_limit));
    match result {
        Ok(rows) => Json(serde_json::json!({
            "request": {
                "node_uuid": node,
                "item_limit": item_limit,
                "time_from": params.time_from,
                "time_to": params.time_to,
            },
            "result": { "meter_entries": rows },
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /meterconsumption/{node_uuid}
pub async fn meter_consumption(
    State(ctx): State<ApiContext>,
    Path(node_uuid): Path<String>,
    headers: HeaderMap,
    Query(params): Query<RangeQuery>,
) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }

    let mut messages = Vec::new();
    check_time_range(params.time_from, params.time_to, &mut messages);
    let node = match strip_wildcard(&node_uuid) {
        Some(node) => node,
        None => {
            messages.push("Node UUID required.".to_owned());
            ""
        }
    };
    if !messages.is_empty() {
        return field_errors(messages);
    }

    let result = ctx
        .data
        .lock()
        .expect("data manager lock poisoned")
        .meter_consumption(node, params.time_from, params.time_to);
    match result {
        Ok(consumption) => {
            tracing::debug!(
                node,
                consumption = consumption.meter_consumption,
                breakdown = %consumption.calc_breakdown,
                "consumption request served"
            );
            Json(serde_json::json!({
                "request": {
                    "node_uuid": node,
                    "time_from": params.time_from,
                    "time_to": params.time_to,
                },
                "result": consumption,
            }))
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}
