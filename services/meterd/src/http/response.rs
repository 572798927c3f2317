//! Response envelope helpers.
//!
//! Request validation returns a 400 with one message per offending field;
//! failed authentication is a 403. Both shapes are part of the API contract.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::Display;

/// 400 with the per-field error list.
pub fn field_errors(messages: Vec<String>) -> Response {
    let errors: Vec<serde_json::Value> = messages
        .into_iter()
        .map(|message| {
            serde_json::json!({
                "api_error": "Invalid request",
                "message": message,
            })
        })
        .collect();
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "status": "Bad Request",
            "errors": errors,
        })),
    )
        .into_response()
}

/// 403 for missing or wrong credentials, and for LAN-only rejections.
pub fn unauthorized() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": "Unauthorized access" })),
    )
        .into_response()
}

/// 500 for store failures surfacing through a query.
pub fn internal_error(err: impl Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}
