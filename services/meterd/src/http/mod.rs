//! HTTP query/control surface.
//!
//! Read endpoints back onto the data manager; the node control endpoint
//! validates ranges and fans out through the device manager. Every handler
//! checks HTTP Basic credentials against the configured API user; the
//! optional LAN-only guard is applied as middleware when enabled.

pub mod control;
pub mod entries;
pub mod response;
pub mod snapshots;
pub mod upload;

use crate::device::DeviceManager;
use axum::Router;
use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::{get, put};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use meter_store::DataManager;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

/// Oldest timestamp the API accepts (Jan 1, 2017 GMT).
pub const MIN_TIME: i64 = 1_483_228_800;
/// Newest timestamp the API accepts (end of year 9999).
pub const MAX_TIME: i64 = 253_402_300_799;

pub const MAX_REQ_ITEMS: i64 = 100_000;
pub const DEF_REQ_ITEMS: i64 = 100;

/// Explicit handler context; no module globals.
#[derive(Clone)]
pub struct ApiContext {
    pub data: Arc<Mutex<DataManager>>,
    pub devices: Arc<Mutex<DeviceManager>>,
    pub auth: Arc<AuthSettings>,
}

#[derive(Debug)]
pub struct AuthSettings {
    pub user: String,
    pub password: String,
}

pub fn build_router(ctx: ApiContext) -> Router {
    Router::new()
        .route("/meterentries/{node_uuid}", get(entries::meter_entries))
        .route(
            "/meterconsumption/{node_uuid}",
            get(entries::meter_consumption),
        )
        .route(
            "/gatewaysnapshots/{gateway_uuid}",
            get(snapshots::gateway_snapshots),
        )
        .route("/nodesnapshots/{node_uuid}", get(snapshots::node_snapshots))
        .route("/nodeevents/{node_uuid}", get(snapshots::node_events))
        .route("/nodectrl/{node_uuid}", put(control::node_ctrl))
        .route("/meterdata/delete/{node_uuid}", put(upload::meter_data_delete))
        .route(
            "/meterdata/upload/{operation}/{node_uuid}",
            put(upload::meter_data_upload),
        )
        .with_state(ctx)
}

/// Wrap the router with the LAN-only connection guard.
pub fn with_lan_guard(router: Router) -> Router {
    router.layer(axum::middleware::from_fn(lan_only_guard))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Check HTTP Basic credentials. Called at the top of every handler.
pub fn authorize(ctx: &ApiContext, headers: &HeaderMap) -> Result<(), Response> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(response::unauthorized)?;
    let encoded = header
        .strip_prefix("Basic ")
        .ok_or_else(response::unauthorized)?;
    let decoded = BASE64
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(response::unauthorized)?;
    let (user, password) = decoded.split_once(':').ok_or_else(response::unauthorized)?;
    if user == ctx.auth.user && password == ctx.auth.password {
        Ok(())
    } else {
        tracing::info!(user, "API auth rejected");
        Err(response::unauthorized())
    }
}

async fn lan_only_guard(request: Request, next: Next) -> Response {
    let allowed = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .is_some_and(|ConnectInfo(addr)| is_lan_address(addr.ip()));
    if allowed {
        next.run(request).await
    } else {
        response::unauthorized()
    }
}

fn is_lan_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

// ---------------------------------------------------------------------------
// Shared request validation
// ---------------------------------------------------------------------------

/// `all` / `*` select every node or gateway.
pub fn strip_wildcard(uuid: &str) -> Option<&str> {
    let lowered = uuid.to_lowercase();
    if lowered == "all" || lowered == "*" {
        None
    } else {
        Some(uuid)
    }
}

pub fn validate_utc_ts(ts: i64) -> bool {
    (MIN_TIME..=MAX_TIME).contains(&ts)
}

/// Validate an optional `[time_from, time_to]` pair, pushing one message per
/// bad field.
pub fn check_time_range(
    time_from: Option<i64>,
    time_to: Option<i64>,
    messages: &mut Vec<String>,
) {
    if let Some(t) = time_from {
        if !validate_utc_ts(t) {
            messages.push(format!(
                "Invalid time_from. Must be valid UNIX epoch timestamp on or before time_to, \
                 and between {} and {}.",
                MIN_TIME, MAX_TIME
            ));
        }
    }
    if let Some(t) = time_to {
        let before_from = time_from.is_some_and(|f| t < f);
        if !validate_utc_ts(t) || before_from {
            messages.push(format!(
                "Invalid time_to. Must be valid UNIX epoch timestamp on or after time_from, \
                 and between {} and {}.",
                MIN_TIME, MAX_TIME
            ));
        }
    }
}

/// Resolve and bounds-check the item limit.
pub fn check_item_limit(item_limit: Option<i64>, messages: &mut Vec<String>) -> i64 {
    let limit = item_limit.unwrap_or(DEF_REQ_ITEMS);
    if !(1..=MAX_REQ_ITEMS).contains(&limit) {
        messages.push("Invalid item_limit.".to_owned());
    }
    limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards_select_everything() {
        assert_eq!(strip_wildcard("all"), None);
        assert_eq!(strip_wildcard("ALL"), None);
        assert_eq!(strip_wildcard("*"), None);
        assert_eq!(strip_wildcard("0.0.1.1.2"), Some("0.0.1.1.2"));
    }

    #[test]
    fn time_range_rejects_inverted_windows() {
        let mut messages = Vec::new();
        check_time_range(Some(MIN_TIME + 100), Some(MIN_TIME + 50), &mut messages);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("time_to"));
    }

    #[test]
    fn time_range_rejects_pre_epoch_floor() {
        let mut messages = Vec::new();
        check_time_range(Some(100), None, &mut messages);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("time_from"));
    }

    #[test]
    fn item_limit_defaults_and_bounds() {
        let mut messages = Vec::new();
        assert_eq!(check_item_limit(None, &mut messages), DEF_REQ_ITEMS);
        assert!(messages.is_empty());
        check_item_limit(Some(0), &mut messages);
        check_item_limit(Some(MAX_REQ_ITEMS + 1), &mut messages);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn lan_check_accepts_private_ranges_only() {
        assert!(is_lan_address("127.0.0.1".parse().expect("ip")));
        assert!(is_lan_address("192.168.2.10".parse().expect("ip")));
        assert!(is_lan_address("10.0.0.1".parse().expect("ip")));
        assert!(!is_lan_address("8.8.8.8".parse().expect("ip")));
    }
}
