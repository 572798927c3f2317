//! Node control: validate ranges, then fan the request out as a downlink
//! frame through the device manager.

use super::response::field_errors;
use super::{ApiContext, authorize};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

/// Fallback duration for a temporary aggressive GINR poll, seconds.
const DEFAULT_GINR_POLL_TIME: i64 = 300;

#[derive(Debug, Default, Deserialize)]
pub struct NodeCtrlBody {
    /// Temporary aggressive GINR rate so new settings apply quickly.
    pub tmp_ginr_poll_rate: Option<i64>,
    pub tmp_ginr_poll_time: Option<i64>,
    /// New cumulative meter value in Wh.
    pub meter_value: Option<i64>,
    /// New meter interval in seconds.
    pub meter_interval: Option<i64>,
    /// LED blink ratio to watched meter pulses, 1:x.
    pub puck_led_rate: Option<i64>,
    /// Blink duration in ms; 0 follows the watched pulse.
    pub puck_led_time: Option<i64>,
}

/// PUT /nodectrl/{node_uuid}
pub async fn node_ctrl(
    State(ctx): State<ApiContext>,
    Path(node_uuid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<NodeCtrlBody>,
) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }

    let mut messages = Vec::new();

    let requested = [
        body.tmp_ginr_poll_rate,
        body.meter_value,
        body.meter_interval,
        body.puck_led_rate,
    ]
    .iter()
    .filter(|v| v.is_some())
    .count();
    if requested > 1 {
        messages.push(
            "Invalid arguments - can only request one GINR poll rate/time, meter value, \
             meter interval, or LED rate/time per request."
                .to_owned(),
        );
    }
    if requested == 0 {
        messages.push("One control parameter is required.".to_owned());
    }

    let tmp_ginr_poll_time = match (body.tmp_ginr_poll_rate, body.tmp_ginr_poll_time) {
        (Some(_), None) => Some(DEFAULT_GINR_POLL_TIME),
        _ => body.tmp_ginr_poll_time,
    };

    if body
        .tmp_ginr_poll_rate
        .is_some_and(|rate| !(10..=600).contains(&rate))
    {
        messages.push("Invalid GINR Poll rate.  Must be between 10 and 600.".to_owned());
    }
    if tmp_ginr_poll_time.is_some_and(|time| !(10..=3000).contains(&time)) {
        messages.push("Invalid GINR Poll time.  Must be between 10 and 3000.".to_owned());
    }

    if (body.puck_led_rate.is_some() || body.puck_led_time.is_some())
        && (body.puck_led_rate.is_none() || body.puck_led_time.is_none())
    {
        messages.push("Puck LED rate AND time must be specified".to_owned());
    }
    if body
        .puck_led_rate
        .is_some_and(|rate| !(0..=255).contains(&rate))
    {
        messages.push("Invalid LED rate.  Must be between 0 and 255.".to_owned());
    }
    if body
        .puck_led_time
        .is_some_and(|time| !(0..=3000).contains(&time))
    {
        messages.push("Invalid LED time.  Must be between 0 and 3000ms.".to_owned());
    }

    if !messages.is_empty() {
        return field_errors(messages);
    }

    let devices = ctx.devices.lock().expect("device manager lock poisoned");
    let outcome = if let Some(rate) = body.tmp_ginr_poll_rate {
        devices.set_node_gw_inst_tmp_rate(
            &node_uuid,
            rate,
            tmp_ginr_poll_time.unwrap_or(DEFAULT_GINR_POLL_TIME),
        )
    } else if let Some(value) = body.meter_value {
        devices.set_node_meter_value(&node_uuid, value)
    } else if let Some(interval) = body.meter_interval {
        devices.set_node_meter_interval(&node_uuid, interval)
    } else if let (Some(rate), Some(time)) = (body.puck_led_rate, body.puck_led_time) {
        devices.set_node_puck_led(&node_uuid, rate, time)
    } else {
        unreachable!("validation guarantees exactly one control parameter")
    };
    drop(devices);

    if let Err(e) = outcome {
        return field_errors(vec![e.to_string()]);
    }

    Json(serde_json::json!({
        "request": {
            "tmp_ginr_poll_rate": body.tmp_ginr_poll_rate,
            "tmp_ginr_poll_time": tmp_ginr_poll_time,
            "meter_value": body.meter_value,
            "meter_interval": body.meter_interval,
            "puck_led_rate": body.puck_led_rate,
            "puck_led_time": body.puck_led_time,
        },
        "result": "request queued.",
    }))
    .into_response()
}
