/// HTTP surface tests: auth, validation envelopes, control fan-out, and the
/// meter data surgery endpoints, driven through the router with oneshot
/// requests.
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use gw_proto::Provenance;
use meter_store::store::{EntryType, Store};
use meter_store::{DataManager, MeterReading};
use meterd::device::DeviceManager;
use meterd::http::{ApiContext, AuthSettings, build_router};
use meterd::link::{MemoryHandle, MemoryLink};
use meterd::worker::{LinkShared, LinkWorker};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

const NETWORK: &str = "0.0.1.1";
const NODE: &str = "0.0.1.1.2";
const BASE_TIME: i64 = 1_483_228_800;

struct Rig {
    _dir: tempfile::TempDir,
    router: Router,
    data: Arc<Mutex<DataManager>>,
    shared: Arc<LinkShared>,
    worker: LinkWorker,
    handle: MemoryHandle,
}

fn rig() -> Rig {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = Store::open(&dir.path().join("meter.db")).expect("open store");
    let data = Arc::new(Mutex::new(DataManager::new(store)));

    let (link, handle) = MemoryLink::new();
    let shared = LinkShared::new(NETWORK, 1, "Test Gateway");
    let worker = LinkWorker::new(
        Box::new(link),
        shared.clone(),
        Arc::new(AtomicBool::new(false)),
    );

    let mut devices = DeviceManager::new(data.clone());
    devices.add_gateway(shared.clone());
    // Register node 2 the way radio traffic would.
    let frame = gw_proto::decode_frame(
        "NDARK;2,1496842913",
        Provenance::new(BASE_TIME, NETWORK, 1),
    )
    .expect("registration frame decodes");
    devices.dispatch(&frame).expect("dispatch");

    let ctx = ApiContext {
        data: data.clone(),
        devices: Arc::new(Mutex::new(devices)),
        auth: Arc::new(AuthSettings {
            user: "rest_user".to_owned(),
            password: "change_me_please".to_owned(),
        }),
    };
    Rig {
        _dir: dir,
        router: build_router(ctx),
        data,
        shared,
        worker,
        handle,
    }
}

fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", user, password)))
}

fn authed(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(
            header::AUTHORIZATION,
            basic_auth("rest_user", "change_me_please"),
        )
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(json) => builder
            .body(Body::from(json.to_string()))
            .expect("request builds"),
        None => builder.body(Body::empty()).expect("request builds"),
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("valid json body")
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_credentials_are_rejected() {
    let rig = rig();
    let request = Request::builder()
        .method("GET")
        .uri(format!("/meterentries/{}", NODE))
        .body(Body::empty())
        .expect("request builds");
    let response = rig.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Unauthorized access");
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let rig = rig();
    let request = Request::builder()
        .method("GET")
        .uri(format!("/meterentries/{}", NODE))
        .header(header::AUTHORIZATION, basic_auth("rest_user", "wrong"))
        .body(Body::empty())
        .expect("request builds");
    let response = rig.router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn meter_entries_returns_norm_rows() {
    let rig = rig();
    let readings: Vec<MeterReading> = (0..3)
        .map(|i| MeterReading {
            when_start: BASE_TIME + i * 15,
            entry_value: 5,
            entry_interval_length: 15,
            meter_value: 1005 + i * 5,
        })
        .collect();
    rig.data
        .lock()
        .expect("lock")
        .proc_meter_update(NODE, &readings);

    let response = rig
        .router
        .oneshot(authed("GET", &format!("/meterentries/{}", NODE), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let rows = json["result"]["meter_entries"]
        .as_array()
        .expect("rows array");
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["entry_type"], "MUP");
    assert_eq!(rows[0]["meter_value"], 1015, "newest first");
    assert_eq!(json["request"]["item_limit"], 100);
}

#[tokio::test]
async fn item_limit_out_of_bounds_is_a_field_error() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed(
            "GET",
            &format!("/meterentries/{}?item_limit=0", NODE),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["status"], "Bad Request");
}

#[tokio::test]
async fn consumption_rejects_wildcards_and_serves_nodes() {
    let rig = rig();
    let readings: Vec<MeterReading> = (0..3)
        .map(|i| MeterReading {
            when_start: BASE_TIME + i * 15,
            entry_value: 5,
            entry_interval_length: 15,
            meter_value: 1005 + i * 5,
        })
        .collect();
    rig.data
        .lock()
        .expect("lock")
        .proc_meter_update(NODE, &readings);

    let response = rig
        .router
        .clone()
        .oneshot(authed("GET", "/meterconsumption/all", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = rig
        .router
        .oneshot(authed(
            "GET",
            &format!("/meterconsumption/{}", NODE),
            None,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["result"]["meter_consumption"], 10);
    assert!(
        json["result"]["calc_breakdown"]
            .as_str()
            .expect("breakdown string")
            .starts_with("10 Wh given")
    );
}

#[tokio::test]
async fn node_events_are_queryable() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed("GET", &format!("/nodeevents/{}", NODE), None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let events = json["result"]["node_events"].as_array().expect("array");
    assert_eq!(events.len(), 1, "registration NDARK left one event");
    assert_eq!(events[0]["event_type"], "DARK");
}

// ---------------------------------------------------------------------------
// Node control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn led_rate_out_of_range_is_rejected_and_nothing_is_enqueued() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed(
            "PUT",
            &format!("/nodectrl/{}", NODE),
            Some(serde_json::json!({ "puck_led_rate": 300, "puck_led_time": 100 })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(
        json["errors"][0]["message"]
            .as_str()
            .expect("message")
            .contains("LED rate")
    );
    assert_eq!(rig.shared.outbound_len(), 0, "no SPLED frame was queued");
}

#[tokio::test]
async fn more_than_one_control_parameter_is_rejected() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed(
            "PUT",
            &format!("/nodectrl/{}", NODE),
            Some(serde_json::json!({ "meter_value": 100, "meter_interval": 30 })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(rig.shared.outbound_len(), 0);
}

#[tokio::test]
async fn meter_value_control_reaches_the_wire() {
    let mut rig = rig();
    let response = rig
        .router
        .clone()
        .oneshot(authed(
            "PUT",
            &format!("/nodectrl/{}", NODE),
            Some(serde_json::json!({ "meter_value": 155600 })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["result"], "request queued.");

    rig.worker.tick();
    assert_eq!(rig.handle.take_sent(), vec!["S>G:SMVAL;2,155600".to_owned()]);
}

#[tokio::test]
async fn ginr_rate_defaults_its_poll_time() {
    let mut rig = rig();
    let response = rig
        .router
        .clone()
        .oneshot(authed(
            "PUT",
            &format!("/nodectrl/{}", NODE),
            Some(serde_json::json!({ "tmp_ginr_poll_rate": 60 })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    rig.worker.tick();
    assert_eq!(rig.handle.take_sent(), vec!["S>G:SGITR;2,60,300".to_owned()]);
}

#[tokio::test]
async fn control_for_an_unobserved_node_is_a_field_error() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed(
            "PUT",
            "/nodectrl/0.0.1.1.77",
            Some(serde_json::json!({ "meter_value": 1 })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Meter data surgery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_endpoint_masks_rows_by_kind() {
    let rig = rig();
    let readings: Vec<MeterReading> = (0..3)
        .map(|i| MeterReading {
            when_start: BASE_TIME + i * 15,
            entry_value: 5,
            entry_interval_length: 15,
            meter_value: 1005 + i * 5,
        })
        .collect();
    rig.data
        .lock()
        .expect("lock")
        .proc_meter_update(NODE, &readings);

    let response = rig
        .router
        .clone()
        .oneshot(authed(
            "PUT",
            &format!("/meterdata/delete/{}", NODE),
            Some(serde_json::json!({
                "time_from": BASE_TIME,
                "time_to": BASE_TIME + 600,
                "entry_type": "update",
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let remaining = rig
        .data
        .lock()
        .expect("lock")
        .meter_entries(Some(NODE), None, None, None)
        .expect("query");
    assert!(remaining.is_empty(), "NORM view is now empty");
}

#[tokio::test]
async fn delete_endpoint_rejects_unknown_kinds() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed(
            "PUT",
            &format!("/meterdata/delete/{}", NODE),
            Some(serde_json::json!({
                "time_from": BASE_TIME,
                "time_to": BASE_TIME + 600,
                "entry_type": "everything",
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn generator_upload_writes_anchored_synthetic_rows() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed(
            "PUT",
            &format!("/meterdata/upload/generator/{}", NODE),
            Some(serde_json::json!({
                "time_from": BASE_TIME,
                "time_to": BASE_TIME + 600,
                "gen_start_meter_value": 1000,
                "gen_entry_value": 5,
                "gen_interval_length": 60,
                "gen_entry_count": 4,
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let data = rig.data.lock().expect("lock");
    let rows = data
        .meter_entries(Some(NODE), None, None, None)
        .expect("query");
    let synth_updates = rows
        .iter()
        .filter(|r| r.entry_type == EntryType::MeterUpdateSynth)
        .count();
    let synth_rebases = rows
        .iter()
        .filter(|r| r.entry_type == EntryType::MeterRebaseSynth)
        .count();
    assert_eq!(synth_updates, 4);
    assert_eq!(synth_rebases, 1, "rebase anchor precedes the block");
}

#[tokio::test]
async fn csv_upload_parses_records() {
    let rig = rig();
    let csv = format!(
        "{},5,15,1005;{},5,15,1010;",
        BASE_TIME,
        BASE_TIME + 15
    );
    let response = rig
        .router
        .oneshot(authed(
            "PUT",
            &format!("/meterdata/upload/csv-reads/{}", NODE),
            Some(serde_json::json!({
                "time_from": BASE_TIME,
                "time_to": BASE_TIME + 600,
                "meter_data": csv,
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let rows = rig
        .data
        .lock()
        .expect("lock")
        .meter_entries(Some(NODE), None, None, None)
        .expect("query");
    assert_eq!(rows.len(), 3, "two synthetic reads plus the rebase anchor");
}

#[tokio::test]
async fn upload_with_bad_json_is_a_field_error() {
    let rig = rig();
    let response = rig
        .router
        .oneshot(authed(
            "PUT",
            &format!("/meterdata/upload/json-reads/{}", NODE),
            Some(serde_json::json!({
                "time_from": BASE_TIME,
                "time_to": BASE_TIME + 600,
                "meter_data": "not json at all",
            })),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(
        json["errors"][0]["message"]
            .as_str()
            .expect("message")
            .contains("Invalid JSON")
    );
}
