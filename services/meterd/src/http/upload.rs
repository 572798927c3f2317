//! Meter data surgery: soft delete by range/kind, and the synthetic upsert
//! (CSV block, JSON block, or generated series).

use super::response::{field_errors, internal_error};
use super::{ApiContext, authorize, check_time_range, strip_wildcard};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use meter_store::MeterReading;
use meter_store::store::EntryType;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    /// One of: all, update, rebase, synth-update, synth-rebase, synth-all.
    pub entry_type: Option<String>,
}

/// PUT /meterdata/delete/{node_uuid}
pub async fn meter_data_delete(
    State(ctx): State<ApiContext>,
    Path(node_uuid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }
    let node = strip_wildcard(&node_uuid);

    let mut messages = Vec::new();
    let kinds = body
        .entry_type
        .as_deref()
        .map(|k| k.to_lowercase())
        .and_then(|k| delete_kinds(&k));
    if kinds.is_none() {
        messages.push(
            "Invalid entry type.  Must be provided, one of: all, update, rebase, \
             synth-update, synth-rebase, synth-all."
                .to_owned(),
        );
    }
    check_mandatory_range(body.time_from, body.time_to, &mut messages);
    if !messages.is_empty() {
        return field_errors(messages);
    }

    let (time_from, time_to) = (
        body.time_from.expect("range checked above"),
        body.time_to.expect("range checked above"),
    );
    let mut data = ctx.data.lock().expect("data manager lock poisoned");
    for kind in kinds.expect("kind checked above") {
        if let Err(e) = data.delete_meter_entries_in_range(node, time_from, time_to, Some(kind)) {
            return internal_error(e);
        }
    }
    drop(data);

    Json(serde_json::json!({
        "request": {
            "node_uuid": node,
            "time_from": time_from,
            "time_to": time_to,
            "entry_type": body.entry_type,
        },
        "result": { "operation_delete": "OK.  Marked as deleted in DB." },
    }))
    .into_response()
}

fn delete_kinds(kind: &str) -> Option<Vec<EntryType>> {
    match kind {
        "all" => Some(vec![
            EntryType::MeterUpdate,
            EntryType::MeterRebase,
            EntryType::MeterUpdateSynth,
            EntryType::MeterRebaseSynth,
        ]),
        "synth-all" => Some(vec![
            EntryType::MeterUpdateSynth,
            EntryType::MeterRebaseSynth,
        ]),
        "update" => Some(vec![EntryType::MeterUpdate]),
        "rebase" => Some(vec![EntryType::MeterRebase]),
        "synth-update" => Some(vec![EntryType::MeterUpdateSynth]),
        "synth-rebase" => Some(vec![EntryType::MeterRebaseSynth]),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UploadBody {
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub gen_start_meter_value: Option<i64>,
    pub gen_entry_value: Option<i64>,
    pub gen_interval_length: Option<i64>,
    pub gen_entry_count: Option<i64>,
    /// CSV (`when_start,entry_value,entry_interval_length,meter_value;...`)
    /// or a JSON array of readings, depending on the operation.
    pub meter_data: Option<String>,
    pub lift_later_reads: Option<bool>,
}

/// PUT /meterdata/upload/{operation}/{node_uuid}
///
/// Readings land as synthetic updates behind a synthetic rebase anchor;
/// prior entries in the window are marked deleted.
pub async fn meter_data_upload(
    State(ctx): State<ApiContext>,
    Path((operation, node_uuid)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<UploadBody>,
) -> Response {
    if let Err(denied) = authorize(&ctx, &headers) {
        return denied;
    }

    let mut messages = Vec::new();
    let operation = operation.to_lowercase();
    if !matches!(operation.as_str(), "csv-reads" | "json-reads" | "generator") {
        messages.push(
            "Invalid operation.  Must be provided, one of: csv-reads, json-reads, generator"
                .to_owned(),
        );
    }
    let node = match strip_wildcard(&node_uuid) {
        Some(node) => node,
        None => {
            messages.push("Node UUID required.".to_owned());
            ""
        }
    };
    check_mandatory_range(body.time_from, body.time_to, &mut messages);

    let mut readings: Vec<MeterReading> = Vec::new();
    if messages.is_empty() {
        match operation.as_str() {
            "json-reads" => match body.meter_data.as_deref() {
                Some(raw) => match serde_json::from_str::<Vec<MeterReading>>(raw) {
                    Ok(parsed) => readings = parsed,
                    Err(e) => messages.push(format!("Invalid JSON: {}", e)),
                },
                None => messages.push("No meter data.".to_owned()),
            },
            "csv-reads" => match body.meter_data.as_deref() {
                Some(raw) => match parse_csv_readings(raw) {
                    Ok(parsed) => readings = parsed,
                    Err(e) => messages.push(e),
                },
                None => messages.push("No meter data.".to_owned()),
            },
            "generator" => {
                match (
                    body.gen_start_meter_value,
                    body.gen_entry_value,
                    body.gen_interval_length,
                    body.gen_entry_count,
                ) {
                    (Some(start_value), Some(entry_value), Some(interval), Some(count)) => {
                        let mut when_start = body.time_from.expect("range checked above");
                        let mut meter_value = start_value;
                        for _ in 0..count {
                            readings.push(MeterReading {
                                when_start,
                                entry_value,
                                entry_interval_length: interval,
                                meter_value,
                            });
                            when_start += interval;
                            meter_value += entry_value;
                        }
                    }
                    _ => messages.push(
                        "Must provide gen_entry_value, gen_interval_length, \
                         gen_start_meter_value, and gen_entry_count for generator operation."
                            .to_owned(),
                    ),
                }
            }
            _ => {}
        }
    }
    if !messages.is_empty() {
        return field_errors(messages);
    }

    let lift_later = body.lift_later_reads.unwrap_or(false);
    let result = ctx
        .data
        .lock()
        .expect("data manager lock poisoned")
        .upsert_synth_meter_updates(
            node,
            body.time_from.expect("range checked above"),
            body.time_to.expect("range checked above"),
            &readings,
            true,
            lift_later,
        );
    if let Err(e) = result {
        return internal_error(e);
    }

    // The result object is keyed by the operation name.
    let mut result = serde_json::Map::new();
    result.insert(
        operation.clone(),
        "OK.  Data uploaded and prior reads in range marked as deleted.".into(),
    );
    Json(serde_json::json!({
        "request": {
            "operation": operation,
            "node_uuid": node,
            "time_from": body.time_from,
            "time_to": body.time_to,
            "gen_start_meter_value": body.gen_start_meter_value,
            "gen_entry_value": body.gen_entry_value,
            "gen_interval_length": body.gen_interval_length,
            "gen_entry_count": body.gen_entry_count,
            "lift_later_reads": lift_later,
        },
        "result": result,
    }))
    .into_response()
}

/// `when_start,entry_value,entry_interval_length,meter_value;...`
fn parse_csv_readings(raw: &str) -> Result<Vec<MeterReading>, String> {
    let mut readings = Vec::new();
    for record in raw.split(';').filter(|r| !r.trim().is_empty()) {
        let fields: Vec<&str> = record.split(',').collect();
        if fields.len() != 4 {
            return Err(format!("Invalid CSV record '{}': need 4 fields.", record));
        }
        let parse = |i: usize| -> Result<i64, String> {
            fields[i]
                .trim()
                .parse()
                .map_err(|_| format!("Invalid CSV value '{}'.", fields[i]))
        };
        readings.push(MeterReading {
            when_start: parse(0)?,
            entry_value: parse(1)?,
            entry_interval_length: parse(2)?,
            meter_value: parse(3)?,
        });
    }
    Ok(readings)
}

/// Both range bounds are mandatory on the surgery endpoints.
fn check_mandatory_range(time_from: Option<i64>, time_to: Option<i64>, messages: &mut Vec<String>) {
    if time_from.is_none() {
        messages.push("Invalid time_from.  Mandatory, as UNIX epoch timestamp.".to_owned());
    }
    if time_to.is_none() {
        messages.push("Invalid time_to.  Mandatory, as UNIX epoch timestamp.".to_owned());
    }
    check_time_range(time_from, time_to, messages);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parses_trailing_separator() {
        let readings =
            parse_csv_readings("1483228800,5,15,1005;1483228815,5,15,1010;").expect("parses");
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[1].meter_value, 1010);
    }

    #[test]
    fn csv_rejects_short_records() {
        assert!(parse_csv_readings("1483228800,5,15").is_err());
        assert!(parse_csv_readings("1483228800,5,x,1005").is_err());
    }

    #[test]
    fn delete_kinds_cover_both_synthetic_types() {
        let kinds = delete_kinds("synth-all").expect("valid kind");
        assert!(kinds.contains(&EntryType::MeterUpdateSynth));
        assert!(kinds.contains(&EntryType::MeterRebaseSynth));
        assert!(delete_kinds("bogus").is_none());
    }
}
