//! Typed SQLite access over the persistent relations.
//!
//! # Schema
//! - `meter_entry`: keyed `(node_uuid, when_start_raw, when_start_raw_nonce)`;
//!   the nonce breaks ties when two entries share a start second.
//! - `gateway_snapshot` / `node_snapshot`: immutable audit history keyed by
//!   receive time.
//! - `node_event`: auto-keyed append-only log.
//! - `sys_param` / `user`: simple key-value relations.
//!
//! Rows are soft-deleted by flipping `rec_status`; nothing here purges.

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use rusqlite::types::Value;
use serde::Serialize;
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// Row vocabulary
// ---------------------------------------------------------------------------

/// Record status. `NORM` rows are the authoritative dataset; `HDN` and `DEL`
/// rows are kept but ignored by every query that matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecStatus {
    #[serde(rename = "NORM")]
    Norm,
    #[serde(rename = "HDN")]
    Hidden,
    #[serde(rename = "DEL")]
    Deleted,
}

impl RecStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecStatus::Norm => "NORM",
            RecStatus::Hidden => "HDN",
            RecStatus::Deleted => "DEL",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "NORM" => Some(RecStatus::Norm),
            "HDN" => Some(RecStatus::Hidden),
            "DEL" => Some(RecStatus::Deleted),
            _ => None,
        }
    }
}

/// Meter entry kind: observed or synthetic, incremental update or
/// authoritative rebase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryType {
    #[serde(rename = "MUP")]
    MeterUpdate,
    #[serde(rename = "MREB")]
    MeterRebase,
    #[serde(rename = "MUPS")]
    MeterUpdateSynth,
    #[serde(rename = "MREBS")]
    MeterRebaseSynth,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::MeterUpdate => "MUP",
            EntryType::MeterRebase => "MREB",
            EntryType::MeterUpdateSynth => "MUPS",
            EntryType::MeterRebaseSynth => "MREBS",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "MUP" => Some(EntryType::MeterUpdate),
            "MREB" => Some(EntryType::MeterRebase),
            "MUPS" => Some(EntryType::MeterUpdateSynth),
            "MREBS" => Some(EntryType::MeterRebaseSynth),
            _ => None,
        }
    }

    /// The synthetic counterpart used by the upsert path.
    pub fn is_update(self) -> bool {
        matches!(self, EntryType::MeterUpdate | EntryType::MeterUpdateSynth)
    }
}

/// Discrete node occurrences recorded in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeEventType {
    #[serde(rename = "BOOT")]
    Boot,
    #[serde(rename = "DARK")]
    Dark,
    #[serde(rename = "LBATT")]
    LowBattery,
}

impl NodeEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeEventType::Boot => "BOOT",
            NodeEventType::Dark => "DARK",
            NodeEventType::LowBattery => "LBATT",
        }
    }
}

/// One meter entry row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeterEntry {
    pub node_uuid: String,
    pub when_start_raw: i64,
    pub when_start_raw_nonce: String,
    pub when_start: i64,
    pub duration: i64,
    pub entry_type: EntryType,
    pub entry_value: i64,
    pub meter_value: i64,
    pub rec_status: RecStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshotRow {
    pub gateway_uuid: String,
    pub when_received: i64,
    pub network_id: String,
    pub gateway_id: i64,
    pub when_booted: i64,
    pub free_ram: i64,
    pub gateway_time: i64,
    pub log_level: String,
    pub tx_power: i64,
    pub rec_status: RecStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshotRow {
    pub node_uuid: String,
    pub when_received: i64,
    pub network_id: String,
    pub node_id: i64,
    pub gateway_id: i64,
    pub batt_voltage_mv: i64,
    pub up_time: i64,
    pub sleep_time: i64,
    pub free_ram: i64,
    pub when_last_seen: i64,
    pub last_clock_drift: i64,
    pub meter_interval: i64,
    pub meter_impulses_per_kwh: i64,
    pub last_meter_entry_finish: i64,
    pub last_meter_value: i64,
    pub last_rms_current: f64,
    pub puck_led_rate: i64,
    pub puck_led_time: i64,
    pub last_rssi_at_gateway: i64,
    pub rec_status: RecStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeEventRow {
    pub event_id: i64,
    pub node_uuid: String,
    pub timestamp: i64,
    pub event_type: String,
    pub details: String,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub username: String,
    pub password: String,
    pub permissions: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    /// Primary-key collision on insert. The caller re-rolls the nonce.
    Conflict(String),
    Sqlite(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Conflict(key) => write!(f, "primary key already exists: {}", key),
            StoreError::Sqlite(e) => write!(f, "sqlite error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

fn conflict_or(e: rusqlite::Error, key: String) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(key)
        }
        _ => StoreError::Sqlite(e),
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Filter for meter entry queries. Unset fields do not constrain.
#[derive(Debug, Default, Clone)]
pub struct EntryQuery<'a> {
    pub node_uuid: Option<&'a str>,
    pub entry_type: Option<EntryType>,
    pub rec_status: Option<RecStatus>,
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub limit: Option<i64>,
}

/// Filter shared by the snapshot and event history queries.
#[derive(Debug, Default, Clone)]
pub struct HistoryQuery<'a> {
    pub uuid: Option<&'a str>,
    pub time_from: Option<i64>,
    pub time_to: Option<i64>,
    pub rec_status: Option<RecStatus>,
    pub event_type: Option<&'a str>,
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One open database. A single connection serializes writers; WAL keeps
/// readers cheap.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at `path`, applying pragmas and schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(include_str!("schema.sql"))?;
        let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        tracing::info!(version, "store open");
        Ok(Store { conn })
    }

    // -----------------------------------------------------------------------
    // Meter entries
    // -----------------------------------------------------------------------

    pub fn write_meter_entry(&self, entry: &MeterEntry) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO meter_entry
                     (node_uuid, when_start_raw, when_start_raw_nonce, when_start,
                      duration, entry_type, entry_value, meter_value, rec_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.node_uuid,
                    entry.when_start_raw,
                    entry.when_start_raw_nonce,
                    entry.when_start,
                    entry.duration,
                    entry.entry_type.as_str(),
                    entry.entry_value,
                    entry.meter_value,
                    entry.rec_status.as_str(),
                ],
            )
            .map_err(|e| {
                conflict_or(
                    e,
                    format!(
                        "[{},{},{}]",
                        entry.node_uuid, entry.when_start_raw, entry.when_start_raw_nonce
                    ),
                )
            })?;
        tracing::debug!(
            node_uuid = %entry.node_uuid,
            when_start_raw = entry.when_start_raw,
            nonce = %entry.when_start_raw_nonce,
            "inserted meter_entry"
        );
        Ok(())
    }

    /// Re-anchor one entry's cumulative value (the lift pass).
    pub fn update_meter_entry_value(
        &self,
        node_uuid: &str,
        when_start_raw: i64,
        nonce: &str,
        new_meter_value: i64,
    ) -> Result<usize, StoreError> {
        let changed = self.conn.execute(
            "UPDATE meter_entry SET meter_value = ?4
             WHERE node_uuid = ?1 AND when_start_raw = ?2 AND when_start_raw_nonce = ?3",
            params![node_uuid, when_start_raw, nonce, new_meter_value],
        )?;
        Ok(changed)
    }

    /// Flip `rec_status` for every entry in `[time_from, time_to]` matching
    /// the optional node and type filters. Returns the number of rows touched.
    pub fn mark_meter_entries(
        &self,
        node_uuid: Option<&str>,
        time_from: i64,
        time_to: i64,
        entry_type: Option<EntryType>,
        new_status: RecStatus,
    ) -> Result<usize, StoreError> {
        let mut sql =
            "UPDATE meter_entry SET rec_status = ? WHERE when_start >= ? AND when_start <= ?"
                .to_owned();
        let mut args: Vec<Value> = vec![
            Value::from(new_status.as_str().to_owned()),
            Value::from(time_from),
            Value::from(time_to),
        ];
        if let Some(node) = node_uuid {
            sql.push_str(" AND node_uuid = ?");
            args.push(Value::from(node.to_owned()));
        }
        if let Some(t) = entry_type {
            sql.push_str(" AND entry_type = ?");
            args.push(Value::from(t.as_str().to_owned()));
        }
        let changed = self.conn.execute(&sql, params_from_iter(args))?;
        Ok(changed)
    }

    /// Filtered entry query, newest first.
    pub fn meter_entries(&self, q: &EntryQuery<'_>) -> Result<Vec<MeterEntry>, StoreError> {
        let mut sql = "SELECT node_uuid, when_start_raw, when_start_raw_nonce, when_start,
                              duration, entry_type, entry_value, meter_value, rec_status
                       FROM meter_entry WHERE 1=1"
            .to_owned();
        let mut args: Vec<Value> = Vec::new();
        if let Some(node) = q.node_uuid {
            sql.push_str(" AND node_uuid = ?");
            args.push(Value::from(node.to_owned()));
        }
        if let Some(t) = q.entry_type {
            sql.push_str(" AND entry_type = ?");
            args.push(Value::from(t.as_str().to_owned()));
        }
        if let Some(s) = q.rec_status {
            sql.push_str(" AND rec_status = ?");
            args.push(Value::from(s.as_str().to_owned()));
        }
        if let Some(t) = q.time_from {
            sql.push_str(" AND when_start >= ?");
            args.push(Value::from(t));
        }
        if let Some(t) = q.time_to {
            sql.push_str(" AND when_start <= ?");
            args.push(Value::from(t));
        }
        sql.push_str(" ORDER BY when_start DESC");
        if let Some(n) = q.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::from(n));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), map_meter_entry)?;
        collect(rows)
    }

    /// NORM entries with `when_start` at or after `time_from`, oldest first.
    /// Feeds the lift pass, which must walk forward in time.
    pub fn norm_entries_from(
        &self,
        node_uuid: &str,
        time_from: i64,
    ) -> Result<Vec<MeterEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT node_uuid, when_start_raw, when_start_raw_nonce, when_start,
                    duration, entry_type, entry_value, meter_value, rec_status
             FROM meter_entry
             WHERE node_uuid = ?1 AND rec_status = 'NORM' AND when_start >= ?2
             ORDER BY when_start ASC",
        )?;
        let rows = stmt.query_map(params![node_uuid, time_from], map_meter_entry)?;
        collect(rows)
    }

    /// Probe for the first/last update or rebase entry inside a window,
    /// restricted to NORM rows.
    fn probe_entry(
        &self,
        node_uuid: &str,
        is_rebase: bool,
        is_first: bool,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<Option<MeterEntry>, StoreError> {
        let types = if is_rebase {
            ("MREB", "MREBS")
        } else {
            ("MUP", "MUPS")
        };
        let mut sql = "SELECT node_uuid, when_start_raw, when_start_raw_nonce, when_start,
                              duration, entry_type, entry_value, meter_value, rec_status
                       FROM meter_entry
                       WHERE node_uuid = ? AND entry_type IN (?, ?) AND rec_status = 'NORM'"
            .to_owned();
        let mut args: Vec<Value> = vec![
            Value::from(node_uuid.to_owned()),
            Value::from(types.0.to_owned()),
            Value::from(types.1.to_owned()),
        ];
        if let Some(t) = time_from {
            sql.push_str(" AND when_start >= ?");
            args.push(Value::from(t));
        }
        if let Some(t) = time_to {
            sql.push_str(" AND when_start <= ?");
            args.push(Value::from(t));
        }
        sql.push_str(if is_first {
            " ORDER BY when_start ASC LIMIT 1"
        } else {
            " ORDER BY when_start DESC LIMIT 1"
        });
        let mut stmt = self.conn.prepare(&sql)?;
        let row = stmt
            .query_row(params_from_iter(args), map_meter_entry)
            .optional()?;
        Ok(row)
    }

    pub fn first_mup(
        &self,
        node_uuid: &str,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<Option<MeterEntry>, StoreError> {
        self.probe_entry(node_uuid, false, true, time_from, time_to)
    }

    pub fn last_mup(
        &self,
        node_uuid: &str,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<Option<MeterEntry>, StoreError> {
        self.probe_entry(node_uuid, false, false, time_from, time_to)
    }

    pub fn first_rebase(
        &self,
        node_uuid: &str,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<Option<MeterEntry>, StoreError> {
        self.probe_entry(node_uuid, true, true, time_from, time_to)
    }

    pub fn last_rebase(
        &self,
        node_uuid: &str,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<Option<MeterEntry>, StoreError> {
        self.probe_entry(node_uuid, true, false, time_from, time_to)
    }

    // -----------------------------------------------------------------------
    // Gateway snapshots
    // -----------------------------------------------------------------------

    pub fn write_gateway_snapshot(&self, row: &GatewaySnapshotRow) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO gateway_snapshot
                     (gateway_uuid, when_received, network_id, gateway_id, when_booted,
                      free_ram, gateway_time, log_level, tx_power, rec_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.gateway_uuid,
                    row.when_received,
                    row.network_id,
                    row.gateway_id,
                    row.when_booted,
                    row.free_ram,
                    row.gateway_time,
                    row.log_level,
                    row.tx_power,
                    row.rec_status.as_str(),
                ],
            )
            .map_err(|e| conflict_or(e, format!("[{},{}]", row.gateway_uuid, row.when_received)))?;
        Ok(())
    }

    pub fn gateway_snapshots(
        &self,
        q: &HistoryQuery<'_>,
    ) -> Result<Vec<GatewaySnapshotRow>, StoreError> {
        let mut sql = "SELECT gateway_uuid, when_received, network_id, gateway_id, when_booted,
                              free_ram, gateway_time, log_level, tx_power, rec_status
                       FROM gateway_snapshot WHERE 1=1"
            .to_owned();
        let mut args: Vec<Value> = Vec::new();
        push_history_filters(&mut sql, &mut args, q, "gateway_uuid", "when_received");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(GatewaySnapshotRow {
                gateway_uuid: row.get(0)?,
                when_received: row.get(1)?,
                network_id: row.get(2)?,
                gateway_id: row.get(3)?,
                when_booted: row.get(4)?,
                free_ram: row.get(5)?,
                gateway_time: row.get(6)?,
                log_level: row.get(7)?,
                tx_power: row.get(8)?,
                rec_status: parse_status(&row.get::<_, String>(9)?)?,
            })
        })?;
        collect(rows)
    }

    // -----------------------------------------------------------------------
    // Node snapshots
    // -----------------------------------------------------------------------

    pub fn write_node_snapshot(&self, row: &NodeSnapshotRow) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO node_snapshot
                     (node_uuid, when_received, network_id, node_id, gateway_id,
                      batt_voltage_mv, up_time, sleep_time, free_ram, when_last_seen,
                      last_clock_drift, meter_interval, meter_impulses_per_kwh,
                      last_meter_entry_finish, last_meter_value, last_rms_current,
                      puck_led_rate, puck_led_time, last_rssi_at_gateway, rec_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                         ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
                params![
                    row.node_uuid,
                    row.when_received,
                    row.network_id,
                    row.node_id,
                    row.gateway_id,
                    row.batt_voltage_mv,
                    row.up_time,
                    row.sleep_time,
                    row.free_ram,
                    row.when_last_seen,
                    row.last_clock_drift,
                    row.meter_interval,
                    row.meter_impulses_per_kwh,
                    row.last_meter_entry_finish,
                    row.last_meter_value,
                    row.last_rms_current,
                    row.puck_led_rate,
                    row.puck_led_time,
                    row.last_rssi_at_gateway,
                    row.rec_status.as_str(),
                ],
            )
            .map_err(|e| conflict_or(e, format!("[{},{}]", row.node_uuid, row.when_received)))?;
        Ok(())
    }

    pub fn node_snapshots(&self, q: &HistoryQuery<'_>) -> Result<Vec<NodeSnapshotRow>, StoreError> {
        let mut sql = "SELECT node_uuid, when_received, network_id, node_id, gateway_id,
                              batt_voltage_mv, up_time, sleep_time, free_ram, when_last_seen,
                              last_clock_drift, meter_interval, meter_impulses_per_kwh,
                              last_meter_entry_finish, last_meter_value, last_rms_current,
                              puck_led_rate, puck_led_time, last_rssi_at_gateway, rec_status
                       FROM node_snapshot WHERE 1=1"
            .to_owned();
        let mut args: Vec<Value> = Vec::new();
        push_history_filters(&mut sql, &mut args, q, "node_uuid", "when_received");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(NodeSnapshotRow {
                node_uuid: row.get(0)?,
                when_received: row.get(1)?,
                network_id: row.get(2)?,
                node_id: row.get(3)?,
                gateway_id: row.get(4)?,
                batt_voltage_mv: row.get(5)?,
                up_time: row.get(6)?,
                sleep_time: row.get(7)?,
                free_ram: row.get(8)?,
                when_last_seen: row.get(9)?,
                last_clock_drift: row.get(10)?,
                meter_interval: row.get(11)?,
                meter_impulses_per_kwh: row.get(12)?,
                last_meter_entry_finish: row.get(13)?,
                last_meter_value: row.get(14)?,
                last_rms_current: row.get(15)?,
                puck_led_rate: row.get(16)?,
                puck_led_time: row.get(17)?,
                last_rssi_at_gateway: row.get(18)?,
                rec_status: parse_status(&row.get::<_, String>(19)?)?,
            })
        })?;
        collect(rows)
    }

    // -----------------------------------------------------------------------
    // Node events
    // -----------------------------------------------------------------------

    pub fn write_node_event(
        &self,
        node_uuid: &str,
        timestamp: i64,
        event_type: NodeEventType,
        details: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO node_event (node_uuid, timestamp, event_type, details)
             VALUES (?1, ?2, ?3, ?4)",
            params![node_uuid, timestamp, event_type.as_str(), details],
        )?;
        tracing::debug!(node_uuid, event_type = event_type.as_str(), "inserted node_event");
        Ok(())
    }

    pub fn node_events(&self, q: &HistoryQuery<'_>) -> Result<Vec<NodeEventRow>, StoreError> {
        let mut sql =
            "SELECT event_id, node_uuid, timestamp, event_type, details FROM node_event WHERE 1=1"
                .to_owned();
        let mut args: Vec<Value> = Vec::new();
        if let Some(uuid) = q.uuid {
            sql.push_str(" AND node_uuid = ?");
            args.push(Value::from(uuid.to_owned()));
        }
        if let Some(t) = q.time_from {
            sql.push_str(" AND timestamp >= ?");
            args.push(Value::from(t));
        }
        if let Some(t) = q.time_to {
            sql.push_str(" AND timestamp <= ?");
            args.push(Value::from(t));
        }
        if let Some(kind) = q.event_type {
            sql.push_str(" AND event_type = ?");
            args.push(Value::from(kind.to_owned()));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        if let Some(n) = q.limit {
            sql.push_str(" LIMIT ?");
            args.push(Value::from(n));
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| {
            Ok(NodeEventRow {
                event_id: row.get(0)?,
                node_uuid: row.get(1)?,
                timestamp: row.get(2)?,
                event_type: row.get(3)?,
                details: row.get(4)?,
            })
        })?;
        collect(rows)
    }

    // -----------------------------------------------------------------------
    // System parameters and users
    // -----------------------------------------------------------------------

    pub fn set_sys_param(&self, name: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO sys_param (name, value) VALUES (?1, ?2)
             ON CONFLICT (name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }

    pub fn sys_param(&self, name: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sys_param WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn write_user(
        &self,
        username: &str,
        password: &str,
        permissions: &str,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO user (username, password, permissions) VALUES (?1, ?2, ?3)",
                params![username, password, permissions],
            )
            .map_err(|e| conflict_or(e, format!("[{}]", username)))?;
        Ok(())
    }

    pub fn user(&self, username: &str) -> Result<Option<UserRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT username, password, permissions FROM user WHERE username = ?1",
                params![username],
                |row| {
                    Ok(UserRow {
                        username: row.get(0)?,
                        password: row.get(1)?,
                        permissions: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn map_meter_entry(row: &rusqlite::Row<'_>) -> Result<MeterEntry, rusqlite::Error> {
    Ok(MeterEntry {
        node_uuid: row.get(0)?,
        when_start_raw: row.get(1)?,
        when_start_raw_nonce: row.get(2)?,
        when_start: row.get(3)?,
        duration: row.get(4)?,
        entry_type: parse_entry_type(&row.get::<_, String>(5)?)?,
        entry_value: row.get(6)?,
        meter_value: row.get(7)?,
        rec_status: parse_status(&row.get::<_, String>(8)?)?,
    })
}

fn parse_entry_type(tag: &str) -> Result<EntryType, rusqlite::Error> {
    EntryType::from_tag(tag).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown entry_type '{}'", tag).into(),
        )
    })
}

fn parse_status(tag: &str) -> Result<RecStatus, rusqlite::Error> {
    RecStatus::from_tag(tag).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown rec_status '{}'", tag).into(),
        )
    })
}

fn push_history_filters(
    sql: &mut String,
    args: &mut Vec<Value>,
    q: &HistoryQuery<'_>,
    uuid_col: &str,
    time_col: &str,
) {
    if let Some(uuid) = q.uuid {
        sql.push_str(&format!(" AND {} = ?", uuid_col));
        args.push(Value::from(uuid.to_owned()));
    }
    if let Some(t) = q.time_from {
        sql.push_str(&format!(" AND {} >= ?", time_col));
        args.push(Value::from(t));
    }
    if let Some(t) = q.time_to {
        sql.push_str(&format!(" AND {} <= ?", time_col));
        args.push(Value::from(t));
    }
    if let Some(s) = q.rec_status {
        sql.push_str(" AND rec_status = ?");
        args.push(Value::from(s.as_str().to_owned()));
    }
    sql.push_str(&format!(" ORDER BY {} DESC", time_col));
    if let Some(n) = q.limit {
        sql.push_str(" LIMIT ?");
        args.push(Value::from(n));
    }
}

fn collect<T>(
    rows: impl Iterator<Item = Result<T, rusqlite::Error>>,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
