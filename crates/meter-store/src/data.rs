//! The data manager: write paths, soft delete, synthetic upsert, and the
//! consumption algorithm.
//!
//! # Consumption
//! A rebase is an authoritative restatement of the node's cumulative
//! counter. Between two rebases, their difference *is* consumption. Outside
//! the span of rebases only the observed update deltas are trustworthy, so
//! the algorithm stitches: observed consumption before the first rebase,
//! the rebase-to-rebase span, and observed consumption after the last
//! rebase.

use crate::event_log::EventLog;
use crate::store::{
    EntryQuery, EntryType, GatewaySnapshotRow, HistoryQuery, MeterEntry, NodeEventRow,
    NodeEventType, NodeSnapshotRow, RecStatus, Store, StoreError,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Attempts at re-rolling the tie-break nonce before giving up on an insert.
const NONCE_RETRY_LIMIT: u32 = 8;

/// One reconstructed meter interval, ready to persist. Also the upload wire
/// format for synthetic reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterReading {
    pub when_start: i64,
    pub entry_value: i64,
    pub entry_interval_length: i64,
    pub meter_value: i64,
}

/// Consumption over a window, plus the probe values that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct Consumption {
    pub meter_consumption: i64,
    pub calc_breakdown: String,
}

pub struct DataManager {
    store: Store,
    event_log: Option<EventLog>,
    /// When set, snapshots are not mirrored to the evidence file.
    ev_meter_only: bool,
}

impl DataManager {
    pub fn new(store: Store) -> Self {
        DataManager {
            store,
            event_log: None,
            ev_meter_only: false,
        }
    }

    pub fn with_event_log(store: Store, event_log: EventLog, meter_only: bool) -> Self {
        DataManager {
            store,
            event_log: Some(event_log),
            ev_meter_only: meter_only,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Observed write path
    // -----------------------------------------------------------------------

    /// Persist reconstructed update entries for a node. Store failures are
    /// logged and absorbed; a key collision re-rolls the nonce.
    pub fn proc_meter_update(&mut self, node_uuid: &str, readings: &[MeterReading]) {
        for reading in readings {
            let Some(nonce) = self.write_entry(
                node_uuid,
                reading.when_start,
                EntryType::MeterUpdate,
                reading.entry_value,
                reading.entry_interval_length,
                reading.meter_value,
            ) else {
                continue;
            };
            self.record_event_line(
                false,
                &format!(
                    "MTRUPDATE,{},{},{},{},{},{},{},{},{}",
                    node_uuid,
                    reading.when_start,
                    nonce,
                    reading.when_start,
                    EntryType::MeterUpdate.as_str(),
                    reading.entry_value,
                    reading.entry_interval_length,
                    reading.meter_value,
                    RecStatus::Norm.as_str(),
                ),
            );
        }
    }

    /// Persist an authoritative counter restatement.
    pub fn proc_meter_rebase(&mut self, node_uuid: &str, entry_timestamp: i64, meter_value: i64) {
        let Some(nonce) = self.write_entry(
            node_uuid,
            entry_timestamp,
            EntryType::MeterRebase,
            0,
            0,
            meter_value,
        ) else {
            return;
        };
        self.record_event_line(
            false,
            &format!(
                "MTRREBASE,{},{},{},{},{},{},{}",
                node_uuid,
                entry_timestamp,
                nonce,
                entry_timestamp,
                EntryType::MeterRebase.as_str(),
                meter_value,
                RecStatus::Norm.as_str(),
            ),
        );
    }

    pub fn proc_gateway_snapshot(&mut self, row: &GatewaySnapshotRow) {
        if let Err(e) = self.store.write_gateway_snapshot(row) {
            tracing::warn!(gateway_uuid = %row.gateway_uuid, error = %e, "gateway snapshot write failed");
            return;
        }
        self.record_event_line(
            true,
            &format!(
                "GWSNAP,{},{},{},{},{},{},{},{},{}",
                row.gateway_uuid,
                row.when_received,
                row.network_id,
                row.gateway_id,
                row.when_booted,
                row.free_ram,
                row.gateway_time,
                row.log_level,
                row.tx_power,
            ),
        );
    }

    pub fn proc_node_snapshot(&mut self, row: &NodeSnapshotRow) {
        if let Err(e) = self.store.write_node_snapshot(row) {
            tracing::warn!(node_uuid = %row.node_uuid, error = %e, "node snapshot write failed");
            return;
        }
        self.record_event_line(
            true,
            &format!(
                "NODESNAP,{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
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
            ),
        );
    }

    pub fn proc_node_event(
        &mut self,
        node_uuid: &str,
        timestamp: i64,
        event_type: NodeEventType,
        details: &str,
    ) {
        if let Err(e) = self
            .store
            .write_node_event(node_uuid, timestamp, event_type, details)
        {
            tracing::warn!(node_uuid, error = %e, "node event write failed");
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// NORM entries for a node (or every node), newest first.
    pub fn meter_entries(
        &self,
        node_uuid: Option<&str>,
        time_from: Option<i64>,
        time_to: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<MeterEntry>, StoreError> {
        self.store.meter_entries(&EntryQuery {
            node_uuid,
            rec_status: Some(RecStatus::Norm),
            time_from,
            time_to,
            limit,
            ..EntryQuery::default()
        })
    }

    pub fn gateway_snapshots(
        &self,
        gateway_uuid: Option<&str>,
        time_from: Option<i64>,
        time_to: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<GatewaySnapshotRow>, StoreError> {
        self.store.gateway_snapshots(&HistoryQuery {
            uuid: gateway_uuid,
            time_from,
            time_to,
            limit,
            ..HistoryQuery::default()
        })
    }

    pub fn node_snapshots(
        &self,
        node_uuid: Option<&str>,
        time_from: Option<i64>,
        time_to: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<NodeSnapshotRow>, StoreError> {
        self.store.node_snapshots(&HistoryQuery {
            uuid: node_uuid,
            time_from,
            time_to,
            limit,
            ..HistoryQuery::default()
        })
    }

    pub fn node_events(
        &self,
        node_uuid: Option<&str>,
        time_from: Option<i64>,
        time_to: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Vec<NodeEventRow>, StoreError> {
        self.store.node_events(&HistoryQuery {
            uuid: node_uuid,
            time_from,
            time_to,
            limit,
            ..HistoryQuery::default()
        })
    }

    // -----------------------------------------------------------------------
    // Consumption
    // -----------------------------------------------------------------------

    /// Consumption in watt-hours over `[time_from, time_to]`, per the
    /// stitching rules described in the module docs.
    pub fn meter_consumption(
        &self,
        node_uuid: &str,
        time_from: Option<i64>,
        time_to: Option<i64>,
    ) -> Result<Consumption, StoreError> {
        let first_mup = self.store.first_mup(node_uuid, time_from, time_to)?;
        let last_mup = self.store.last_mup(node_uuid, time_from, time_to)?;

        // Fewer than two update probes means nothing to measure.
        let abort_calc = first_mup.is_none() || last_mup.is_none();

        let first_rebase = self.store.first_rebase(node_uuid, time_from, time_to)?;
        let mut mup_before_first_rebase: Option<MeterEntry> = None;
        let mut last_rebase: Option<MeterEntry> = None;
        if !abort_calc {
            if let Some(fr) = &first_rebase {
                mup_before_first_rebase =
                    self.store
                        .last_mup(node_uuid, time_from, Some(fr.when_start - 1))?;
                last_rebase = self.store.last_rebase(node_uuid, time_from, time_to)?;
                // A lone rebase is both first and last; treat last as absent.
                if last_rebase
                    .as_ref()
                    .is_some_and(|lr| lr.when_start == fr.when_start)
                {
                    last_rebase = None;
                }
            }
        }

        let mut meter_consumption = 0i64;
        let mut settled = abort_calc;

        match (&first_mup, &last_mup, &first_rebase) {
            // Simple case: no rebase, span of observed values.
            (Some(first), Some(last), None) if !settled => {
                meter_consumption = last.meter_value - first.meter_value;
                settled = true;
            }
            // Observed reads before the reset count on their own.
            (Some(first), Some(_), Some(fr)) if !settled => {
                if let Some(before) = &mup_before_first_rebase {
                    if first.when_start < fr.when_start {
                        meter_consumption = before.meter_value - first.meter_value;
                    }
                }
            }
            _ => {}
        }

        if !settled {
            let fr = first_rebase
                .as_ref()
                .expect("unsettled calc implies a first rebase");
            let last = last_mup.as_ref().expect("unsettled calc implies updates");
            if let Some(lr) = &last_rebase {
                // Between rebases the restatements are authoritative.
                meter_consumption += lr.meter_value - fr.meter_value;
                if last.when_start >= lr.when_start {
                    meter_consumption += last.meter_value - lr.meter_value;
                }
            } else if last.when_start >= fr.when_start {
                meter_consumption += last.meter_value - fr.meter_value;
            } else {
                // The rebase moved the counter past the last observed value;
                // the delta counts positively.
                meter_consumption += fr.meter_value - last.meter_value;
            }
        }

        let calc_breakdown = format!(
            "{} Wh given first_mup_entry={}, mup_entry_before_first_rebase={}, \
             first_rebase_entry={}, last_rebase_entry={}, last_mup_entry={}.",
            meter_consumption,
            fmt_probe(&first_mup),
            fmt_probe(&mup_before_first_rebase),
            fmt_probe(&first_rebase),
            fmt_probe(&last_rebase),
            fmt_probe(&last_mup),
        );

        Ok(Consumption {
            meter_consumption,
            calc_breakdown,
        })
    }

    // -----------------------------------------------------------------------
    // Soft delete and synthetic upsert
    // -----------------------------------------------------------------------

    /// Mark entries in range as deleted. Rows are never purged.
    pub fn delete_meter_entries_in_range(
        &mut self,
        node_uuid: Option<&str>,
        time_from: i64,
        time_to: i64,
        entry_type: Option<EntryType>,
    ) -> Result<usize, StoreError> {
        self.store
            .mark_meter_entries(node_uuid, time_from, time_to, entry_type, RecStatus::Deleted)
    }

    /// Overwrite a range with synthetic entries.
    ///
    /// Observed and synthetic updates already in `[overwrite_time_from,
    /// overwrite_time_to]` are marked deleted, the supplied readings are
    /// written as MUPS rows (preceded by an anchoring MREBS when
    /// `rebase_first`), and with `lift_later` every NORM entry after the last
    /// supplied reading has its cumulative value re-anchored so the counter
    /// stays monotonic across the splice.
    pub fn upsert_synth_meter_updates(
        &mut self,
        node_uuid: &str,
        overwrite_time_from: i64,
        overwrite_time_to: i64,
        readings: &[MeterReading],
        rebase_first: bool,
        lift_later: bool,
    ) -> Result<(), StoreError> {
        self.delete_meter_entries_in_range(
            Some(node_uuid),
            overwrite_time_from,
            overwrite_time_to,
            Some(EntryType::MeterUpdate),
        )?;
        self.delete_meter_entries_in_range(
            Some(node_uuid),
            overwrite_time_from,
            overwrite_time_to,
            Some(EntryType::MeterUpdateSynth),
        )?;

        let Some(first) = readings.first() else {
            tracing::warn!(node_uuid, "synthetic upsert called with no readings");
            return Ok(());
        };

        if rebase_first {
            self.write_entry(
                node_uuid,
                first.when_start,
                EntryType::MeterRebaseSynth,
                0,
                0,
                first.meter_value,
            );
        }

        for reading in readings {
            self.write_entry(
                node_uuid,
                reading.when_start,
                EntryType::MeterUpdateSynth,
                reading.entry_value,
                reading.entry_interval_length,
                reading.meter_value,
            );
        }

        if lift_later {
            let last = readings.last().expect("readings is non-empty");
            let mut running = last.meter_value;
            for entry in self
                .store
                .norm_entries_from(node_uuid, last.when_start + 1)?
            {
                running += entry.entry_value;
                self.store.update_meter_entry_value(
                    node_uuid,
                    entry.when_start_raw,
                    &entry.when_start_raw_nonce,
                    running,
                )?;
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Insert one entry, re-rolling the nonce on key collision. Returns the
    /// nonce used, or `None` when the write was abandoned.
    fn write_entry(
        &mut self,
        node_uuid: &str,
        when_start: i64,
        entry_type: EntryType,
        entry_value: i64,
        duration: i64,
        meter_value: i64,
    ) -> Option<String> {
        for attempt in 0..NONCE_RETRY_LIMIT {
            let nonce = nonce();
            let entry = MeterEntry {
                node_uuid: node_uuid.to_owned(),
                when_start_raw: when_start,
                when_start_raw_nonce: nonce.clone(),
                when_start,
                duration,
                entry_type,
                entry_value,
                meter_value,
                rec_status: RecStatus::Norm,
            };
            match self.store.write_meter_entry(&entry) {
                Ok(()) => return Some(nonce),
                Err(StoreError::Conflict(key)) => {
                    tracing::debug!(key, attempt, "meter entry nonce collision, re-rolling");
                }
                Err(e) => {
                    tracing::warn!(node_uuid, error = %e, "meter entry write failed");
                    return None;
                }
            }
        }
        tracing::warn!(
            node_uuid,
            when_start,
            "dropping meter entry after {} nonce collisions",
            NONCE_RETRY_LIMIT
        );
        None
    }

    fn record_event_line(&mut self, snapshot: bool, line: &str) {
        if snapshot && self.ev_meter_only {
            return;
        }
        if let Some(log) = &mut self.event_log {
            log.record(line);
        }
    }
}

/// Two uppercase ASCII letters; tie-break for same-second entries.
fn nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..2)
        .map(|_| char::from(rng.gen_range(b'A'..=b'Z')))
        .collect()
}

fn fmt_probe(entry: &Option<MeterEntry>) -> String {
    match entry {
        Some(e) => e.meter_value.to_string(),
        None => "None".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_two_uppercase_letters() {
        for _ in 0..100 {
            let n = nonce();
            assert_eq!(n.len(), 2);
            assert!(n.chars().all(|c| c.is_ascii_uppercase()));
        }
    }
}
