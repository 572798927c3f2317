//! The device manager.
//!
//! Holds every gateway link and the in-memory node registry, and runs the
//! periodic `tick()`: drain each link's inbound buffer past the high-water
//! mark, dispatch decoded frames into the data manager, apply cadenced
//! control (time sync, snapshot polling), and emit simulated meter traffic.
//!
//! A faulting handler is logged and skipped; dispatch always continues with
//! the next message.

use crate::config::SimMeterConfig;
use crate::worker::{BufferKey, LinkShared};
use chrono::Utc;
use gw_proto::{
    ALL_NODES, Frame, Message, MeterUpdate, NodeSnapshot, Provenance, decode_frame, encode,
};
use meter_store::store::{GatewaySnapshotRow, NodeEventType, NodeSnapshotRow, RecStatus};
use meter_store::{DataManager, MeterReading};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Snapshot polling cadence (gateway + all nodes).
pub const NODE_UPDATE_INTERVAL_SECS: u64 = 900;
/// Gateway clock sync cadence.
pub const GATEWAY_TIME_SYNC_INTERVAL_SECS: u64 = 600;

#[derive(Debug)]
pub enum DeviceError {
    UnknownNode(String),
    UnknownGateway(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::UnknownNode(uuid) => write!(f, "unknown node: {}", uuid),
            DeviceError::UnknownGateway(uuid) => write!(f, "unknown gateway: {}", uuid),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Bookkeeping for one observed node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: u8,
    pub gateway_uuid: String,
    pub when_last_entry: Option<i64>,
    pub last_meter_value: Option<i64>,
    pub last_rms_current: Option<f64>,
}

struct SimMeter {
    node_id: u8,
    interval: i64,
    value: i64,
    read_min: i64,
    read_max: i64,
    max_msg_entries: i64,
    current_msg_start: i64,
}

struct GatewayRuntime {
    shared: Arc<LinkShared>,
    last_drained: Option<BufferKey>,
    last_time_sync: Option<Instant>,
    last_snap_poll: Option<Instant>,
    sim_meters: HashMap<String, SimMeter>,
}

pub struct DeviceManager {
    gateways: HashMap<String, GatewayRuntime>,
    meters: HashMap<String, NodeRecord>,
    data: Arc<Mutex<DataManager>>,
}

impl DeviceManager {
    pub fn new(data: Arc<Mutex<DataManager>>) -> Self {
        DeviceManager {
            gateways: HashMap::new(),
            meters: HashMap::new(),
            data,
        }
    }

    pub fn add_gateway(&mut self, shared: Arc<LinkShared>) {
        self.gateways.insert(
            shared.uuid.clone(),
            GatewayRuntime {
                shared,
                last_drained: None,
                last_time_sync: None,
                last_snap_poll: None,
                sim_meters: HashMap::new(),
            },
        );
    }

    pub fn gateway(&self, uuid: &str) -> Option<&Arc<LinkShared>> {
        self.gateways.get(uuid).map(|rt| &rt.shared)
    }

    pub fn node(&self, node_uuid: &str) -> Option<&NodeRecord> {
        self.meters.get(node_uuid)
    }

    pub fn add_sim_meter(&mut self, cfg: &SimMeterConfig) -> Result<(), DeviceError> {
        let gateway_uuid = node_uuid(&cfg.network_id, cfg.gateway_id);
        let runtime = self
            .gateways
            .get_mut(&gateway_uuid)
            .ok_or_else(|| DeviceError::UnknownGateway(gateway_uuid.clone()))?;
        let sim_uuid = node_uuid(&cfg.network_id, cfg.node_id);
        runtime.sim_meters.insert(
            sim_uuid,
            SimMeter {
                node_id: cfg.node_id,
                interval: cfg.interval,
                value: cfg.start_val,
                read_min: cfg.read_min,
                read_max: cfg.read_max,
                max_msg_entries: cfg.max_msg_entries,
                current_msg_start: 0,
            },
        );
        Ok(())
    }

    pub fn remove_sim_meter(&mut self, gateway_uuid: &str, sim_uuid: &str) {
        if let Some(runtime) = self.gateways.get_mut(gateway_uuid) {
            runtime.sim_meters.remove(sim_uuid);
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// One control-loop pass over every gateway.
    pub fn tick(&mut self) {
        let uuids: Vec<String> = self.gateways.keys().cloned().collect();
        for uuid in uuids {
            self.drain_and_dispatch(&uuid);
            self.apply_cadences(&uuid);
            self.run_sim_meters(&uuid);
        }
    }

    fn drain_and_dispatch(&mut self, gateway_uuid: &str) {
        let drained = {
            let Some(runtime) = self.gateways.get_mut(gateway_uuid) else {
                return;
            };
            let drained = runtime.shared.drain_after(runtime.last_drained);
            if let Some((key, _)) = drained.last() {
                runtime.last_drained = Some(*key);
            }
            drained
        };
        for (_key, frame) in drained {
            if let Err(e) = self.dispatch(&frame) {
                tracing::error!(
                    gateway = gateway_uuid,
                    msg_type = ?frame.msg_type,
                    error = %e,
                    "failed to process message"
                );
            }
        }
    }

    fn apply_cadences(&mut self, gateway_uuid: &str) {
        let Some(runtime) = self.gateways.get_mut(gateway_uuid) else {
            return;
        };
        if cadence_due(
            &mut runtime.last_time_sync,
            Duration::from_secs(GATEWAY_TIME_SYNC_INTERVAL_SECS),
        ) {
            runtime.shared.enqueue(&Message::TimeSet {
                epoch_time: Utc::now().timestamp(),
            });
        }
        if cadence_due(
            &mut runtime.last_snap_poll,
            Duration::from_secs(NODE_UPDATE_INTERVAL_SECS),
        ) {
            runtime.shared.enqueue(&Message::GatewaySnapshotRequest);
            runtime
                .shared
                .enqueue(&Message::NodeSnapshotRequest { node_id: ALL_NODES });
        }
    }

    /// Synthesize due simulated meter frames and feed them through the
    /// regular codec + dispatch path, exactly like radio traffic.
    fn run_sim_meters(&mut self, gateway_uuid: &str) {
        let now = Utc::now().timestamp();
        let mut frames: Vec<Frame> = Vec::new();
        {
            let Some(runtime) = self.gateways.get_mut(gateway_uuid) else {
                return;
            };
            let network_id = runtime.shared.network_id.clone();
            let gateway_id = runtime.shared.gateway_id;
            let mut rng = rand::thread_rng();
            for sim in runtime.sim_meters.values_mut() {
                let message_interval = sim.max_msg_entries * sim.interval;
                if sim.current_msg_start >= now - message_interval {
                    continue;
                }
                if sim.current_msg_start == 0 {
                    sim.current_msg_start = now - message_interval;
                }
                let update_base_value = sim.value;
                let intervals = (1..sim.max_msg_entries)
                    .map(|_| {
                        let entry_value = rng.gen_range(sim.read_min..=sim.read_max);
                        sim.value += entry_value;
                        gw_proto::MeterInterval {
                            entry_interval_length: sim.interval,
                            entry_value,
                            spot_rms_current: None,
                        }
                    })
                    .collect();
                let line = encode(&Message::MeterUpdate(MeterUpdate {
                    node_id: sim.node_id,
                    last_entry_finish_time: sim.current_msg_start,
                    last_entry_meter_value: update_base_value,
                    intervals,
                }));
                sim.current_msg_start = now;
                tracing::debug!(line, "generated simulated meter update");
                match decode_frame(&line, Provenance::new(now, &network_id, gateway_id)) {
                    Ok(frame) => frames.push(frame),
                    Err(e) => {
                        tracing::error!(line, error = %e, "simulated frame failed to decode");
                    }
                }
            }
        }
        for frame in frames {
            if let Err(e) = self.dispatch(&frame) {
                tracing::error!(error = %e, "failed to process simulated update");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route one decoded frame to its handler.
    pub fn dispatch(&mut self, frame: &Frame) -> Result<(), DeviceError> {
        match &frame.message {
            Message::MeterUpdate(update) => self.proc_meter_update(frame, update, false),
            Message::MeterUpdateRms(update) => self.proc_meter_update(frame, update, true),
            Message::MeterRebase {
                node_id,
                entry_timestamp,
                meter_value,
            } => self.proc_meter_rebase(frame, *node_id, *entry_timestamp, *meter_value),
            Message::GatewaySnapshot(snapshot) => {
                let row = GatewaySnapshotRow {
                    gateway_uuid: frame.provenance.gateway_uuid.clone(),
                    when_received: frame.provenance.when_received,
                    network_id: frame.provenance.network_id.clone(),
                    gateway_id: i64::from(frame.provenance.gateway_id),
                    when_booted: snapshot.when_booted,
                    free_ram: snapshot.free_ram,
                    gateway_time: snapshot.gateway_time,
                    log_level: snapshot.log_level.clone(),
                    // The encryption key passes through opaquely and is
                    // never persisted.
                    tx_power: snapshot.tx_power,
                    rec_status: RecStatus::Norm,
                };
                self.data_lock().proc_gateway_snapshot(&row);
                tracing::info!(gateway = %frame.provenance.gateway_uuid, "got gateway snapshot");
                Ok(())
            }
            Message::NodeSnapshots(snapshots) => {
                if snapshots.is_empty() {
                    tracing::info!("got 0 node snapshots");
                }
                for snapshot in snapshots {
                    self.proc_node_snapshot(frame, snapshot);
                }
                Ok(())
            }
            Message::NodeDark { node_id, last_seen } => {
                let uuid = self.observe_node(frame, *node_id);
                self.data_lock().proc_node_event(
                    &uuid,
                    frame.provenance.when_received,
                    NodeEventType::Dark,
                    &format!("last seen at: {}", last_seen),
                );
                tracing::info!(node = %uuid, last_seen, "got node dark");
                Ok(())
            }
            Message::GpMessage { node_id, text } => {
                let uuid = self.observe_node(frame, *node_id);
                if text.starts_with("BOOT") {
                    self.data_lock().proc_node_event(
                        &uuid,
                        frame.provenance.when_received,
                        NodeEventType::Boot,
                        text,
                    );
                } else {
                    tracing::debug!(node = %uuid, text, "unrecognised general-purpose message");
                }
                Ok(())
            }
            Message::NodeSnapshotNack { node_id } => {
                tracing::warn!(
                    gateway = %frame.provenance.gateway_uuid,
                    node_id,
                    "gateway could not snapshot node"
                );
                Ok(())
            }
            other => {
                tracing::warn!(msg_type = ?other.msg_type(), "got unexpected message, ignoring");
                Ok(())
            }
        }
    }

    /// Reconstruct absolute entries from a delta-encoded update.
    ///
    /// The header names the finish of the entry immediately before the first
    /// interval, so the first reconstructed start is one second after it.
    fn proc_meter_update(
        &mut self,
        frame: &Frame,
        update: &MeterUpdate,
        with_rms: bool,
    ) -> Result<(), DeviceError> {
        let uuid = self.observe_node(frame, update.node_id);
        if update.intervals.is_empty() {
            tracing::info!(node = %uuid, "got empty meter update");
            return Ok(());
        }

        let mut when_start = update.last_entry_finish_time + 1;
        let mut meter_value = update.last_entry_meter_value;
        let mut readings = Vec::with_capacity(update.intervals.len());
        let mut last_rms = None;
        for interval in &update.intervals {
            when_start += interval.entry_interval_length;
            meter_value += interval.entry_value;
            readings.push(MeterReading {
                when_start,
                entry_value: interval.entry_value,
                entry_interval_length: interval.entry_interval_length,
                meter_value,
            });
            if with_rms {
                last_rms = interval.spot_rms_current;
            }
        }

        let record = self
            .meters
            .get_mut(&uuid)
            .ok_or_else(|| DeviceError::UnknownNode(uuid.clone()))?;
        record.when_last_entry = Some(when_start);
        record.last_meter_value = Some(meter_value);
        if with_rms {
            record.last_rms_current = last_rms;
        }

        self.data_lock().proc_meter_update(&uuid, &readings);
        tracing::info!(
            node = %uuid,
            last_entry_at = when_start,
            meter_value,
            "got meter update"
        );
        Ok(())
    }

    fn proc_meter_rebase(
        &mut self,
        frame: &Frame,
        node_id: u8,
        entry_timestamp: i64,
        meter_value: i64,
    ) -> Result<(), DeviceError> {
        let uuid = self.observe_node(frame, node_id);
        let record = self
            .meters
            .get_mut(&uuid)
            .ok_or_else(|| DeviceError::UnknownNode(uuid.clone()))?;
        record.when_last_entry = Some(entry_timestamp);
        record.last_meter_value = Some(meter_value);

        self.data_lock()
            .proc_meter_rebase(&uuid, entry_timestamp, meter_value);
        tracing::info!(node = %uuid, entry_timestamp, meter_value, "got meter rebase");
        Ok(())
    }

    fn proc_node_snapshot(&mut self, frame: &Frame, snapshot: &NodeSnapshot) {
        let uuid = self.observe_node(frame, snapshot.node_id);
        if let Some(record) = self.meters.get_mut(&uuid) {
            record.when_last_entry = Some(snapshot.last_meter_entry_finish);
            record.last_meter_value = Some(snapshot.last_meter_value);
            record.last_rms_current = Some(snapshot.last_rms_current);
        }
        let row = NodeSnapshotRow {
            node_uuid: uuid.clone(),
            when_received: frame.provenance.when_received,
            network_id: frame.provenance.network_id.clone(),
            node_id: i64::from(snapshot.node_id),
            gateway_id: i64::from(frame.provenance.gateway_id),
            batt_voltage_mv: snapshot.batt_voltage,
            up_time: snapshot.up_time,
            sleep_time: snapshot.sleep_time,
            free_ram: snapshot.free_ram,
            when_last_seen: snapshot.when_last_seen,
            last_clock_drift: snapshot.last_clock_drift,
            meter_interval: snapshot.meter_interval,
            meter_impulses_per_kwh: snapshot.meter_impulses_per_kwh,
            last_meter_entry_finish: snapshot.last_meter_entry_finish,
            last_meter_value: snapshot.last_meter_value,
            last_rms_current: snapshot.last_rms_current,
            puck_led_rate: snapshot.puck_led_rate,
            puck_led_time: snapshot.puck_led_time,
            last_rssi_at_gateway: snapshot.last_rssi_at_gateway,
            rec_status: RecStatus::Norm,
        };
        self.data_lock().proc_node_snapshot(&row);
        tracing::info!(node = %uuid, "got node snapshot");
    }

    // -----------------------------------------------------------------------
    // Control fan-out
    // -----------------------------------------------------------------------

    pub fn set_node_gw_inst_tmp_rate(
        &self,
        node_uuid: &str,
        tmp_poll_rate: i64,
        tmp_poll_period: i64,
    ) -> Result<(), DeviceError> {
        let (shared, node_id) = self.route(node_uuid)?;
        shared.enqueue(&Message::GinrTmpRateSet {
            node_id,
            tmp_poll_rate,
            tmp_poll_period,
        });
        Ok(())
    }

    pub fn set_node_meter_value(
        &self,
        node_uuid: &str,
        new_meter_value: i64,
    ) -> Result<(), DeviceError> {
        let (shared, node_id) = self.route(node_uuid)?;
        shared.enqueue(&Message::MeterValueSet {
            node_id,
            new_meter_value,
        });
        Ok(())
    }

    pub fn set_node_meter_interval(
        &self,
        node_uuid: &str,
        new_interval: i64,
    ) -> Result<(), DeviceError> {
        let (shared, node_id) = self.route(node_uuid)?;
        shared.enqueue(&Message::MeterIntervalSet {
            node_id,
            new_interval,
        });
        Ok(())
    }

    pub fn set_node_puck_led(
        &self,
        node_uuid: &str,
        new_led_rate: i64,
        new_led_time: i64,
    ) -> Result<(), DeviceError> {
        let (shared, node_id) = self.route(node_uuid)?;
        shared.enqueue(&Message::PuckLedSet {
            node_id,
            new_led_rate,
            new_led_time,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn route(&self, node_uuid: &str) -> Result<(&Arc<LinkShared>, u8), DeviceError> {
        let record = self
            .meters
            .get(node_uuid)
            .ok_or_else(|| DeviceError::UnknownNode(node_uuid.to_owned()))?;
        let runtime = self
            .gateways
            .get(&record.gateway_uuid)
            .ok_or_else(|| DeviceError::UnknownGateway(record.gateway_uuid.clone()))?;
        Ok((&runtime.shared, record.node_id))
    }

    /// Register the node on first observation and return its uuid.
    fn observe_node(&mut self, frame: &Frame, node_id: u8) -> String {
        let uuid = node_uuid(&frame.provenance.network_id, node_id);
        self.meters.entry(uuid.clone()).or_insert_with(|| NodeRecord {
            node_id,
            gateway_uuid: frame.provenance.gateway_uuid.clone(),
            when_last_entry: None,
            last_meter_value: None,
            last_rms_current: None,
        });
        uuid
    }

    fn data_lock(&self) -> std::sync::MutexGuard<'_, DataManager> {
        self.data.lock().expect("data manager lock poisoned")
    }
}

pub fn node_uuid(network_id: &str, node_id: u8) -> String {
    format!("{}.{}", network_id, node_id)
}

fn cadence_due(last: &mut Option<Instant>, every: Duration) -> bool {
    match last {
        Some(at) if at.elapsed() < every => false,
        _ => {
            *last = Some(Instant::now());
            true
        }
    }
}
