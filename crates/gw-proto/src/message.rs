//! Typed messages and the schema-driven codec entry points.
//!
//! [`decode_frame`] turns a received line into a [`Frame`]: the typed
//! [`Message`] plus provenance and record counts. [`encode`] turns any
//! [`Message`] back into a bare line. Both walk the schema table, so field
//! order and naming have exactly one definition.

use crate::codec::{self, FrameError, RawFrame, malformed};
use crate::schema::{self, FieldDef, FieldRole, MsgType};

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Where and when a frame entered the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// Receive time, UTC epoch seconds.
    pub when_received: i64,
    /// Four-octet network id, e.g. `0.0.1.1`.
    pub network_id: String,
    pub gateway_id: u8,
    /// `network_id + "." + gateway_id`.
    pub gateway_uuid: String,
}

impl Provenance {
    pub fn new(when_received: i64, network_id: &str, gateway_id: u8) -> Self {
        Provenance {
            when_received,
            network_id: network_id.to_owned(),
            gateway_id,
            gateway_uuid: format!("{}.{}", network_id, gateway_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Message payloads
// ---------------------------------------------------------------------------

/// Gateway self-description, as reported in a `GWSNAP` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySnapshot {
    pub gateway_id: u8,
    pub when_booted: i64,
    pub free_ram: i64,
    pub gateway_time: i64,
    pub log_level: String,
    pub encrypt_key: String,
    pub network_id: String,
    pub tx_power: i64,
}

/// Per-node state, one per `NOSNAP` detail record.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSnapshot {
    pub node_id: u8,
    pub batt_voltage: i64,
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
}

/// One interval of a meter update. The wire carries deltas; absolute start
/// times and cumulative values are reconstructed by the device manager.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterInterval {
    pub entry_interval_length: i64,
    pub entry_value: i64,
    /// Present on `MUPC` frames only.
    pub spot_rms_current: Option<f64>,
}

/// Header + intervals of a `MUP_` / `MUPC` frame.
///
/// `last_entry_finish_time` and `last_entry_meter_value` describe the entry
/// immediately preceding the first interval.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterUpdate {
    pub node_id: u8,
    pub last_entry_finish_time: i64,
    pub last_entry_meter_value: i64,
    pub intervals: Vec<MeterInterval>,
}

/// Every message in the catalogue, both directions.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    TimeRequest,
    TimeSet { epoch_time: i64 },
    TimeSetAck,
    TimeSetNack,
    GatewaySnapshotRequest,
    GatewaySnapshot(GatewaySnapshot),
    NodeSnapshotRequest { node_id: u8 },
    NodeSnapshotNack { node_id: u8 },
    NodeSnapshots(Vec<NodeSnapshot>),
    MeterUpdate(MeterUpdate),
    MeterUpdateRms(MeterUpdate),
    MeterRebase { node_id: u8, entry_timestamp: i64, meter_value: i64 },
    MeterValueSet { node_id: u8, new_meter_value: i64 },
    MeterValueSetAck { node_id: u8 },
    MeterValueSetNack { node_id: u8 },
    MeterIntervalSet { node_id: u8, new_interval: i64 },
    MeterIntervalSetAck { node_id: u8 },
    MeterIntervalSetNack { node_id: u8 },
    PuckLedSet { node_id: u8, new_led_rate: i64, new_led_time: i64 },
    PuckLedSetAck { node_id: u8 },
    PuckLedSetNack { node_id: u8 },
    GinrTmpRateSet { node_id: u8, tmp_poll_rate: i64, tmp_poll_period: i64 },
    GinrTmpRateSetAck { node_id: u8 },
    GinrTmpRateSetNack { node_id: u8 },
    NodeDark { node_id: u8, last_seen: i64 },
    GpMessage { node_id: u8, text: String },
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::TimeRequest => MsgType::TimeRequest,
            Message::TimeSet { .. } => MsgType::TimeSet,
            Message::TimeSetAck => MsgType::TimeSetAck,
            Message::TimeSetNack => MsgType::TimeSetNack,
            Message::GatewaySnapshotRequest => MsgType::GatewaySnapshotRequest,
            Message::GatewaySnapshot(_) => MsgType::GatewaySnapshot,
            Message::NodeSnapshotRequest { .. } => MsgType::NodeSnapshotRequest,
            Message::NodeSnapshotNack { .. } => MsgType::NodeSnapshotNack,
            Message::NodeSnapshots(_) => MsgType::NodeSnapshot,
            Message::MeterUpdate(_) => MsgType::MeterUpdate,
            Message::MeterUpdateRms(_) => MsgType::MeterUpdateRms,
            Message::MeterRebase { .. } => MsgType::MeterRebase,
            Message::MeterValueSet { .. } => MsgType::MeterValueSet,
            Message::MeterValueSetAck { .. } => MsgType::MeterValueSetAck,
            Message::MeterValueSetNack { .. } => MsgType::MeterValueSetNack,
            Message::MeterIntervalSet { .. } => MsgType::MeterIntervalSet,
            Message::MeterIntervalSetAck { .. } => MsgType::MeterIntervalSetAck,
            Message::MeterIntervalSetNack { .. } => MsgType::MeterIntervalSetNack,
            Message::PuckLedSet { .. } => MsgType::PuckLedSet,
            Message::PuckLedSetAck { .. } => MsgType::PuckLedSetAck,
            Message::PuckLedSetNack { .. } => MsgType::PuckLedSetNack,
            Message::GinrTmpRateSet { .. } => MsgType::GinrTmpRateSet,
            Message::GinrTmpRateSetAck { .. } => MsgType::GinrTmpRateSetAck,
            Message::GinrTmpRateSetNack { .. } => MsgType::GinrTmpRateSetNack,
            Message::NodeDark { .. } => MsgType::NodeDark,
            Message::GpMessage { .. } => MsgType::GpMessage,
        }
    }

    /// Header field values by schema name, in no particular order.
    fn header_values(&self) -> Vec<(&'static str, String)> {
        match self {
            Message::TimeRequest
            | Message::TimeSetAck
            | Message::TimeSetNack
            | Message::GatewaySnapshotRequest
            | Message::NodeSnapshots(_) => Vec::new(),
            Message::TimeSet { epoch_time } => vec![("epoch_time", epoch_time.to_string())],
            Message::GatewaySnapshot(s) => vec![
                ("gateway_id", s.gateway_id.to_string()),
                ("when_booted", s.when_booted.to_string()),
                ("free_ram", s.free_ram.to_string()),
                ("gateway_time", s.gateway_time.to_string()),
                ("log_level", s.log_level.clone()),
                ("encrypt_key", s.encrypt_key.clone()),
                ("network_id", s.network_id.clone()),
                ("tx_power", s.tx_power.to_string()),
            ],
            Message::NodeSnapshotRequest { node_id }
            | Message::NodeSnapshotNack { node_id }
            | Message::MeterValueSetAck { node_id }
            | Message::MeterValueSetNack { node_id }
            | Message::MeterIntervalSetAck { node_id }
            | Message::MeterIntervalSetNack { node_id }
            | Message::PuckLedSetAck { node_id }
            | Message::PuckLedSetNack { node_id }
            | Message::GinrTmpRateSetAck { node_id }
            | Message::GinrTmpRateSetNack { node_id } => {
                vec![("node_id", node_id.to_string())]
            }
            Message::MeterUpdate(u) | Message::MeterUpdateRms(u) => vec![
                ("node_id", u.node_id.to_string()),
                ("last_entry_finish_time", u.last_entry_finish_time.to_string()),
                ("last_entry_meter_value", u.last_entry_meter_value.to_string()),
            ],
            Message::MeterRebase {
                node_id,
                entry_timestamp,
                meter_value,
            } => vec![
                ("node_id", node_id.to_string()),
                ("entry_timestamp", entry_timestamp.to_string()),
                ("meter_value", meter_value.to_string()),
            ],
            Message::MeterValueSet {
                node_id,
                new_meter_value,
            } => vec![
                ("node_id", node_id.to_string()),
                ("new_meter_value", new_meter_value.to_string()),
            ],
            Message::MeterIntervalSet {
                node_id,
                new_interval,
            } => vec![
                ("node_id", node_id.to_string()),
                ("new_interval", new_interval.to_string()),
            ],
            Message::PuckLedSet {
                node_id,
                new_led_rate,
                new_led_time,
            } => vec![
                ("node_id", node_id.to_string()),
                ("new_led_rate", new_led_rate.to_string()),
                ("new_led_time", new_led_time.to_string()),
            ],
            Message::GinrTmpRateSet {
                node_id,
                tmp_poll_rate,
                tmp_poll_period,
            } => vec![
                ("node_id", node_id.to_string()),
                ("tmp_poll_rate", tmp_poll_rate.to_string()),
                ("tmp_poll_period", tmp_poll_period.to_string()),
            ],
            Message::NodeDark { node_id, last_seen } => vec![
                ("node_id", node_id.to_string()),
                ("last_seen", last_seen.to_string()),
            ],
            Message::GpMessage { node_id, text } => vec![
                ("node_id", node_id.to_string()),
                ("message", text.clone()),
            ],
        }
    }

    fn detail_records(&self) -> Vec<Vec<String>> {
        match self {
            Message::MeterUpdate(u) => u
                .intervals
                .iter()
                .map(|i| vec![i.entry_interval_length.to_string(), i.entry_value.to_string()])
                .collect(),
            Message::MeterUpdateRms(u) => u
                .intervals
                .iter()
                .map(|i| {
                    vec![
                        i.entry_interval_length.to_string(),
                        i.entry_value.to_string(),
                        fmt_float(i.spot_rms_current.unwrap_or(0.0)),
                    ]
                })
                .collect(),
            Message::NodeSnapshots(snaps) => snaps
                .iter()
                .map(|s| {
                    vec![
                        s.node_id.to_string(),
                        s.batt_voltage.to_string(),
                        s.up_time.to_string(),
                        s.sleep_time.to_string(),
                        s.free_ram.to_string(),
                        s.when_last_seen.to_string(),
                        s.last_clock_drift.to_string(),
                        s.meter_interval.to_string(),
                        s.meter_impulses_per_kwh.to_string(),
                        s.last_meter_entry_finish.to_string(),
                        s.last_meter_value.to_string(),
                        fmt_float(s.last_rms_current),
                        s.puck_led_rate.to_string(),
                        s.puck_led_time.to_string(),
                        s.last_rssi_at_gateway.to_string(),
                    ]
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn fmt_float(v: f64) -> String {
    // Base-10, no padding; integral values lose the fraction.
    format!("{}", v)
}

// ---------------------------------------------------------------------------
// Decoded frame
// ---------------------------------------------------------------------------

/// A decoded frame: typed message plus provenance and record counts.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub provenance: Provenance,
    /// Number of header records in the frame (0 or 1).
    pub header_count: usize,
    /// Number of detail repetitions in the frame.
    pub detail_count: usize,
    pub message: Message,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a message as a bare line (no direction prefix, no CR-LF).
pub fn encode(message: &Message) -> String {
    let schema = schema::schema_for(message.msg_type());
    let values = message.header_values();
    let header: Vec<String> = schema
        .header
        .iter()
        .map(|f| match f.role {
            FieldRole::HeaderSkip if f.name == "smsg_type" => schema.tag.to_owned(),
            _ => values
                .iter()
                .find(|(name, _)| *name == f.name)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| unreachable!("no value for header field '{}'", f.name)),
        })
        .collect();
    codec::emit(schema, &header, &message.detail_records())
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Positional field access over one record, by schema name.
struct Rec<'a> {
    defs: &'static [FieldDef],
    fields: &'a [String],
}

impl Rec<'_> {
    fn position(&self, name: &str) -> Result<usize, FrameError> {
        self.defs
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| malformed(format!("schema has no field '{}'", name)))
    }

    fn text(&self, name: &str) -> Result<&str, FrameError> {
        let pos = self.position(name)?;
        Ok(&self.fields[pos])
    }

    /// The named field plus every field after it, re-joined. Used for free
    /// text that may itself contain commas.
    fn rest(&self, name: &str) -> Result<String, FrameError> {
        let pos = self.position(name)?;
        Ok(self.fields[pos..].join(","))
    }

    fn int(&self, name: &str) -> Result<i64, FrameError> {
        let raw = self.text(name)?;
        raw.parse()
            .map_err(|_| malformed(format!("field '{}' is not an integer: '{}'", name, raw)))
    }

    fn byte(&self, name: &str) -> Result<u8, FrameError> {
        let raw = self.text(name)?;
        raw.parse()
            .map_err(|_| malformed(format!("field '{}' is not a node/gateway id: '{}'", name, raw)))
    }

    fn float(&self, name: &str) -> Result<f64, FrameError> {
        let raw = self.text(name)?;
        raw.parse()
            .map_err(|_| malformed(format!("field '{}' is not a number: '{}'", name, raw)))
    }
}

/// Decode a bare line into a typed frame, stamping it with provenance.
pub fn decode_frame(line: &str, provenance: Provenance) -> Result<Frame, FrameError> {
    let raw = codec::parse_line(line)?;
    let header_count = usize::from(!raw.schema.header.is_empty());
    let detail_count = raw.details.len();
    let message = build_message(&raw)?;
    Ok(Frame {
        msg_type: raw.schema.msg_type,
        provenance,
        header_count,
        detail_count,
        message,
    })
}

fn build_message(raw: &RawFrame) -> Result<Message, FrameError> {
    let header = Rec {
        defs: raw.schema.header,
        fields: &raw.header,
    };
    let details = || {
        raw.details.iter().map(|fields| Rec {
            defs: raw.schema.detail,
            fields,
        })
    };

    let message = match raw.schema.msg_type {
        MsgType::TimeRequest => Message::TimeRequest,
        MsgType::TimeSet => Message::TimeSet {
            epoch_time: header.int("epoch_time")?,
        },
        MsgType::TimeSetAck => Message::TimeSetAck,
        MsgType::TimeSetNack => Message::TimeSetNack,
        MsgType::GatewaySnapshotRequest => Message::GatewaySnapshotRequest,
        MsgType::GatewaySnapshot => Message::GatewaySnapshot(GatewaySnapshot {
            gateway_id: header.byte("gateway_id")?,
            when_booted: header.int("when_booted")?,
            free_ram: header.int("free_ram")?,
            gateway_time: header.int("gateway_time")?,
            log_level: header.text("log_level")?.to_owned(),
            encrypt_key: header.text("encrypt_key")?.to_owned(),
            network_id: header.text("network_id")?.to_owned(),
            tx_power: header.int("tx_power")?,
        }),
        MsgType::NodeSnapshotRequest => Message::NodeSnapshotRequest {
            node_id: header.byte("node_id")?,
        },
        MsgType::NodeSnapshotNack => Message::NodeSnapshotNack {
            node_id: header.byte("node_id")?,
        },
        MsgType::NodeSnapshot => {
            let mut snaps = Vec::with_capacity(raw.details.len());
            for rec in details() {
                snaps.push(NodeSnapshot {
                    node_id: rec.byte("node_id")?,
                    batt_voltage: rec.int("batt_voltage")?,
                    up_time: rec.int("up_time")?,
                    sleep_time: rec.int("sleep_time")?,
                    free_ram: rec.int("free_ram")?,
                    when_last_seen: rec.int("when_last_seen")?,
                    last_clock_drift: rec.int("last_clock_drift")?,
                    meter_interval: rec.int("meter_interval")?,
                    meter_impulses_per_kwh: rec.int("meter_impulses_per_kwh")?,
                    last_meter_entry_finish: rec.int("last_meter_entry_finish")?,
                    last_meter_value: rec.int("last_meter_value")?,
                    last_rms_current: rec.float("last_rms_current")?,
                    puck_led_rate: rec.int("puck_led_rate")?,
                    puck_led_time: rec.int("puck_led_time")?,
                    last_rssi_at_gateway: rec.int("last_rssi_at_gateway")?,
                });
            }
            Message::NodeSnapshots(snaps)
        }
        MsgType::MeterUpdate | MsgType::MeterUpdateRms => {
            let with_rms = raw.schema.msg_type == MsgType::MeterUpdateRms;
            let mut intervals = Vec::with_capacity(raw.details.len());
            for rec in details() {
                intervals.push(MeterInterval {
                    entry_interval_length: rec.int("entry_interval_length")?,
                    entry_value: rec.int("entry_value")?,
                    spot_rms_current: if with_rms {
                        Some(rec.float("spot_rms_current")?)
                    } else {
                        None
                    },
                });
            }
            let update = MeterUpdate {
                node_id: header.byte("node_id")?,
                last_entry_finish_time: header.int("last_entry_finish_time")?,
                last_entry_meter_value: header.int("last_entry_meter_value")?,
                intervals,
            };
            if with_rms {
                Message::MeterUpdateRms(update)
            } else {
                Message::MeterUpdate(update)
            }
        }
        MsgType::MeterRebase => Message::MeterRebase {
            node_id: header.byte("node_id")?,
            entry_timestamp: header.int("entry_timestamp")?,
            meter_value: header.int("meter_value")?,
        },
        MsgType::MeterValueSet => Message::MeterValueSet {
            node_id: header.byte("node_id")?,
            new_meter_value: header.int("new_meter_value")?,
        },
        MsgType::MeterValueSetAck => Message::MeterValueSetAck {
            node_id: header.byte("node_id")?,
        },
        MsgType::MeterValueSetNack => Message::MeterValueSetNack {
            node_id: header.byte("node_id")?,
        },
        MsgType::MeterIntervalSet => Message::MeterIntervalSet {
            node_id: header.byte("node_id")?,
            new_interval: header.int("new_interval")?,
        },
        MsgType::MeterIntervalSetAck => Message::MeterIntervalSetAck {
            node_id: header.byte("node_id")?,
        },
        MsgType::MeterIntervalSetNack => Message::MeterIntervalSetNack {
            node_id: header.byte("node_id")?,
        },
        MsgType::PuckLedSet => Message::PuckLedSet {
            node_id: header.byte("node_id")?,
            new_led_rate: header.int("new_led_rate")?,
            new_led_time: header.int("new_led_time")?,
        },
        MsgType::PuckLedSetAck => Message::PuckLedSetAck {
            node_id: header.byte("node_id")?,
        },
        MsgType::PuckLedSetNack => Message::PuckLedSetNack {
            node_id: header.byte("node_id")?,
        },
        MsgType::GinrTmpRateSet => Message::GinrTmpRateSet {
            node_id: header.byte("node_id")?,
            tmp_poll_rate: header.int("tmp_poll_rate")?,
            tmp_poll_period: header.int("tmp_poll_period")?,
        },
        MsgType::GinrTmpRateSetAck => Message::GinrTmpRateSetAck {
            node_id: header.byte("node_id")?,
        },
        MsgType::GinrTmpRateSetNack => Message::GinrTmpRateSetNack {
            node_id: header.byte("node_id")?,
        },
        MsgType::NodeDark => Message::NodeDark {
            node_id: header.byte("node_id")?,
            last_seen: header.int("last_seen")?,
        },
        MsgType::GpMessage => Message::GpMessage {
            node_id: header.byte("node_id")?,
            text: header.rest("message")?,
        },
    };
    Ok(message)
}
