//! Message schema table.
//!
//! One [`MessageSchema`] per catalogue message, listing the header-record
//! and detail-record fields in wire order. The table is data, not code:
//! the codec walks it for both encoding and decoding.

use serde::Serialize;

/// Role of a positional field within a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    /// Semantic header field, carried in the header record.
    Header,
    /// Placeholder in the header record. When named `smsg_type` the encoder
    /// emits the message tag again (`rmsg_type`) instead of a caller value.
    HeaderSkip,
    /// Semantic detail field, one per detail repetition.
    Detail,
    /// Placeholder in a detail repetition.
    DetailSkip,
}

/// A named positional field.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub role: FieldRole,
}

const fn header(name: &'static str) -> FieldDef {
    FieldDef {
        name,
        role: FieldRole::Header,
    }
}

const fn detail(name: &'static str) -> FieldDef {
    FieldDef {
        name,
        role: FieldRole::Detail,
    }
}

/// The `rmsg_type` placeholder: a second occurrence of the type tag inside
/// the header record.
const RMSG_TYPE: FieldDef = FieldDef {
    name: "smsg_type",
    role: FieldRole::HeaderSkip,
};

/// Every message in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MsgType {
    TimeRequest,
    TimeSet,
    TimeSetAck,
    TimeSetNack,
    GatewaySnapshotRequest,
    GatewaySnapshot,
    NodeSnapshotRequest,
    NodeSnapshotNack,
    NodeSnapshot,
    MeterUpdate,
    MeterUpdateRms,
    MeterRebase,
    MeterValueSet,
    MeterValueSetAck,
    MeterValueSetNack,
    MeterIntervalSet,
    MeterIntervalSetAck,
    MeterIntervalSetNack,
    PuckLedSet,
    PuckLedSetAck,
    PuckLedSetNack,
    GinrTmpRateSet,
    GinrTmpRateSetAck,
    GinrTmpRateSetNack,
    NodeDark,
    GpMessage,
}

/// Field layout for one message type.
#[derive(Debug)]
pub struct MessageSchema {
    pub msg_type: MsgType,
    /// ASCII type tag, e.g. `MUP_`.
    pub tag: &'static str,
    /// Fields of the header record, in wire order. Empty when the frame is
    /// the bare tag (or tag + details).
    pub header: &'static [FieldDef],
    /// Fields of one detail repetition. Empty when the message carries no
    /// detail records.
    pub detail: &'static [FieldDef],
}

const NODE_SNAPSHOT_DETAIL: &[FieldDef] = &[
    detail("node_id"),
    detail("batt_voltage"),
    detail("up_time"),
    detail("sleep_time"),
    detail("free_ram"),
    detail("when_last_seen"),
    detail("last_clock_drift"),
    detail("meter_interval"),
    detail("meter_impulses_per_kwh"),
    detail("last_meter_entry_finish"),
    detail("last_meter_value"),
    detail("last_rms_current"),
    detail("puck_led_rate"),
    detail("puck_led_time"),
    detail("last_rssi_at_gateway"),
];

const METER_UPDATE_HEADER: &[FieldDef] = &[
    header("node_id"),
    RMSG_TYPE,
    header("last_entry_finish_time"),
    header("last_entry_meter_value"),
];

/// The catalogue. Single source of truth for both codec directions.
pub static SCHEMAS: &[MessageSchema] = &[
    MessageSchema {
        msg_type: MsgType::TimeRequest,
        tag: "GTIME",
        header: &[],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::TimeSet,
        tag: "STIME",
        header: &[header("epoch_time")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::TimeSetAck,
        tag: "STIME_ACK",
        header: &[],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::TimeSetNack,
        tag: "STIME_NACK",
        header: &[],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::GatewaySnapshotRequest,
        tag: "GGWSNAP",
        header: &[],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::GatewaySnapshot,
        tag: "GWSNAP",
        header: &[
            header("gateway_id"),
            header("when_booted"),
            header("free_ram"),
            header("gateway_time"),
            header("log_level"),
            header("encrypt_key"),
            header("network_id"),
            header("tx_power"),
        ],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::NodeSnapshotRequest,
        tag: "GNOSNAP",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::NodeSnapshotNack,
        tag: "GNOSNAP_NACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::NodeSnapshot,
        tag: "NOSNAP",
        header: &[],
        detail: NODE_SNAPSHOT_DETAIL,
    },
    MessageSchema {
        msg_type: MsgType::MeterUpdate,
        tag: "MUP_",
        header: METER_UPDATE_HEADER,
        detail: &[detail("entry_interval_length"), detail("entry_value")],
    },
    MessageSchema {
        msg_type: MsgType::MeterUpdateRms,
        tag: "MUPC",
        header: METER_UPDATE_HEADER,
        detail: &[
            detail("entry_interval_length"),
            detail("entry_value"),
            detail("spot_rms_current"),
        ],
    },
    MessageSchema {
        msg_type: MsgType::MeterRebase,
        tag: "MREB",
        header: &[
            header("node_id"),
            RMSG_TYPE,
            header("entry_timestamp"),
            header("meter_value"),
        ],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::MeterValueSet,
        tag: "SMVAL",
        header: &[header("node_id"), header("new_meter_value")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::MeterValueSetAck,
        tag: "SMVAL_ACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::MeterValueSetNack,
        tag: "SMVAL_NACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::MeterIntervalSet,
        tag: "SMINT",
        header: &[header("node_id"), header("new_interval")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::MeterIntervalSetAck,
        tag: "SMINT_ACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::MeterIntervalSetNack,
        tag: "SMINT_NACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::PuckLedSet,
        tag: "SPLED",
        header: &[
            header("node_id"),
            header("new_led_rate"),
            header("new_led_time"),
        ],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::PuckLedSetAck,
        tag: "SPLED_ACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::PuckLedSetNack,
        tag: "SPLED_NACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::GinrTmpRateSet,
        tag: "SGITR",
        header: &[
            header("node_id"),
            header("tmp_poll_rate"),
            header("tmp_poll_period"),
        ],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::GinrTmpRateSetAck,
        tag: "SGITR_ACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::GinrTmpRateSetNack,
        tag: "SGITR_NACK",
        header: &[header("node_id")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::NodeDark,
        tag: "NDARK",
        header: &[header("node_id"), header("last_seen")],
        detail: &[],
    },
    MessageSchema {
        msg_type: MsgType::GpMessage,
        tag: "GMSG",
        // Free text occupies the remainder of the header record and may
        // itself contain commas.
        header: &[header("node_id"), RMSG_TYPE, header("message")],
        detail: &[],
    },
];

/// Look a schema up by its wire tag.
pub fn schema_for_tag(tag: &str) -> Option<&'static MessageSchema> {
    SCHEMAS.iter().find(|s| s.tag == tag)
}

/// Look a schema up by message type.
pub fn schema_for(msg_type: MsgType) -> &'static MessageSchema {
    SCHEMAS
        .iter()
        .find(|s| s.msg_type == msg_type)
        .expect("every MsgType has a schema entry")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_msg_type_has_exactly_one_schema() {
        for schema in SCHEMAS {
            let hits = SCHEMAS
                .iter()
                .filter(|s| s.msg_type == schema.msg_type)
                .count();
            assert_eq!(hits, 1, "duplicate schema for {:?}", schema.msg_type);
        }
    }

    #[test]
    fn tags_are_unique() {
        for schema in SCHEMAS {
            let hits = SCHEMAS.iter().filter(|s| s.tag == schema.tag).count();
            assert_eq!(hits, 1, "duplicate tag {}", schema.tag);
        }
    }

    #[test]
    fn lookup_by_tag_and_type_agree() {
        let by_tag = schema_for_tag("MUP_").expect("MUP_ is in the catalogue");
        let by_type = schema_for(MsgType::MeterUpdate);
        assert_eq!(by_tag.tag, by_type.tag);
    }

    #[test]
    fn unknown_tag_is_none() {
        assert!(schema_for_tag("CRAP").is_none());
    }
}
