//! Gateway link protocol.
//!
//! Frame codec for the line-oriented ASCII protocol spoken between the
//! server and a meter gateway. A frame is one line on the wire: records
//! separated by `;`, fields separated by `,`. Record 0 carries the message
//! type tag, record 1 the header fields (when the message has any), and
//! any further records are repeating detail records.
//!
//! The per-message field layout lives in one static schema table
//! ([`schema::SCHEMAS`]) that drives both encoding and decoding, so the two
//! directions cannot drift apart. Decoded frames come out as the typed
//! [`Message`] sum, never as loose key/value maps.
//!
//! Byte-level framing (the `G>S:` / `S>G:` prefixes, CR-LF termination,
//! Latin-1 tolerance) is owned by the link worker, not by this crate.

pub mod codec;
pub mod message;
pub mod schema;

pub use codec::FrameError;
pub use message::{
    Frame, GatewaySnapshot, Message, MeterInterval, MeterUpdate, NodeSnapshot, Provenance,
    decode_frame, encode,
};
pub use schema::MsgType;

/// Line prefix on frames travelling gateway-to-server.
pub const GW_TO_SERVER_PREFIX: &str = "G>S:";

/// Line prefix on frames travelling server-to-gateway.
pub const SERVER_TO_GW_PREFIX: &str = "S>G:";

/// Node id that addresses every node behind a gateway.
pub const ALL_NODES: u8 = 254;
