//! Persistence and the consumption engine.
//!
//! [`store::Store`] is typed table access over the six persistent relations
//! (meter entries, gateway/node snapshots, node events, system parameters,
//! users). [`data::DataManager`] sits on top: it owns the write path for
//! observed and synthetic meter data, the consumption algorithm, and the
//! optional append-only evidence file.

pub mod data;
pub mod event_log;
pub mod store;

pub use data::{Consumption, DataManager, MeterReading};
pub use store::{
    EntryQuery, EntryType, GatewaySnapshotRow, MeterEntry, NodeEventRow, NodeEventType,
    NodeSnapshotRow, RecStatus, Store, StoreError,
};
