//! meterd: the metering gateway server.
//!
//! Owns the serial link to each configured radio gateway, translates the
//! line-oriented gateway protocol in both directions, reconstructs per-node
//! consumption time series, persists every observation, and exposes the
//! result over a small HTTP query/control API.
//!
//! Subsystems:
//! - [`link`] / [`worker`]: one blocking I/O worker per gateway link with a
//!   keyed inbound buffer and an outbound frame queue.
//! - [`device`]: the device manager that drains the link buffers, dispatches
//!   decoded frames into the data manager, applies cadenced control, and
//!   drives the built-in simulated meters.
//! - [`http`]: the axum query/control surface.
//! - [`config`]: TOML configuration loading.

pub mod config;
pub mod device;
pub mod http;
pub mod link;
pub mod worker;
