//! Server configuration loading.
//!
//! TOML is the sole config source. Fixed sections `[App]`, `[EventFile]`
//! and `[RestApi]` are optional and default sensibly; gateway and simulated
//! meter sections are discovered by name prefix (`[Gateway1]`, `[Gateway2]`,
//! `[SimMeter1]`, ...), so a deployment adds hardware by adding a section.
//!
//! # Required
//! - At least one `[GatewayN]` section with `network_id`, `gateway_id` and
//!   `serial_port`.
//! - Every `[SimMeterN]` must name a configured gateway.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub event_file: EventFileConfig,
    pub rest_api: RestApiConfig,
    pub gateways: Vec<GatewayConfig>,
    pub sim_meters: Vec<SimMeterConfig>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub home_path: PathBuf,
    pub temp_path: PathBuf,
    /// Primary log sink, resolved under `home_path` when relative.
    pub log_file: PathBuf,
    /// Store path, resolved under `home_path` when relative.
    pub db_file: PathBuf,
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct EventFileConfig {
    pub write_event_file: bool,
    /// Evidence file name, resolved under `home_path` when relative.
    pub event_file: PathBuf,
    pub meter_only: bool,
}

#[derive(Debug, Clone)]
pub struct RestApiConfig {
    pub run_rest_api: bool,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub access_lan_only: bool,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub network_id: String,
    pub gateway_id: u8,
    pub label: String,
    pub serial_port: String,
    pub serial_baud: u32,
}

#[derive(Debug, Clone)]
pub struct SimMeterConfig {
    pub network_id: String,
    pub gateway_id: u8,
    pub node_id: u8,
    /// Seconds per simulated meter interval.
    pub interval: i64,
    /// Starting cumulative value in Wh.
    pub start_val: i64,
    pub read_min: i64,
    pub read_max: i64,
    /// Intervals accumulated before a frame is emitted.
    pub max_msg_entries: i64,
}

// ---------------------------------------------------------------------------
// Raw TOML shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawApp {
    home_path: Option<PathBuf>,
    temp_path: Option<PathBuf>,
    log_file: Option<PathBuf>,
    db_file: Option<PathBuf>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEventFile {
    write_event_file: Option<bool>,
    event_file: Option<PathBuf>,
    meter_only: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRestApi {
    run_rest_api: Option<bool>,
    flask_port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    access_lan_only: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawGateway {
    network_id: Option<String>,
    gateway_id: Option<u8>,
    label: Option<String>,
    serial_port: Option<String>,
    serial_baud: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawSimMeter {
    network_id: Option<String>,
    gateway_id: Option<u8>,
    node_id: Option<u8>,
    interval: Option<i64>,
    start_val: Option<i64>,
    read_min: Option<i64>,
    read_max: Option<i64>,
    max_msg_entries: Option<i64>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<Config, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    let table: toml::Table =
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_app: RawApp = section(&table, "App")?.unwrap_or_default();
    let raw_event: RawEventFile = section(&table, "EventFile")?.unwrap_or_default();
    let raw_api: RawRestApi = section(&table, "RestApi")?.unwrap_or_default();

    let home_path = raw_app.home_path.unwrap_or_else(|| PathBuf::from("/tmp"));
    let app = AppConfig {
        log_file: resolve(&home_path, raw_app.log_file.unwrap_or_else(|| "meterd.log".into())),
        db_file: resolve(&home_path, raw_app.db_file.unwrap_or_else(|| "meterd.db".into())),
        temp_path: raw_app.temp_path.unwrap_or_else(|| PathBuf::from("/tmp")),
        log_level: raw_app.log_level.unwrap_or_else(|| "info".to_owned()),
        home_path,
    };

    let event_file = EventFileConfig {
        write_event_file: raw_event.write_event_file.unwrap_or(false),
        event_file: resolve(
            &app.home_path,
            raw_event.event_file.unwrap_or_else(|| "meterd_events.csv".into()),
        ),
        meter_only: raw_event.meter_only.unwrap_or(false),
    };

    let rest_api = RestApiConfig {
        run_rest_api: raw_api.run_rest_api.unwrap_or(false),
        port: raw_api.flask_port.unwrap_or(8000),
        user: raw_api.user.unwrap_or_else(|| "rest_user".to_owned()),
        password: raw_api.password.unwrap_or_else(|| "change_me_please".to_owned()),
        access_lan_only: raw_api.access_lan_only.unwrap_or(false),
    };

    let mut gateways = Vec::new();
    for (name, value) in prefixed_sections(&table, "Gateway") {
        let raw: RawGateway = value
            .try_into()
            .map_err(|e| ConfigError::Parse(format!("[{}]: {}", name, e)))?;
        gateways.push(GatewayConfig {
            network_id: raw
                .network_id
                .ok_or_else(|| ConfigError::MissingField(format!("{}.network_id", name)))?,
            gateway_id: raw
                .gateway_id
                .ok_or_else(|| ConfigError::MissingField(format!("{}.gateway_id", name)))?,
            label: raw.label.unwrap_or_else(|| name.clone()),
            serial_port: raw
                .serial_port
                .ok_or_else(|| ConfigError::MissingField(format!("{}.serial_port", name)))?,
            serial_baud: raw.serial_baud.unwrap_or(9600),
        });
    }
    if gateways.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one [GatewayN] section is required".to_owned(),
        ));
    }

    let mut sim_meters = Vec::new();
    for (name, value) in prefixed_sections(&table, "SimMeter") {
        let raw: RawSimMeter = value
            .try_into()
            .map_err(|e| ConfigError::Parse(format!("[{}]: {}", name, e)))?;
        let sim = SimMeterConfig {
            network_id: raw.network_id.unwrap_or_else(|| "0.0.1.1".to_owned()),
            gateway_id: raw.gateway_id.unwrap_or(1),
            node_id: raw.node_id.unwrap_or(100),
            interval: raw.interval.unwrap_or(15),
            start_val: raw.start_val.unwrap_or(0),
            read_min: raw.read_min.unwrap_or(0),
            read_max: raw.read_max.unwrap_or(20),
            max_msg_entries: raw.max_msg_entries.unwrap_or(4),
        };
        let backing = gateways
            .iter()
            .any(|g| g.network_id == sim.network_id && g.gateway_id == sim.gateway_id);
        if !backing {
            return Err(ConfigError::InvalidValue(format!(
                "[{}] names gateway {}.{} which is not configured",
                name, sim.network_id, sim.gateway_id
            )));
        }
        if sim.read_min > sim.read_max {
            return Err(ConfigError::InvalidValue(format!(
                "[{}] read_min must not exceed read_max",
                name
            )));
        }
        if sim.interval <= 0 || sim.max_msg_entries < 2 {
            return Err(ConfigError::InvalidValue(format!(
                "[{}] needs a positive interval and at least 2 max_msg_entries",
                name
            )));
        }
        sim_meters.push(sim);
    }

    Ok(Config {
        app,
        event_file,
        rest_api,
        gateways,
        sim_meters,
    })
}

fn section<T: serde::de::DeserializeOwned>(
    table: &toml::Table,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match table.get(name) {
        Some(value) => value
            .clone()
            .try_into()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("[{}]: {}", name, e))),
        None => Ok(None),
    }
}

/// Sections whose name starts with `prefix`, in name order so `[Gateway1]`
/// comes before `[Gateway2]`.
fn prefixed_sections(table: &toml::Table, prefix: &str) -> Vec<(String, toml::Value)> {
    let mut sections: Vec<(String, toml::Value)> = table
        .iter()
        .filter(|(name, _)| name.starts_with(prefix))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    sections.sort_by(|a, b| a.0.cmp(&b.0));
    sections
}

fn resolve(home: &Path, file: PathBuf) -> PathBuf {
    if file.is_absolute() {
        file
    } else {
        home.join(file)
    }
}
