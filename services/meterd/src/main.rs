// meterd: owns the serial link to each meter gateway, ingests metering
// traffic into the store, and serves the query/control API.

use meterd::config::{self, Config};
use meterd::device::DeviceManager;
use meterd::http::{ApiContext, AuthSettings};
use meterd::link::SerialLink;
use meterd::worker::{LinkShared, LinkWorker};
use meter_store::event_log::EventLog;
use meter_store::{DataManager, Store};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("config.toml"), PathBuf::from);
    let cfg = match config::load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config '{}': {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    for dir in [&cfg.app.home_path, &cfg.app.temp_path] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("FATAL: cannot create directory '{}': {}", dir.display(), e);
            std::process::exit(1);
        }
    }

    init_logging(&cfg);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        gateways = cfg.gateways.len(),
        sim_meters = cfg.sim_meters.len(),
        "meterd starting"
    );

    let data = match open_data_manager(&cfg) {
        Ok(data) => Arc::new(Mutex::new(data)),
        Err(e) => {
            eprintln!("FATAL: failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    // One link worker thread per configured gateway.
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut devices = DeviceManager::new(data.clone());
    let mut worker_handles = Vec::new();
    for gw in &cfg.gateways {
        let transport = match SerialLink::open(&gw.serial_port, gw.serial_baud) {
            Ok(link) => link,
            Err(e) => {
                eprintln!("FATAL: gateway '{}': {}", gw.label, e);
                std::process::exit(1);
            }
        };
        let shared = LinkShared::new(&gw.network_id, gw.gateway_id, &gw.label);
        devices.add_gateway(shared.clone());
        let worker = LinkWorker::new(Box::new(transport), shared, shutdown.clone());
        worker_handles.push(worker.spawn());
    }
    for sim in &cfg.sim_meters {
        if let Err(e) = devices.add_sim_meter(sim) {
            eprintln!("FATAL: simulated meter: {}", e);
            std::process::exit(1);
        }
    }
    let devices = Arc::new(Mutex::new(devices));

    // Device-manager control loop at ~2 Hz.
    {
        let devices = devices.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                devices.lock().expect("device manager lock poisoned").tick();
            }
        });
    }

    if cfg.rest_api.run_rest_api {
        let ctx = ApiContext {
            data: data.clone(),
            devices: devices.clone(),
            auth: Arc::new(AuthSettings {
                user: cfg.rest_api.user.clone(),
                password: cfg.rest_api.password.clone(),
            }),
        };
        let mut router = meterd::http::build_router(ctx);
        if cfg.rest_api.access_lan_only {
            router = meterd::http::with_lan_guard(router);
        }
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.rest_api.port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                eprintln!("FATAL: cannot bind API port {}: {}", cfg.rest_api.port, e);
                std::process::exit(1);
            }
        };
        info!(%addr, lan_only = cfg.rest_api.access_lan_only, "API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                tracing::error!(error = %e, "API server exited");
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    for handle in worker_handles {
        let _ = handle.join();
    }
}

fn open_data_manager(cfg: &Config) -> Result<DataManager, Box<dyn std::error::Error>> {
    let store = Store::open(&cfg.app.db_file)?;
    if cfg.event_file.write_event_file {
        let log = EventLog::open(&cfg.event_file.event_file)?;
        Ok(DataManager::with_event_log(
            store,
            log,
            cfg.event_file.meter_only,
        ))
    } else {
        Ok(DataManager::new(store))
    }
}

fn init_logging(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.app.log_level.to_lowercase()));
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.app.log_file);
    match file {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(move || file.try_clone().expect("clone log file handle"))
                .init();
        }
        Err(e) => {
            eprintln!(
                "WARN: cannot open log file '{}' ({}), logging to stdout",
                cfg.app.log_file.display(),
                e
            );
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
