use clap::Parser;
use meterdeck_gateway_sim::{load_devices, router, SimConfig, SimState};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meterdeck-gateway-sim")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8090")]
    addr: String,
    /// Bearer token clients must present; falls back to METERDECK_SIM_TOKEN.
    #[arg(long, default_value = "")]
    token: String,
    /// JSON or TOML file with a `devices` list; demo devices otherwise.
    #[arg(long)]
    devices: Option<PathBuf>,
    #[arg(long, default_value_t = 2_000)]
    actuation_delay_ms: u64,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug || env_true("METERDECK_SIM_DEBUG"));

    let addr: SocketAddr = match args.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %args.addr);
            return;
        }
    };

    let devices = match args.devices.as_deref() {
        Some(path) => match load_devices(path) {
            Ok(devices) => Some(devices),
            Err(err) => {
                error!(event = "device_file_error", error = %err);
                return;
            }
        },
        None => None,
    };
    let config = SimConfig {
        token: resolve_token(&args.token),
        actuation_delay: Duration::from_millis(args.actuation_delay_ms),
        ..SimConfig::default()
    };
    let auth = config.token.is_some();
    let state = Arc::new(match devices {
        Some(devices) => SimState::new(config, devices),
        None => SimState::demo(config),
    });

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "sim_error", error = %err);
            return;
        }
    };
    info!(event = "sim_start", addr = %addr, auth);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(err) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "sim_error", error = %err);
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("METERDECK_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn resolve_token(flag: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    std::env::var("METERDECK_SIM_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
