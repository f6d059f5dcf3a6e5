mod render;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use meterdeck_control::{
    wire::AuditEntry, CommandRequest, ControlAction, ControlConfig, ControlCore, Verdict,
};
use serde::Serialize;
use serde_json::json;
use std::{path::PathBuf, process::ExitCode, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meterdeck")]
#[command(about = "Remote device control and verification console", long_about = None)]
struct Cli {
    /// Config file; falls back to METERDECK_CONFIG, then the XDG location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print JSON instead of text.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List devices
    Devices {
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Poll one device's output status
    Status { device: String },
    /// Show a device's output channels
    Outputs { device: String },
    /// Send a control command and follow its reconciliation
    Execute(CommandArgs),
    /// Send a command and verify it against telemetry
    Verify(CommandArgs),
    /// Show the command audit log
    Audit {
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Follow a device's status, audit entries and notices until interrupted
    Watch { device: String },
}

#[derive(ClapArgs, Debug)]
struct CommandArgs {
    device: String,
    /// close/on or trip/off
    action: String,
    /// Output key or address; resolved against the device's outputs for target and address.
    #[arg(long)]
    output: Option<String>,
    /// Control target, when it differs from the output's own.
    #[arg(long)]
    target: Option<String>,
    #[arg(long, default_value = "")]
    reason: String,
    #[arg(long)]
    operator: Option<String>,
    #[arg(long)]
    mode: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = ControlConfig::load(cli.config.as_deref()).context("loading config")?;
    debug!(event = "console_config", gateway_url = %config.gateway_url);
    let core = ControlCore::connect(config);
    let json = cli.json;

    let code = match cli.command {
        Commands::Devices { refresh } => {
            let devices = core.load_devices(refresh).await?;
            emit(json, devices.as_slice(), || render::device_lines(&devices))?;
            ExitCode::SUCCESS
        }
        Commands::Status { device } => {
            core.fetch_status(&device).await?;
            let status = core.get_status(&device);
            emit(json, &status, || render::status_lines(&device, &status))?;
            ExitCode::SUCCESS
        }
        Commands::Outputs { device } => {
            let outputs = core.fetch_outputs(&device).await?;
            emit(json, &outputs, || render::output_lines(&outputs))?;
            ExitCode::SUCCESS
        }
        Commands::Execute(args) => execute(&core, args, json).await?,
        Commands::Verify(args) => {
            let request = build_request(&core, args).await?;
            let report = core.verify(request).await;
            emit(json, &report, || render::report_lines(&report))?;
            match report.verdict {
                Verdict::Success => ExitCode::SUCCESS,
                Verdict::Failure | Verdict::Error => ExitCode::from(2),
            }
        }
        Commands::Audit { device, follow } => {
            audit(&core, device.as_deref(), follow, json).await?;
            ExitCode::SUCCESS
        }
        Commands::Watch { device } => {
            watch(&core, &device, json).await?;
            ExitCode::SUCCESS
        }
    };
    core.shutdown();
    Ok(code)
}

async fn execute(core: &ControlCore, args: CommandArgs, json: bool) -> Result<ExitCode> {
    let request = build_request(core, args).await?;
    let device_id = request.device_id.clone();
    let receipt = core.execute(request).await?;
    let optimistic = core.get_status(&device_id);
    if json {
        print_json(&json!({
            "command_id": receipt.command_id,
            "device_id": receipt.device_id,
            "key": receipt.key,
            "action": receipt.action,
            "optimistic": optimistic,
        }))?;
    } else {
        println!(
            "command #{} {} {} acknowledged",
            receipt.command_id, receipt.action, receipt.key
        );
        print_lines(render::status_lines(&device_id, &optimistic));
    }

    // Wait out the reconciliation burst so the final state reflects the server.
    let horizon = core
        .config()
        .reconcile_offsets()
        .last()
        .copied()
        .unwrap_or_default();
    tokio::time::sleep(horizon + Duration::from_millis(250)).await;
    let settled = core.get_status(&device_id);
    emit(json, &settled, || render::status_lines(&device_id, &settled))?;
    Ok(ExitCode::SUCCESS)
}

async fn build_request(core: &ControlCore, args: CommandArgs) -> Result<CommandRequest> {
    let action: ControlAction = args
        .action
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;
    let output = match args.output.as_deref() {
        Some(key) => match core.resolve_output(&args.device, key).await? {
            Some(output) => Some(output),
            None => bail!("device {} has no output {key}", args.device),
        },
        None => None,
    };
    let target = args
        .target
        .or_else(|| output.as_ref().map(|output| output.control_target.clone()))
        .filter(|target| !target.trim().is_empty());
    let Some(target) = target else {
        bail!("a control target is required (--target or --output)");
    };

    let mut request = CommandRequest::new(args.device, action, target).with_reason(args.reason);
    if let Some(output) = output {
        request = request
            .with_output_key(output.key)
            .with_address(output.address);
    }
    if let Some(operator) = args.operator {
        request = request.with_operator(operator);
    }
    request.control_mode = args.mode;
    Ok(request)
}

async fn audit(core: &ControlCore, device: Option<&str>, follow: bool, json: bool) -> Result<()> {
    let show = |core: &ControlCore| -> Result<()> {
        let entries = match device {
            Some(device) => core.audit_entries_for(device),
            None => core.audit_entries(),
        };
        emit(json, &entries, || render::audit_lines(&entries))
    };
    core.refresh_audit_log().await?;
    show(core)?;
    if !follow {
        return Ok(());
    }

    let mut ticker = tokio::time::interval(core.config().audit_refresh_interval());
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                match core.refresh_audit_log().await {
                    Ok(_) => show(core)?,
                    Err(err) if err.is_unauthorized() => return Err(err.into()),
                    Err(err) => warn!(event = "audit_refresh_failed", error = %err),
                }
            }
        }
    }
}

async fn watch(core: &ControlCore, device: &str, json: bool) -> Result<()> {
    let mut changes = core.subscribe_status();
    let mut notices = core.subscribe_notices();
    let mut session = core.session().subscribe();
    core.select(device);

    match core.refresh_audit_log().await {
        Ok(_) => {}
        Err(err) if err.is_unauthorized() => return Err(err.into()),
        Err(err) => warn!(event = "audit_refresh_failed", error = %err),
    }
    let mut seen = core.audit_entries_for(device);
    emit(json, &seen, || render::audit_lines(&seen))?;
    core.start_audit_refresh();
    let mut audit_check = tokio::time::interval(core.config().audit_refresh_interval());
    audit_check.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = audit_check.tick() => {
                let entries = core.audit_entries_for(device);
                let fresh = unseen(&seen, &entries);
                if !fresh.is_empty() {
                    emit(json, &fresh, || render::audit_lines(&fresh))?;
                }
                seen = entries;
            }
            changed = session.changed() => {
                if changed.is_err() || core.session().credential().is_none() {
                    bail!("gateway rejected the credential; sign in again");
                }
            }
            change = changes.recv() => match change {
                Ok(change) if change.device_id() == device => {
                    let status = core.get_status(device);
                    emit(json, &status, || render::status_lines(device, &status))?;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(event = "watch_lagged", skipped);
                }
                Err(RecvError::Closed) => return Ok(()),
            },
            notice = notices.recv() => {
                if let Ok(notice) = notice {
                    emit(json, &notice, || vec![render::notice_line(&notice)])?;
                }
            }
        }
    }
}

/// Entries in `entries` that `seen` does not hold yet, in log order.
fn unseen(seen: &[AuditEntry], entries: &[AuditEntry]) -> Vec<AuditEntry> {
    entries
        .iter()
        .filter(|entry| !seen.contains(entry))
        .cloned()
        .collect()
}

fn emit<T, F>(json: bool, value: &T, lines: F) -> Result<()>
where
    T: Serialize + ?Sized,
    F: FnOnce() -> Vec<String>,
{
    if json {
        print_json(value)
    } else {
        print_lines(lines());
        Ok(())
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
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
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
