//! Command-line interface for the EdgeTwin device twin engine.
//!
//! Loads device models and instances from JSON files, replays adapter
//! messages against them and prints the resulting state as JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use edgetwin_core::TwinConfig;
use edgetwin_core::config::env_vars;
use edgetwin_devices::{
    Device, DeviceList, DeviceModel, DeviceModelList, DevicesStatusMessage, LivenessMonitor,
    ReportDevicesMessage, TwinService,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

/// EdgeTwin - device models and twins for edge gateways.
#[derive(Parser, Debug)]
#[command(name = "edgetwin")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Validate models and bind devices against them.
    Check {
        /// Device models (JSON array or {"items": [...]}).
        #[arg(long)]
        models: PathBuf,
        /// Device instances (JSON array or {"items": [...]}).
        #[arg(long)]
        devices: Option<PathBuf>,
    },
    /// Replay adapter messages and print the resulting twins.
    Replay {
        /// Device models.
        #[arg(long)]
        models: PathBuf,
        /// Device instances.
        #[arg(long)]
        devices: PathBuf,
        /// Desired values, shaped like a report batch.
        #[arg(long)]
        desired: Option<PathBuf>,
        /// Report batch ({"devices": [...]}).
        #[arg(long)]
        reports: Option<PathBuf>,
        /// Status batch ({"devices_status": [...]}).
        #[arg(long)]
        statuses: Option<PathBuf>,
        /// Start collection on every device before replaying.
        #[arg(long)]
        collect: bool,
    },
    /// Print the effective configuration.
    ShowConfig,
}

/// A bare list or a `{"items": [...]}` wrapper.
#[derive(Deserialize)]
#[serde(untagged)]
enum ListFile<T, W> {
    Bare(Vec<T>),
    Wrapped(W),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_models(path: &Path) -> Result<Vec<DeviceModel>> {
    Ok(match read_json::<ListFile<DeviceModel, DeviceModelList>>(path)? {
        ListFile::Bare(items) => items,
        ListFile::Wrapped(list) => list.items,
    })
}

fn read_devices(path: &Path) -> Result<Vec<Device>> {
    Ok(match read_json::<ListFile<Device, DeviceList>>(path)? {
        ListFile::Bare(items) => items,
        ListFile::Wrapped(list) => list.items,
    })
}

fn init_logging(config: &TwinConfig, verbose: bool) {
    let json_logging = config.logging.json
        || env_vars::parsed::<bool>(env_vars::LOG_JSON).unwrap_or(false);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            tracing_subscriber::EnvFilter::new("edgetwin=debug")
        } else {
            tracing_subscriber::EnvFilter::new(&config.logging.filter)
        }
    });

    // Logs go to stderr; stdout carries the JSON result
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = TwinConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    init_logging(&config, args.verbose);

    match args.command {
        Command::Check { models, devices } => run_check(config, &models, devices.as_deref()),
        Command::Replay {
            models,
            devices,
            desired,
            reports,
            statuses,
            collect,
        } => {
            run_replay(
                config,
                ReplayInputs {
                    models,
                    devices,
                    desired,
                    reports,
                    statuses,
                    collect,
                },
            )
            .await
        }
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Register everything, collecting failures instead of stopping at the first.
fn load(service: &TwinService, models: &Path, devices: Option<&Path>) -> Result<Vec<serde_json::Value>> {
    let mut errors = Vec::new();
    for model in read_models(models)? {
        let name = model.name.clone();
        if let Err(e) = service.register_model(model) {
            errors.push(json!({"model": name, "kind": e.kind(), "error": e.to_string()}));
        }
    }
    if let Some(path) = devices {
        for device in read_devices(path)? {
            let id = device.device_id.clone();
            if let Err(e) = service.create_device(device) {
                errors.push(json!({"device": id, "kind": e.kind(), "error": e.to_string()}));
            }
        }
    }
    Ok(errors)
}

fn run_check(config: TwinConfig, models: &Path, devices: Option<&Path>) -> Result<()> {
    let service = TwinService::new(config);
    let errors = load(&service, models, devices)?;

    let summary = json!({
        "models": service.list_models().len(),
        "devices": service.list_devices().len(),
        "errors": errors,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if !errors.is_empty() {
        bail!("{} definition(s) failed validation", errors.len());
    }
    Ok(())
}

struct ReplayInputs {
    models: PathBuf,
    devices: PathBuf,
    desired: Option<PathBuf>,
    reports: Option<PathBuf>,
    statuses: Option<PathBuf>,
    collect: bool,
}

async fn run_replay(config: TwinConfig, inputs: ReplayInputs) -> Result<()> {
    let liveness = config.liveness.clone();
    let service = Arc::new(TwinService::new(config));
    let errors = load(&service, &inputs.models, Some(&inputs.devices))?;
    if !errors.is_empty() {
        println!("{}", serde_json::to_string_pretty(&json!({ "errors": errors }))?);
        bail!("{} definition(s) failed validation", errors.len());
    }

    let monitor = liveness
        .enabled
        .then(|| LivenessMonitor::from_settings(service.clone(), &liveness).spawn());

    if inputs.collect {
        for device in service.list_devices() {
            service
                .start_collect(&device.device_id)
                .with_context(|| format!("failed to start collecting {}", device.device_id))?;
        }
    }

    let mut rejected_desired = Vec::new();
    if let Some(path) = &inputs.desired {
        let batch: ReportDevicesMessage = read_json(path)?;
        for device in &batch.devices {
            for p in &device.services {
                if let Err(e) = service.set_desired(
                    &device.device_id,
                    &p.service,
                    &p.property_name,
                    p.value.clone(),
                    p.timestamp,
                ) {
                    rejected_desired.push(json!({
                        "device_id": device.device_id,
                        "service": p.service,
                        "property_name": p.property_name,
                        "error": {"kind": e.kind(), "message": e.to_string()},
                    }));
                }
            }
        }
    }

    let statuses = match &inputs.statuses {
        Some(path) => Some(service.ingest_statuses(&read_json::<DevicesStatusMessage>(path)?)),
        None => None,
    };
    let reports = match &inputs.reports {
        Some(path) => Some(service.ingest_reports(&read_json::<ReportDevicesMessage>(path)?)),
        None => None,
    };

    let diffs: BTreeMap<String, _> = service
        .list_devices()
        .into_iter()
        .filter_map(|d| {
            let deltas = service.diff(&d.device_id).ok()?;
            (!deltas.is_empty()).then_some((d.device_id, deltas))
        })
        .collect();

    let output = json!({
        "devices": service.list_devices(),
        "diffs": diffs,
        "rejected_desired": rejected_desired,
        "reports": reports,
        "statuses": statuses,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    if let Some(handle) = monitor {
        handle.stop().await;
    }
    Ok(())
}
