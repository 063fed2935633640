//! Command-line front end: run one device action and print the final
//! envelope as JSON.
//!
//! ```text
//! dal --simulator GetStatus
//! dal --config dal.json --port /dev/ttyACM0 ManualCardEntry --cancel-after-ms 5000
//! ```
//!
//! Logs go to stderr and follow `RUST_LOG` (default `info`).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dal_core::config::DalConfig;
use dal_core::{ActionRequest, DalRequest, DeviceAction, DeviceIdentifier};
use dal_hardware::{EventPublisher, SimulatorDevice, event_channel};
use dal_state::WorkflowManager;

#[derive(Parser, Debug)]
#[command(name = "dal", version, about = "Payment terminal device abstraction layer")]
struct Cli {
    /// Device action to run, e.g. GetStatus or ManualCardEntry
    action: DeviceAction,

    #[arg(long, help = "JSON configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Use the simulated terminal", conflicts_with = "port")]
    simulator: bool,

    #[arg(long, help = "Serial port of a Verifone terminal (overrides the config)")]
    port: Option<String>,

    #[arg(long, help = "Only target the device with this serial number")]
    device: Option<String>,

    #[arg(long, help = "Per-request timeout override in seconds")]
    timeout: Option<u64>,

    #[arg(long, help = "Cancel the request after this many milliseconds")]
    cancel_after_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => DalConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => DalConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.serial.port_name = Some(port.clone());
    }

    let manager = build_manager(&cli, config)?;
    manager.launch_workflow()?;

    let cancellation = CancellationToken::new();
    if let Some(ms) = cli.cancel_after_ms {
        let token = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            warn!(after_ms = ms, "Cancelling request");
            token.cancel();
        });
    }

    let envelope = manager
        .set_workflow_with_token(request_for(&cli), cancellation)
        .await?;
    manager.stop_workflow().await;

    println!("{}", serde_json::to_string_pretty(&envelope)?);
    if envelope.request.has_errors() {
        std::process::exit(2);
    }
    Ok(())
}

fn request_for(cli: &Cli) -> DalRequest {
    let mut action = ActionRequest::new(cli.action);
    if let Some(serial) = &cli.device {
        action = action.with_device(DeviceIdentifier::by_serial(serial.clone()));
    }
    if let Some(seconds) = cli.timeout {
        action = action.with_timeout_seconds(seconds);
    }
    DalRequest {
        actions: vec![action],
        ..DalRequest::default()
    }
}

fn build_manager(cli: &Cli, config: DalConfig) -> anyhow::Result<WorkflowManager> {
    let (publisher, events) = event_channel();
    let builder = WorkflowManager::builder(config.clone()).with_events(events);

    if cli.simulator || config.serial.port_name.is_none() {
        info!("Using the simulated terminal");
        let (simulator, _handle) = SimulatorDevice::with_config(config.simulator, publisher);
        return Ok(builder.with_device(simulator).build());
    }
    verifone(builder, &config, publisher)
}

#[cfg(feature = "serial")]
fn verifone(
    builder: dal_state::WorkflowManagerBuilder,
    config: &DalConfig,
    publisher: EventPublisher,
) -> anyhow::Result<WorkflowManager> {
    let device = dal_hardware::transport::connect_verifone(
        &config.serial,
        config.verifone.clone(),
        config.timeouts.device_result(),
        publisher,
    )?
    .with_cancel_retries(config.manager.cancel_retries);
    Ok(builder.with_device(device).build())
}

#[cfg(not(feature = "serial"))]
fn verifone(
    _builder: dal_state::WorkflowManagerBuilder,
    _config: &DalConfig,
    _publisher: EventPublisher,
) -> anyhow::Result<WorkflowManager> {
    anyhow::bail!("built without the `serial` feature; use --simulator")
}
