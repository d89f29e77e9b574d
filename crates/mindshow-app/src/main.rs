//! MindShow Application
//!
//! Drives networked LED controllers from EEG band power: the classified
//! brain state picks the pattern, the color mood tints it.
//!
//! # Usage
//!
//! ```bash
//! # Discover controllers on the local /24 and run on a simulated signal
//! mindshow run --simulate
//!
//! # Known controller, no scan, band powers over OSC
//! mindshow run --device 192.168.1.50 --no-discovery --osc 0.0.0.0:5000
//!
//! # Override tunables
//! mindshow --set attention_threshold=0.6 --set update_rate=20 run --simulate
//!
//! # List controllers and their patterns
//! mindshow devices
//! mindshow patterns --device 192.168.1.50
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mindshow_core::config::Tunables;
use mindshow_native::{
    CommandDispatcher, ConfigHandle, DeviceRegistry, EventBus, FeatureSource, Pipeline,
    SimulatedSource, WebSocketConnector,
};

/// Discovery passes before running without LED output.
const DISCOVERY_ATTEMPTS: u32 = 3;

/// Pause between discovery passes.
const DISCOVERY_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// MindShow Application
#[derive(Parser, Debug)]
#[command(name = "mindshow")]
#[command(author, version, about = "EEG-driven LED controller shows", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Override a tunable, e.g. `--set min_state_duration=3`
    #[arg(long = "set", value_name = "NAME=VALUE", global = true)]
    set: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tick loop (default if no subcommand)
    Run {
        /// Use the simulated signal
        #[arg(long, conflicts_with = "osc")]
        simulate: bool,

        /// Receive band powers as OSC on this address
        #[arg(long, value_name = "ADDR")]
        osc: Option<String>,

        /// OSC address prefix in front of the band name
        #[arg(long, default_value = "/eeg")]
        osc_prefix: String,

        /// Controller address to connect directly (repeatable)
        #[arg(short, long = "device", value_name = "IP")]
        devices: Vec<Ipv4Addr>,

        /// Skip subnet discovery
        #[arg(long)]
        no_discovery: bool,
    },

    /// Discover controllers and list them with their patterns
    Devices {
        /// Overall discovery timeout in seconds
        #[arg(short, long)]
        timeout: Option<f64>,
    },

    /// List the patterns of one controller
    Patterns {
        /// Controller address
        #[arg(short, long)]
        device: Ipv4Addr,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("MindShow v{}", env!("CARGO_PKG_VERSION"));

    let mut tunables = Tunables::default();
    for assignment in &cli.set {
        let tunable = tunables.apply_assignment(assignment)?;
        info!("{} = {}", tunable, tunables.get(tunable));
    }
    let config = ConfigHandle::new(tunables);

    let rt = tokio::runtime::Runtime::new()?;
    match cli.command {
        None => rt.block_on(run(
            config,
            RunOptions {
                simulate: true,
                osc: None,
                osc_prefix: "/eeg".to_string(),
                devices: Vec::new(),
                no_discovery: false,
            },
        )),
        Some(Commands::Run {
            simulate,
            osc,
            osc_prefix,
            devices,
            no_discovery,
        }) => rt.block_on(run(
            config,
            RunOptions {
                simulate,
                osc,
                osc_prefix,
                devices,
                no_discovery,
            },
        )),
        Some(Commands::Devices { timeout }) => rt.block_on(list_devices(config, timeout)),
        Some(Commands::Patterns { device }) => rt.block_on(list_patterns(config, device)),
    }
}

struct RunOptions {
    simulate: bool,
    osc: Option<String>,
    osc_prefix: String,
    devices: Vec<Ipv4Addr>,
    no_discovery: bool,
}

fn new_registry(config: &ConfigHandle, events: &EventBus) -> DeviceRegistry {
    DeviceRegistry::new(
        Arc::new(WebSocketConnector::new()),
        config.clone(),
        events.clone(),
    )
}

fn device_addr(config: &ConfigHandle, ip: Ipv4Addr) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(ip), config.current().device_port)
}

/// Run the tick loop until Ctrl-C
async fn run(config: ConfigHandle, options: RunOptions) -> anyhow::Result<()> {
    let source = feature_source(&options).await?;
    let events = EventBus::default();
    let registry = new_registry(&config, &events);

    for ip in &options.devices {
        let addr = device_addr(&config, *ip);
        if let Err(e) = registry.connect_address(addr).await {
            warn!("Could not connect {}: {}", addr, e);
        }
    }

    if !options.no_discovery {
        discover_with_retry(&registry, &config).await;
    }

    let status = registry.status();
    if status.connected == 0 {
        warn!("No controllers connected, running without LED output");
    } else {
        info!("{} controller(s) connected", status.connected);
    }

    let dispatcher = CommandDispatcher::new(registry.clone(), config.clone(), events.clone());
    let pipeline = Pipeline::new(source, dispatcher, &config, events);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(pipeline.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    shutdown_tx.send_replace(true);

    let stats = handle.await?;
    registry.shutdown().await;

    info!(
        "Ran {:?}: {} ticks, {} LED updates, {} errors",
        stats.uptime(),
        stats.processed,
        stats.led_updates,
        stats.errors
    );
    Ok(())
}

/// Where `run` takes its band powers from
#[derive(Debug, PartialEq)]
enum SourceKind {
    Simulated,
    Osc { addr: String, prefix: String },
}

impl SourceKind {
    fn from_options(options: &RunOptions) -> anyhow::Result<Self> {
        match (&options.osc, options.simulate) {
            (Some(addr), _) => Ok(Self::Osc {
                addr: addr.clone(),
                prefix: options.osc_prefix.clone(),
            }),
            (None, true) => Ok(Self::Simulated),
            (None, false) => anyhow::bail!("No sample source: pass --simulate or --osc <ADDR>"),
        }
    }
}

/// Pick the sample source for `run`
async fn feature_source(options: &RunOptions) -> anyhow::Result<Box<dyn FeatureSource>> {
    match SourceKind::from_options(options)? {
        SourceKind::Simulated => {
            info!("Using the simulated signal");
            Ok(Box::new(SimulatedSource::new()))
        }
        #[cfg(feature = "osc")]
        SourceKind::Osc { addr, prefix } => {
            use mindshow_native::OscFeatureSource;

            let source = OscFeatureSource::bind(&addr).await?.with_prefix(&prefix);
            info!("Listening for OSC band powers on {}", source.local_addr()?);
            Ok(Box::new(source))
        }
        #[cfg(not(feature = "osc"))]
        SourceKind::Osc { addr, prefix } => anyhow::bail!(
            "OSC input ({prefix} on {addr}) not enabled. Rebuild with --features osc:\n\
             cargo run -p mindshow-app --features osc"
        ),
    }
}

/// Discover controllers, retrying a few times before giving up
async fn discover_with_retry(registry: &DeviceRegistry, config: &ConfigHandle) {
    for attempt in 1..=DISCOVERY_ATTEMPTS {
        let timeout = config.current().discovery_timeout();
        match registry.discover(timeout).await {
            Ok(found) if found > 0 => return,
            Ok(_) => info!("Discovery pass {} found no controllers", attempt),
            Err(e) => warn!("Discovery pass {} failed: {}", attempt, e),
        }
        if registry.status().connected > 0 {
            return;
        }
        if attempt < DISCOVERY_ATTEMPTS {
            tokio::time::sleep(DISCOVERY_RETRY_PAUSE).await;
        }
    }
}

/// Discover and list controllers
async fn list_devices(config: ConfigHandle, timeout: Option<f64>) -> anyhow::Result<()> {
    if let Some(seconds) = timeout {
        config.set("discovery_timeout", seconds)?;
    }
    let events = EventBus::default();
    let registry = new_registry(&config, &events);

    info!("Scanning for controllers...");
    discover_with_retry(&registry, &config).await;

    let status = registry.status();
    if status.devices.is_empty() {
        info!("  (none found)");
    }
    for link in registry.links() {
        let snapshot = link.snapshot();
        info!(
            "  {} - {} ({} patterns, fps {:?})",
            snapshot.address,
            snapshot.state,
            snapshot.catalog.len(),
            snapshot.last_fps
        );
        for entry in snapshot.catalog.iter() {
            info!("      {}  {}", entry.id, entry.name);
        }
    }

    registry.shutdown().await;
    Ok(())
}

/// List one controller's patterns
async fn list_patterns(config: ConfigHandle, device: Ipv4Addr) -> anyhow::Result<()> {
    let events = EventBus::default();
    let registry = new_registry(&config, &events);
    let addr = device_addr(&config, device);

    registry.connect_address(addr).await?;
    let catalog = registry.device_patterns(addr)?;
    info!("{} patterns on {}:", catalog.len(), addr);
    for entry in catalog.iter() {
        info!("  {}  {}", entry.id, entry.name);
    }

    registry.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_options(args: &[&str]) -> RunOptions {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Some(Commands::Run {
                simulate,
                osc,
                osc_prefix,
                devices,
                no_discovery,
            }) => RunOptions {
                simulate,
                osc,
                osc_prefix,
                devices,
                no_discovery,
            },
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_simulate_selects_simulated_source() {
        let options = run_options(&["mindshow", "run", "--simulate"]);
        assert_eq!(SourceKind::from_options(&options).unwrap(), SourceKind::Simulated);
    }

    #[test]
    fn test_osc_selects_osc_source() {
        let options = run_options(&["mindshow", "run", "--osc", "0.0.0.0:5000"]);
        assert_eq!(
            SourceKind::from_options(&options).unwrap(),
            SourceKind::Osc {
                addr: "0.0.0.0:5000".into(),
                prefix: "/eeg".into(),
            }
        );
    }

    #[test]
    fn test_run_without_source_rejected() {
        let options = run_options(&["mindshow", "run", "--no-discovery"]);
        assert!(SourceKind::from_options(&options).is_err());
    }

    #[test]
    fn test_simulate_conflicts_with_osc() {
        let args = ["mindshow", "run", "--simulate", "--osc", "0.0.0.0:5000"];
        assert!(Cli::try_parse_from(args).is_err());
    }
}
