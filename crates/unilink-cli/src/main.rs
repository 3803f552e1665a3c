//! Command-line interface for the UniLink connectivity layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use unilink_core::config::{env_vars, ConnectivityConfig};
use unilink_core::context::{
    CommunicationContext, NetworkEnvironment, PriorityFactor, SecurityLevel, UserPreferences,
};
use unilink_core::prelude::*;
use unilink_devices::{
    Advertisement, ConnectivityRuntime, LoopbackNetwork, LoopbackTransportProvider,
    MemoryStateSink, StrategyEngine,
};

/// UniLink - one command interface for MQTT, BLE, Matter and cloud devices.
#[derive(Parser, Debug)]
#[command(name = "unilink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to UNILINK_CONFIG, then built-in defaults).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect the connectivity configuration.
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommand,
    },
    /// Score every connection strategy for a device.
    Strategies(StrategyArgs),
    /// Run the whole stack against simulated devices.
    Simulate {
        /// Extra latency on every simulated link, in milliseconds.
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        /// Refuse this many connects from the gateway before it answers.
        #[arg(long, default_value_t = 0)]
        flaky_gateway: u32,
        /// Print a JSON summary instead of text.
        #[arg(long)]
        json: bool,
    },
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
    /// Check a configuration file and report the first problem.
    Validate {
        /// Path to the TOML file.
        #[arg(required = true)]
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct StrategyArgs {
    /// Device identifier.
    #[arg(long, default_value = "device-1")]
    device_id: String,
    /// Device type, e.g. light, sensor, thermostat, gateway.
    #[arg(long, default_value = "light")]
    device_type: String,
    /// Protocols the device supports (comma separated).
    #[arg(long, value_delimiter = ',', required = true)]
    protocols: Vec<ProtocolKind>,
    /// What to optimise for.
    #[arg(long, value_enum, default_value_t = Priority::Balanced)]
    priority: Priority,
    /// Required security level.
    #[arg(long, value_enum, default_value_t = Security::Standard)]
    security: Security,
    /// The device runs on battery.
    #[arg(long)]
    battery: bool,
    /// Ask for power saving explicitly.
    #[arg(long)]
    power_saving: bool,
    /// Pretend Bluetooth is unavailable.
    #[arg(long)]
    no_bluetooth: bool,
    /// Pretend Wi-Fi is unavailable.
    #[arg(long)]
    no_wifi: bool,
    /// Print JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Priority {
    Balanced,
    Speed,
    Reliability,
    Power,
    Security,
}

impl From<Priority> for PriorityFactor {
    fn from(p: Priority) -> Self {
        match p {
            Priority::Balanced => PriorityFactor::Balanced,
            Priority::Speed => PriorityFactor::Speed,
            Priority::Reliability => PriorityFactor::Reliability,
            Priority::Power => PriorityFactor::Power,
            Priority::Security => PriorityFactor::Security,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Security {
    Low,
    Standard,
    High,
    Critical,
}

impl From<Security> for SecurityLevel {
    fn from(s: Security) -> Self {
        match s {
            Security::Low => SecurityLevel::Low,
            Security::Standard => SecurityLevel::Standard,
            Security::High => SecurityLevel::High,
            Security::Critical => SecurityLevel::Critical,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    match args.command {
        Command::Config { config_cmd } => run_config(config_cmd, args.config.as_ref()),
        Command::Strategies(strategy_args) => {
            let config = load_config(args.config.as_ref())?;
            run_strategies(&config, strategy_args)
        }
        Command::Simulate {
            latency_ms,
            flaky_gateway,
            json,
        } => {
            let config = load_config(args.config.as_ref())?;
            run_simulation(config, Duration::from_millis(latency_ms), flaky_gateway, json).await
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "unilink=debug" } else { "unilink=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if env_vars::log_json() {
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
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ConnectivityConfig> {
    match path {
        Some(path) => ConnectivityConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => ConnectivityConfig::from_env().context("Failed to load configuration"),
    }
}

fn run_config(cmd: ConfigCommand, path: Option<&PathBuf>) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let config = load_config(path)?;
            print!("{}", config.to_toml_string()?);
        }
        ConfigCommand::Validate { path } => {
            let config = ConnectivityConfig::load(&path)
                .with_context(|| format!("{} is not a valid configuration", path.display()))?;
            println!("{}: ok", path.display());
            println!(
                "  queue max size {}, {} concurrent commands, reevaluation threshold {}",
                config.queue.max_size,
                config.processor.max_concurrent,
                config.communicator.reevaluation_threshold
            );
        }
    }
    Ok(())
}

fn run_strategies(config: &ConnectivityConfig, args: StrategyArgs) -> Result<()> {
    let device = DeviceDescriptor::new(&args.device_id, &args.device_type)
        .with_protocols(args.protocols.iter().copied())
        .battery_powered(args.battery);
    let mut network = NetworkEnvironment::default();
    network.bluetooth_available = !args.no_bluetooth;
    network.wifi_available = !args.no_wifi;
    let preferences = UserPreferences {
        priority: args.priority.into(),
        security_level: args.security.into(),
        power_saving_mode: args.power_saving,
        ..UserPreferences::default()
    };
    let context = CommunicationContext::new(device)
        .with_network(network)
        .with_preferences(preferences);

    let engine = StrategyEngine::with_default_strategies(config.protocols.clone());
    let evaluations = engine.evaluate_all(&context);
    let selection = engine.select(&context).ok();

    if args.json {
        let output = json!({
            "device_id": args.device_id,
            "evaluations": evaluations,
            "selection": selection.as_ref().map(|(_, s)| json!({
                "strategy": s.strategy,
                "protocol": s.protocol,
                "alternatives": s.alternatives,
                "reason": s.reason,
                "expected_connect_ms": s.expected_connect_time.as_millis() as u64,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{:<20} {:>5}  {:<10} NOTES", "STRATEGY", "SCORE", "PROTOCOL");
    for eval in &evaluations {
        let score = if eval.applicable {
            eval.suitability_score.to_string()
        } else {
            "-".to_string()
        };
        let protocol = eval
            .expected_performance
            .map(|p| p.protocol.to_string())
            .unwrap_or_default();
        let notes = eval
            .reasons
            .iter()
            .chain(eval.risks.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        println!("{:<20} {:>5}  {:<10} {}", eval.strategy, score, protocol, notes);
    }
    match selection {
        Some((_, s)) => {
            let fallbacks: Vec<String> = s.alternatives.iter().map(|p| p.to_string()).collect();
            println!();
            println!("Selected {} via {} ({})", s.protocol, s.strategy, s.reason);
            if !fallbacks.is_empty() {
                println!("Fallbacks: {}", fallbacks.join(", "));
            }
        }
        None => println!("\nNo applicable strategy for {}", args.device_id),
    }
    Ok(())
}

/// Simulated devices: (id, type, protocol).
const SIMULATED_DEVICES: [(&str, &str, ProtocolKind); 4] = [
    ("bulb-living", "bulb", ProtocolKind::Matter),
    ("thermostat-hall", "thermostat", ProtocolKind::Cloud),
    ("hub-main", "gateway", ProtocolKind::Mqtt),
    ("tag-door", "sensor", ProtocolKind::Ble),
];

fn demo_command(device_type: &str, device_id: &str) -> DeviceCommand {
    let payload = match device_type {
        "bulb" => CommandPayload::Dim { level: 60 },
        "thermostat" => CommandPayload::Temperature { celsius: 21.5 },
        "gateway" => CommandPayload::Scene {
            scene_id: "evening".to_string(),
        },
        _ => CommandPayload::Switch { on: true },
    };
    DeviceCommand::new(device_id, payload)
}

async fn run_simulation(
    config: ConnectivityConfig,
    latency: Duration,
    flaky_gateway: u32,
    json_output: bool,
) -> Result<()> {
    let network = LoopbackNetwork::new();
    for (id, device_type, protocol) in SIMULATED_DEVICES {
        network.add_device(protocol, id);
        if !latency.is_zero() {
            network.set_latency(protocol, id, latency);
        }
        if protocol == ProtocolKind::Ble {
            network.advertise(protocol, Advertisement::new(id, device_type).with_rssi(-58));
        }
    }
    if flaky_gateway > 0 {
        network.refuse_next_connects(ProtocolKind::Mqtt, "hub-main", flaky_gateway);
    }

    let sink = Arc::new(MemoryStateSink::new());
    let runtime = ConnectivityRuntime::builder(config)
        .with_transports(Arc::new(LoopbackTransportProvider::new(network.clone())))
        .with_state_sink(sink.clone())
        .build()?;
    let mut events = runtime.subscribe();
    runtime.start().await?;

    let discovered = runtime.discover_devices(None).await?;
    tracing::info!(count = discovered.len(), "Discovery complete");

    let mut connections = Vec::new();
    for (id, device_type, _) in SIMULATED_DEVICES {
        let descriptor = DeviceDescriptor::new(id, device_type);
        match runtime.connect_device(&descriptor, None).await {
            Ok(info) => connections.push(json!({
                "device_id": id,
                "protocol": info.protocol,
                "connected": true,
            })),
            Err(e) => connections.push(json!({
                "device_id": id,
                "connected": false,
                "error": e.to_string(),
            })),
        }
    }

    let commands: Vec<DeviceCommand> = SIMULATED_DEVICES
        .iter()
        .map(|(id, device_type, _)| demo_command(device_type, id))
        .collect();
    let mut tickets = Vec::with_capacity(commands.len());
    for command in commands {
        tickets.push(runtime.submit_command(command).await?);
    }
    let results = futures::future::join_all(tickets.into_iter().map(|t| t.wait())).await;

    let stats = runtime.manager().stats();
    let queue_stats = runtime.queue().stats().await;
    runtime.shutdown().await;

    let mut event_count = 0usize;
    while events.try_recv().is_some() {
        event_count += 1;
    }

    if json_output {
        let output = json!({
            "discovered": discovered,
            "connections": connections,
            "results": results,
            "manager": stats,
            "queue": queue_stats,
            "events": event_count,
            "state_records": sink.len(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Discovered {} device(s)", discovered.len());
    for device in &discovered {
        println!("  {} ({}) via {}", device.device_id, device.device_type, device.protocol);
    }
    println!("Connections:");
    for c in &connections {
        let id = c["device_id"].as_str().unwrap_or_default();
        match c["protocol"].as_str() {
            Some(protocol) => println!("  {} -> {}", id, protocol),
            None => println!("  {} failed: {}", id, c["error"].as_str().unwrap_or_default()),
        }
    }
    println!("Commands:");
    for r in &results {
        let detail = r
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("{}ms", r.execution_time_ms));
        println!("  {} {:?} {}", r.device_id, r.status, detail);
    }
    println!(
        "Routed {} device(s), {} event(s), {} state record(s)",
        stats.routed_devices,
        event_count,
        sink.len()
    );
    Ok(())
}
