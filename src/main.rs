//! CLI entry point for axis-tool
//!
//! Provides command-line access to the polling engine:
//! - Probing a single axis without the scheduler (`test-axis`)
//! - Polling axes or groups and printing updates (`poll`)
//! - Absolute and relative moves with post-move confirmation (`move`)
//! - Stopping an axis (`stop`)
//! - Listing axis groups (`groups`)
//! - Running a simulated controller over TCP (`simulate`)
//!
//! # Usage
//!
//! ```bash
//! axis-tool test-axis st2_coll_1_x
//! axis-tool poll --group slits --watch
//! axis-tool move st2_coll_1_x 1.5 --mode physical
//! axis-tool move st2_coll_1_x 100 --relative minus
//! axis-tool simulate --port 10101
//! ```

use anyhow::{bail, Context, Result};
use axis_tool::axis::{AxisDefinition, Unit};
use axis_tool::bss;
use axis_tool::channel::ExclusiveChannel;
use axis_tool::client::ControllerClient;
use axis_tool::config::{AppConfig, DEFAULT_CONFIG_PATH};
use axis_tool::conversion::{self, Direction, DisplayMode};
use axis_tool::groups::{self, AxisGroup};
use axis_tool::logging::{self, OutputFormat, TracingConfig};
use axis_tool::messages::AxisUpdate;
use axis_tool::scheduler::AxisEngine;
use axis_tool::simulator::{self, SimulatedController};
use axis_tool::transport::TcpTransport;
use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "axis-tool")]
#[command(about = "Poll and move beamline motion axes", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// bss.config to read axes and network settings from
    #[arg(long)]
    bss: Option<PathBuf>,

    /// Log output format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one query and one status request for an axis
    TestAxis {
        /// Axis name
        name: String,
    },

    /// Poll axes and print every update
    Poll {
        /// Axis names
        axes: Vec<String>,

        /// Poll every axis of a group
        #[arg(long)]
        group: Option<String>,

        /// Keep running after every axis went idle
        #[arg(long)]
        watch: bool,

        /// Display unit mode (pulse or physical)
        #[arg(long, default_value = "pulse")]
        mode: DisplayMode,
    },

    /// Move an axis and follow it until it stops
    Move {
        /// Axis name
        axis: String,

        /// Target (absolute) or step (relative)
        #[arg(allow_negative_numbers = true)]
        value: f64,

        /// Unit mode of the value (pulse or physical)
        #[arg(long, default_value = "pulse")]
        mode: DisplayMode,

        /// Move relative to the current position (plus or minus)
        #[arg(long)]
        relative: Option<Direction>,
    },

    /// Stop an axis
    Stop {
        /// Axis name
        axis: String,
    },

    /// List axis groups
    Groups,

    /// Serve a simulated controller over TCP
    Simulate {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Listen port
        #[arg(long, default_value = "10101")]
        port: u16,
    },
}

/// Everything the commands need, resolved from configuration files.
struct AppContext {
    config: AppConfig,
    catalog: Vec<AxisDefinition>,
    groups: Vec<AxisGroup>,
}

impl AppContext {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = AppConfig::load_from(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
        config.validate().context("Invalid configuration")?;

        let tracing_config = TracingConfig::from_app_config(&config)?.with_format(cli.log_format);
        logging::init(tracing_config)?;

        let bss_path = cli.bss.clone().unwrap_or_else(|| config.controller.bss_path());
        let mut catalog = match bss::load_bss_config(&bss_path)
            .with_context(|| format!("Failed to read {}", bss_path.display()))?
        {
            Some(parsed) => {
                config.controller.apply_network(&parsed.network);
                parsed.axes
            }
            None => Vec::new(),
        };

        // Inline definitions replace bss.config entries of the same name.
        for axis in &config.axes {
            match catalog.iter_mut().find(|known| known.name == axis.name) {
                Some(known) => *known = axis.clone(),
                None => catalog.push(axis.clone()),
            }
        }

        let loaded = groups::load_group_files(&config.group_files, &catalog).context("Failed to load group files")?;
        let groups = groups::with_builtin_groups(loaded, &catalog);

        info!(
            host = %config.controller.host,
            port = config.controller.port,
            device_object = %config.controller.device_object,
            axes = catalog.len(),
            groups = groups.len(),
            "configuration loaded"
        );
        Ok(Self {
            config,
            catalog,
            groups,
        })
    }

    fn client(&self) -> ControllerClient {
        let controller = &self.config.controller;
        let transport = TcpTransport::new(&controller.host, controller.port, controller.timeout());
        ControllerClient::new(ExclusiveChannel::new(Arc::new(transport)), controller.device_object.clone())
    }

    /// Definition for any axis name: catalog, then groups, then defaults.
    fn definition(&self, name: &str) -> AxisDefinition {
        self.catalog
            .iter()
            .chain(self.groups.iter().flat_map(|group| group.axes.iter()))
            .find(|axis| axis.name == name)
            .cloned()
            .unwrap_or_else(|| AxisDefinition::with_defaults(name))
    }

    fn spawn_engine(&self, names: &[String]) -> Result<(AxisEngine, BTreeMap<String, AxisDefinition>)> {
        let definitions: BTreeMap<String, AxisDefinition> =
            names.iter().map(|name| (name.clone(), self.definition(name))).collect();
        let engine = AxisEngine::spawn(
            definitions.values().cloned(),
            self.client(),
            self.config.polling.to_polling_config(),
        )?;
        Ok((engine, definitions))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = AppContext::load(&cli)?;

    match cli.command {
        Commands::TestAxis { name } => test_axis(&context, &name).await,
        Commands::Poll {
            axes,
            group,
            watch,
            mode,
        } => poll(&context, axes, group, watch, mode).await,
        Commands::Move {
            axis,
            value,
            mode,
            relative,
        } => move_axis(&context, &axis, value, mode, relative).await,
        Commands::Stop { axis } => stop(&context, &axis).await,
        Commands::Groups => {
            list_groups(&context);
            Ok(())
        }
        Commands::Simulate { bind, port } => simulate(&context, &bind, port).await,
    }
}

async fn test_axis(context: &AppContext, name: &str) -> Result<()> {
    let definition = context.definition(name);
    let client = context.client();
    println!("Testing axis '{}' on {}", name, client.describe());

    let read = client
        .read_position(name, definition.unit)
        .await
        .with_context(|| format!("Query for '{name}' failed"))?;
    println!("  state:    {}", read.state);
    println!("  position: {} {}", conversion::format_decimal(read.reading.value), read.reading.unit);

    match client.read_status(name).await {
        Ok((bits, limits)) => println!(
            "  status:   {bits} (cw_hard={} ccw_hard={} cw_soft={} ccw_soft={} home={})",
            limits.cw_hard, limits.ccw_hard, limits.cw_soft, limits.ccw_soft, limits.home
        ),
        Err(err) => println!("  status:   unavailable ({err})"),
    }
    Ok(())
}

fn print_update(definitions: &BTreeMap<String, AxisDefinition>, update: &AxisUpdate, mode: DisplayMode) {
    let Some(definition) = definitions.get(&update.axis) else {
        return;
    };
    let position = conversion::format_position(definition, update.unit, &update.outcome, mode);
    let limits = if update.limits.any_limit() || update.limits.home {
        format!(" limits={:05b}", update.status_bits)
    } else {
        String::new()
    };
    println!(
        "{:<24} {:<12} {}{}",
        definition.label(),
        update.outcome.state.to_string(),
        position,
        limits
    );
}

/// True once an update leaves the axis without a follow-up round.
fn settled(update: &AxisUpdate) -> bool {
    update.outcome.communication_failed || !update.outcome.state.is_moving()
}

async fn next_update(updates: &mut broadcast::Receiver<AxisUpdate>) -> Result<Option<AxisUpdate>> {
    loop {
        match updates.recv().await {
            Ok(update) => return Ok(Some(update)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "display fell behind, some updates were skipped");
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(None),
        }
    }
}

async fn poll(
    context: &AppContext,
    mut axes: Vec<String>,
    group: Option<String>,
    watch: bool,
    mode: DisplayMode,
) -> Result<()> {
    if let Some(name) = group {
        let group =
            groups::find_group(&context.groups, &name).with_context(|| format!("Unknown group '{name}'"))?;
        axes.extend(group.axes.iter().map(|axis| axis.name.clone()));
    }
    let mut seen = HashSet::new();
    axes.retain(|axis| seen.insert(axis.clone()));
    if axes.is_empty() {
        bail!("No axes to poll: name axes or pass --group");
    }

    let (engine, definitions) = context.spawn_engine(&axes)?;
    let mut updates = engine.subscribe();
    engine.poll_axes(&axes).await?;

    let mut pending: HashSet<String> = axes.iter().cloned().collect();
    let mut failed: HashSet<String> = HashSet::new();
    let interval = context.config.polling.to_polling_config().moving_interval;
    loop {
        let update = tokio::select! {
            update = next_update(&mut updates) => update?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(update) = update else {
            break;
        };
        print_update(&definitions, &update, mode);
        if update.outcome.communication_failed {
            failed.insert(update.axis.clone());
        } else {
            failed.remove(&update.axis);
        }
        if settled(&update) {
            pending.remove(&update.axis);
        }
        if pending.is_empty() {
            if !watch {
                break;
            }
            // Errored axes stay suppressed, the rest are polled again.
            tokio::time::sleep(interval).await;
            engine.poll_all().await?;
            pending = axes.iter().filter(|axis| !failed.contains(*axis)).cloned().collect();
        }
    }
    engine.shutdown().await?;
    Ok(())
}

async fn move_axis(
    context: &AppContext,
    axis: &str,
    value: f64,
    mode: DisplayMode,
    relative: Option<Direction>,
) -> Result<()> {
    let names = vec![axis.to_string()];
    let (engine, definitions) = context.spawn_engine(&names)?;
    let mut updates = engine.subscribe();

    // Prime the learned unit before resolving the target.
    engine.poll(axis).await?;
    if let Some(update) = next_update(&mut updates).await? {
        print_update(&definitions, &update, mode);
        if update.outcome.communication_failed {
            bail!("Axis '{axis}' did not answer");
        }
    }

    let target = match relative {
        Some(direction) => engine.move_relative(axis, value, mode, direction).await,
        None => engine.move_absolute(axis, value, mode).await,
    }
    .with_context(|| format!("Move of '{axis}' failed"))?;
    println!("{axis}: moving to {} (expected {} pulse)", target.command.wire_value(), target.expected_raw);

    while let Some(update) = next_update(&mut updates).await? {
        if update.axis != axis {
            continue;
        }
        print_update(&definitions, &update, mode);
        if settled(&update) {
            let snapshot = engine.snapshot(axis).await?;
            if snapshot.is_some_and(|s| !s.polling) {
                break;
            }
        }
    }
    engine.shutdown().await?;
    Ok(())
}

async fn stop(context: &AppContext, axis: &str) -> Result<()> {
    let names = vec![axis.to_string()];
    let (engine, _) = context.spawn_engine(&names)?;
    engine.stop(axis).await.with_context(|| format!("Stop of '{axis}' failed"))?;
    println!("{axis}: stopped");
    engine.shutdown().await?;
    Ok(())
}

fn list_groups(context: &AppContext) {
    for group in &context.groups {
        println!("{} ({} axes)", group.name, group.axes.len());
        for axis in &group.axes {
            println!(
                "  {:<24} {:<24} scale={} sense={} unit={}",
                axis.name,
                axis.label(),
                axis.scale,
                axis.sense.factor(),
                axis.unit
            );
        }
    }
}

async fn simulate(context: &AppContext, bind: &str, port: u16) -> Result<()> {
    let controller = SimulatedController::new(&context.config.controller.device_object);
    let mut axes: Vec<AxisDefinition> = context.catalog.clone();
    for group in &context.groups {
        for axis in &group.axes {
            if !axes.iter().any(|known| known.name == axis.name) {
                axes.push(axis.clone());
            }
        }
    }
    if axes.is_empty() {
        axes.push(AxisDefinition::with_defaults("st2_coll_1_x"));
        axes.push(AxisDefinition::new("st2_slit_width", "Slit width", 1000.0, Default::default(), Unit::Mm)?);
        axes.push(AxisDefinition::new("dtheta", "Mono theta", 10000.0, Default::default(), Unit::Deg)?);
    }
    for axis in &axes {
        if axis.unit.is_physical() {
            controller.add_physical_axis(&axis.name, 0.0, axis.unit);
        } else {
            controller.add_pulse_axis(&axis.name, 0.0);
        }
    }

    let listener = tokio::net::TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("Failed to bind {bind}:{port}"))?;
    println!(
        "Simulating '{}' with {} axes on {} (Ctrl+C to stop)",
        context.config.controller.device_object,
        axes.len(),
        listener.local_addr()?
    );

    tokio::select! {
        result = simulator::serve(listener, controller) => result?,
        _ = tokio::signal::ctrl_c() => println!("Simulator shutting down"),
    }
    Ok(())
}
