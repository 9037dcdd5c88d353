//! rccnet - net text tool
//!
//! Checks and formats net wire text, and runs nets on the simulated
//! control core while printing lifecycle events as JSON lines.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rccnet::events::{output_event, ConditionEvent, ErrorEvent, NetEvent, NetSummary, ScheduleEvent};
use rccnet::{
    ActivitySchedule, Command, CommandResult, ConditionStatus, ControlCore, CoreConfig, NetCommand, NetParser,
    NetStatus, RuntimeResult, RuntimeSchedule, ScheduleStatus, SimulatedCore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "rccnet")]
#[command(about = "Parse, format and simulate control nets")]
#[command(version)]
struct Args {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a net and print its summary as JSON
    Check { file: PathBuf },
    /// Print a net in canonical wire text
    Fmt { file: PathBuf },
    /// Run a net on the simulated control core
    Simulate {
        file: PathBuf,
        /// Device the activity runs on
        #[arg(short, long, default_value = "robot")]
        device: String,
        /// Fail the net with this message instead of completing it
        #[arg(long)]
        fail: Option<String>,
    },
}

impl Args {
    fn load_config(&self) -> Result<CoreConfig> {
        match &self.config {
            Some(path) => CoreConfig::load_from_path(path)
                .with_context(|| format!("Failed to load config {}", path.display())),
            None => Ok(CoreConfig::default()),
        }
    }
}

fn read_net(file: &Path) -> Result<String> {
    let text = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    Ok(text.trim().to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config()?;
    let parser = NetParser::from_config(&config);

    let outcome = match &args.command {
        Commands::Check { file } => {
            let fragment = parser
                .parse(&read_net(file)?)
                .with_context(|| format!("Invalid net in {}", file.display()))?;
            let summary = NetSummary::of(&fragment);
            let valid = summary.problems.is_empty();
            output_event(&summary);
            if !valid {
                bail!("Net in {} has dangling references", file.display());
            }
            Ok(())
        }
        Commands::Fmt { file } => {
            let fragment = parser
                .parse(&read_net(file)?)
                .with_context(|| format!("Invalid net in {}", file.display()))?;
            println!("{}", fragment);
            Ok(())
        }
        Commands::Simulate { file, device, fail } => {
            simulate(&config, &parser, file, device, fail.as_deref()).await
        }
    };

    if let Err(e) = &outcome {
        output_event(&ErrorEvent::new(&format!("{:#}", e)));
    }
    outcome
}

async fn simulate(
    config: &CoreConfig,
    parser: &NetParser,
    file: &Path,
    device: &str,
    fail: Option<&str>,
) -> Result<()> {
    let fragment = parser
        .parse(&read_net(file)?)
        .with_context(|| format!("Invalid net in {}", file.display()))?;
    let core = Arc::new(SimulatedCore::new(config).context("Failed to start simulated control core")?);
    core.create_device(device).await?;

    let values = core.eval(&fragment).await.context("Evaluation failed")?;
    for (key, value) in &values {
        info!("{} = {}", key, value);
    }

    let name = file
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("net")
        .to_string();
    let command: Arc<dyn Command> = Arc::new(NetCommand::new(&name, fragment, core.clone(), config));
    let schedule = RuntimeSchedule::builder(&name, core.clone())
        .command(command.clone())
        .predecessor(RuntimeResult::fresh(&[device]))
        .result(RuntimeResult::completion(CommandResult::completions(&command), &[device]))
        .result(RuntimeResult::cancellation(CommandResult::cancellations(&command), &[device]))
        .result(RuntimeResult::failure("net failed", CommandResult::exceptions(&command), &[device]))
        .build();
    let schedule_name = name.clone();
    schedule.add_status_listener(Arc::new(move |status: ScheduleStatus| {
        output_event(&ScheduleEvent::new(&schedule_name, status));
    }));

    schedule.load().await.context("Failed to load activity")?;
    let handle = command.handle().context("Command was not loaded")?;
    let net = handle.net().clone();
    let (id, description) = (net.id(), net.description().to_string());
    net.add_status_listener(Arc::new(move |status: NetStatus| {
        output_event(&NetEvent::new(id, &description, status));
    }));
    net.add_condition_listener(Arc::new(move |condition: &str, status: ConditionStatus| {
        output_event(&ConditionEvent::new(id, condition, status));
    }));

    if !schedule.activate().await.context("Failed to activate activity")? {
        bail!("Control core refused activity '{}'", name);
    }
    core.flush().await?;

    match fail {
        Some(reason) => core.fail(id, reason).await?,
        None => core.finish(id).await?,
    }
    let status = schedule.wait_terminal().await;
    info!("Activity '{}' ended as {:?}", name, status);

    schedule.unload().await.context("Failed to unload activity")?;
    match status {
        ScheduleStatus::Complete => Ok(()),
        status => {
            error!("Activity '{}' did not complete", name);
            bail!("Activity '{}' ended as {:?}", name, status)
        }
    }
}
