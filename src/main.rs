// src/main.rs - Command line front-end for the scan engine
use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use rangescan::{
    Config, ScanEvent, ScanManager, ScanOptions, ScanType, TargetResolver, TimingProfile,
};

#[derive(Parser)]
#[command(name = "rangescan")]
#[command(about = "Concurrent network scan orchestrator")]
struct Args {
    #[command(subcommand)]
    command: Cli,

    #[arg(long, global = true)]
    verbose: bool,

    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Cli {
    /// Scan a target spec and stream results as JSON lines
    Scan {
        #[arg(help = "Target spec: host, IP, CIDR, range, or comma list")]
        spec: String,

        #[arg(long, short = 't', default_value = "quick",
              help = "Scan type (quick, full, stealth, udp, custom)")]
        scan_type: String,

        #[arg(long, short = 'p', help = "Port range, e.g. 22,80 or 1-1024")]
        ports: Option<String>,

        #[arg(long, help = "Timing profile (paranoid..insane)")]
        timing: Option<String>,

        #[arg(long, help = "Extra script arguments for custom scans")]
        script_args: Option<String>,
    },

    /// Resolve a target spec without scanning
    Resolve {
        spec: String,
    },

    /// Initialize a user configuration file
    Init {
        #[arg(long, help = "Overwrite an existing configuration")]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        error!("{}", e);
        exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Cli::Scan {
            spec,
            scan_type,
            ports,
            timing,
            script_args,
        } => {
            let config = Config::load(args.config.as_deref())?;
            let options = build_options(&scan_type, ports, timing, script_args)?;
            scan(config, &spec, options).await
        }
        Cli::Resolve { spec } => {
            let config = Config::load(args.config.as_deref())?;
            let resolver = TargetResolver::new(config.resolver.max_targets);
            for target in resolver.resolve(&spec)? {
                println!("{}", target);
            }
            Ok(())
        }
        Cli::Init { force } => {
            let path = Config::init(force)?;
            info!("Configuration written to {}", path.display());
            Ok(())
        }
    }
}

fn build_options(
    scan_type: &str,
    ports: Option<String>,
    timing: Option<String>,
    script_args: Option<String>,
) -> anyhow::Result<ScanOptions> {
    let scan_type = match scan_type {
        "quick" => ScanType::Quick,
        "full" => ScanType::Full,
        "stealth" => ScanType::Stealth,
        "udp" => ScanType::Udp,
        "custom" => ScanType::Custom,
        other => anyhow::bail!("unknown scan type '{}'", other),
    };
    let timing = match timing.as_deref() {
        None => TimingProfile::Aggressive,
        Some("paranoid") => TimingProfile::Paranoid,
        Some("sneaky") => TimingProfile::Sneaky,
        Some("polite") => TimingProfile::Polite,
        Some("normal") => TimingProfile::Normal,
        Some("aggressive") => TimingProfile::Aggressive,
        Some("insane") => TimingProfile::Insane,
        Some(other) => anyhow::bail!("unknown timing profile '{}'", other),
    };

    let mut options = ScanOptions::new(scan_type);
    options.timing = timing;
    options.script_args = script_args;
    if let Some(ports) = ports {
        options.port_range = ports;
    }
    options.validate()?;
    Ok(options)
}

async fn scan(config: Config, spec: &str, options: ScanOptions) -> anyhow::Result<()> {
    let manager = ScanManager::new(config);
    let mut events = manager.subscribe();

    let ids = manager.submit(spec, options)?;
    info!("Submitted {} jobs for '{}'", ids.len(), spec);

    let mut remaining = ids.len();
    let mut failed = 0usize;
    let mut interrupted = false;

    while remaining > 0 {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
                match &event {
                    ScanEvent::JobFailed { .. } => {
                        failed += 1;
                        remaining -= 1;
                    }
                    ScanEvent::JobCompleted { .. } | ScanEvent::JobCancelled { .. } => {
                        remaining -= 1;
                    }
                    _ => {}
                }
            }
            result = tokio::signal::ctrl_c(), if !interrupted => {
                result?;
                interrupted = true;
                info!("Interrupted, cancelling outstanding jobs");
                for id in &ids {
                    // Jobs that already finished report AlreadyTerminal.
                    let _ = manager.cancel(*id);
                }
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} jobs failed", failed, ids.len());
    }
    Ok(())
}
