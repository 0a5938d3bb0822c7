//! Power Profiling - command-line capture tool
//!
//! Probes the power interfaces on this host, or brackets a fixed-length
//! capture and prints the resulting record as JSON.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use power_profiling::{
    AmdCpuConfig, AmdCpuSource, AmdGpuConfig, AmdGpuSource, CaptureRecord, IpmiConfig, IpmiRemote,
    IpmiSource, Monitor, MonitorConfig, NvidiaSmiConfig, NvidiaSmiSource, PowerDomain,
    PowerSource, RacadmConfig, RacadmSource, RaplConfig, RaplSource, RedfishConfig,
    RedfishSource, DEFAULT_INTERVAL_MS, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "power_profiling")]
#[command(about = "Concurrent CPU, GPU and chassis power capture")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Austin Couch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    backends: BackendArgs,

    /// Sampling interval in milliseconds
    #[arg(short, long, default_value_t = DEFAULT_INTERVAL_MS)]
    interval: u64,

    /// Read attempts per tick
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Pause between failed read attempts in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_DELAY_MS)]
    retry_delay: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Report which power interfaces are usable on this host
    Probe,

    /// Capture power for a fixed duration and print the record as JSON
    Capture(CaptureArgs),
}

#[derive(Args)]
struct CaptureArgs {
    /// Capture length in seconds
    #[arg(long)]
    duration: f64,

    /// Write the record here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct BackendArgs {
    /// CPU power interface
    #[arg(long, value_enum, default_value_t = CpuBackend::Auto)]
    cpu: CpuBackend,

    /// GPU power interface
    #[arg(long, value_enum, default_value_t = GpuBackend::Auto)]
    gpu: GpuBackend,

    /// Chassis power interface
    #[arg(long, value_enum, default_value_t = SystemBackend::None)]
    system: SystemBackend,

    /// GPU indices to sum (default: all detected)
    #[arg(long, value_delimiter = ',')]
    gpu_ids: Option<Vec<u32>>,

    /// RAPL zone, e.g. package-0 or package-0-dram
    #[arg(long)]
    rapl_domain: Option<String>,

    /// BMC address for ipmi (remote) and redfish
    #[arg(long, env = "POWER_BMC_HOST")]
    bmc_host: Option<String>,

    /// BMC user
    #[arg(long, env = "POWER_BMC_USER")]
    bmc_user: Option<String>,

    /// BMC password
    #[arg(long, env = "POWER_BMC_PASSWORD", hide_env_values = true)]
    bmc_password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CpuBackend {
    /// RAPL, then AMD hwmon
    Auto,
    Rapl,
    Amd,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GpuBackend {
    /// nvidia-smi, then AMD hwmon
    Auto,
    NvidiaSmi,
    #[cfg(feature = "nvml")]
    Nvml,
    Amd,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SystemBackend {
    Ipmi,
    Redfish,
    Racadm,
    None,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    init_logging(&cli)?;

    match &cli.command {
        Commands::Probe => probe_command(&cli).await,
        Commands::Capture(args) => capture_command(&cli, args).await,
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let level = if cli.debug {
        Level::DEBUG
    } else if cli.verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();

    // logs go to stderr so a JSON record on stdout stays parseable
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(log_filter(level, &directives))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}

/// `RUST_LOG` directives refine the verbosity flags instead of replacing them.
fn log_filter(level: Level, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .parse_lossy(directives)
}

type BuiltSource = (PowerDomain, anyhow::Result<Box<dyn PowerSource>>);

async fn probe_command(cli: &Cli) -> anyhow::Result<()> {
    println!("Power Profiling v{}", env!("CARGO_PKG_VERSION"));
    println!();

    for (domain, source) in build_sources(&cli.backends).await {
        match source {
            Ok(source) => {
                println!("  {:<7} {} ✓", domain.to_string(), source.name());
                if let Some(kind) = source.metadata().get("monitor_type") {
                    println!("          monitor_type: {}", kind);
                }
            }
            Err(e) => println!("  {:<7} unavailable: {:#}", domain.to_string(), e),
        }
    }

    Ok(())
}

async fn capture_command(cli: &Cli, args: &CaptureArgs) -> anyhow::Result<()> {
    if !(args.duration.is_finite() && args.duration > 0.0) {
        anyhow::bail!("--duration must be a positive number of seconds");
    }

    let config = MonitorConfig::new(cli.interval)
        .with_max_retries(cli.max_retries)
        .with_retry_delay_ms(cli.retry_delay);

    let mut monitors = Vec::new();
    for (domain, source) in build_sources(&cli.backends).await {
        match source {
            Ok(source) => monitors.push(Monitor::from_boxed(source, config.clone())?),
            Err(e) => warn!("Skipping {} power: {:#}", domain, e),
        }
    }
    if monitors.is_empty() {
        anyhow::bail!("no power interface is available on this host");
    }

    let mut record = CaptureRecord::new();
    for monitor in &mut monitors {
        monitor.start().await;
    }
    info!(
        "Capturing {} domain(s) for {:.1}s at {}ms",
        monitors.len(),
        args.duration,
        cli.interval
    );

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(args.duration)) => {}
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, stopping capture early"),
    }

    for monitor in &mut monitors {
        let readings = monitor.stop().await;
        let stats = monitor.statistics();
        info!(
            "{}: {} readings, mean {:.1}W, {:.1}J",
            monitor.name(),
            readings.len(),
            stats.mean_watts,
            stats.total_energy_joules
        );
        record.set_domain(monitor.domain(), readings);
    }
    record.finish();

    let json = serde_json::to_string_pretty(&record)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("writing capture record to {}", path.display()))?;
            info!("Capture record written to {}", path.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

async fn build_sources(args: &BackendArgs) -> Vec<BuiltSource> {
    let mut sources = Vec::new();
    if let Some(cpu) = build_cpu(args) {
        sources.push((PowerDomain::Cpu, cpu));
    }
    if let Some(gpu) = build_gpu(args).await {
        sources.push((PowerDomain::Gpu, gpu));
    }
    if let Some(system) = build_system(args).await {
        sources.push((PowerDomain::System, system));
    }
    sources
}

fn boxed<S: PowerSource>(source: power_profiling::Result<S>) -> anyhow::Result<Box<dyn PowerSource>> {
    Ok(Box::new(source?))
}

fn build_cpu(args: &BackendArgs) -> Option<anyhow::Result<Box<dyn PowerSource>>> {
    let rapl = || {
        let mut config = RaplConfig::default();
        if let Some(domain) = &args.rapl_domain {
            config = config.with_domain(domain.clone());
        }
        boxed(RaplSource::new(config))
    };
    let amd = || boxed(AmdCpuSource::new(AmdCpuConfig::default()));

    match args.cpu {
        CpuBackend::None => None,
        CpuBackend::Rapl => Some(rapl()),
        CpuBackend::Amd => Some(amd()),
        CpuBackend::Auto => Some(rapl().or_else(|_| amd())),
    }
}

async fn build_gpu(args: &BackendArgs) -> Option<anyhow::Result<Box<dyn PowerSource>>> {
    let nvidia_config = || {
        let config = NvidiaSmiConfig::default();
        match &args.gpu_ids {
            Some(ids) => config.with_gpu_ids(ids.iter().copied()),
            None => config,
        }
    };
    let amd = || {
        let config = AmdGpuConfig::default();
        let config = match &args.gpu_ids {
            Some(ids) => config.with_gpu_ids(ids.iter().copied()),
            None => config,
        };
        boxed(AmdGpuSource::new(config))
    };

    match args.gpu {
        GpuBackend::None => None,
        GpuBackend::NvidiaSmi => Some(boxed(NvidiaSmiSource::new(nvidia_config()).await)),
        #[cfg(feature = "nvml")]
        GpuBackend::Nvml => {
            let config = power_profiling::NvmlConfig::default();
            let config = match &args.gpu_ids {
                Some(ids) => config.with_gpu_ids(ids.iter().copied()),
                None => config,
            };
            Some(boxed(power_profiling::NvmlSource::new(config)))
        }
        GpuBackend::Amd => Some(amd()),
        GpuBackend::Auto => match boxed(NvidiaSmiSource::new(nvidia_config()).await) {
            Ok(source) => Some(Ok(source)),
            Err(_) => Some(amd()),
        },
    }
}

async fn build_system(args: &BackendArgs) -> Option<anyhow::Result<Box<dyn PowerSource>>> {
    let credentials = || -> anyhow::Result<(String, String, String)> {
        let host = args.bmc_host.clone().context("--bmc-host is required")?;
        let user = args.bmc_user.clone().context("--bmc-user is required")?;
        let password = args.bmc_password.clone().context("--bmc-password is required")?;
        Ok((host, user, password))
    };

    let source = match args.system {
        SystemBackend::None => return None,
        SystemBackend::Racadm => boxed(RacadmSource::new(RacadmConfig::default()).await),
        SystemBackend::Ipmi => {
            let mut config = IpmiConfig::default();
            // without a host, talk to the local BMC
            if args.bmc_host.is_some() {
                match credentials() {
                    Ok((host, user, password)) => {
                        config = config.with_remote(IpmiRemote::new(host, user, password));
                    }
                    Err(e) => return Some(Err(e)),
                }
            }
            boxed(IpmiSource::new(config).await)
        }
        SystemBackend::Redfish => match credentials() {
            Ok((host, user, password)) => {
                boxed(RedfishSource::new(RedfishConfig::new(host, user, password)).await)
            }
            Err(e) => Err(e),
        },
    };
    Some(source)
}
