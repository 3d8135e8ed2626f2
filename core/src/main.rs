//! POLELOC: pole-based particle filter localization on synthetic scenarios.
//!
//! The `sim` command generates a scenario (ground truth trajectory, pole map, noisy odometry and
//! pole detections), runs the particle filter over it and reports position and heading errors
//! against ground truth. The scenario and filter parameters come from a configuration file
//! (TOML/JSON/YAML) and can be overridden with flags. The `config` command writes the default
//! configuration as a starting point.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use poleloc::config::{ConfigFile, ScenarioConfig};
use poleloc::particle::ParticleAveragingStrategy;
use poleloc::sim::{ErrorStatistics, Scenario, run_localization};

/// Command line arguments
#[derive(Parser)]
#[command(
    author,
    version,
    about = "Pole-based particle filter localization on synthetic scenarios."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "sim",
        about = "Run the particle filter on a synthetic scenario",
        long_about = "Generate a synthetic scenario, localize against its pole map with the particle filter and report the error against ground truth. Flags override values read from --config."
    )]
    Sim(SimArgs),
    #[command(
        name = "config",
        about = "Write the default scenario configuration to a file",
        long_about = "Write the default scenario configuration, including the nested filter configuration, to a file. The format (.toml, .json, .yaml, .yml) is chosen from the extension."
    )]
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct SimArgs {
    /// Scenario configuration file (TOML/JSON/YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Number of time steps
    #[arg(long)]
    steps: Option<usize>,
    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,
    /// Random seed of the filter
    #[arg(long)]
    seed: Option<u64>,
    /// Pose estimator
    #[arg(long, value_enum)]
    strategy: Option<ParticleAveragingStrategy>,
    /// Write the per-step estimates to this CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Destination file
    #[arg(short, long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_deref())?;

    match cli.command {
        Command::Sim(args) => run_sim(&args),
        Command::Config(args) => {
            ScenarioConfig::default()
                .to_file(&args.output)
                .with_context(|| format!("writing configuration to {}", args.output.display()))?;
            info!("wrote default configuration to {}", args.output.display());
            Ok(())
        }
    }
}

fn run_sim(args: &SimArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ScenarioConfig::from_file(path)
            .with_context(|| format!("reading configuration from {}", path.display()))?,
        None => ScenarioConfig::default(),
    };
    if let Some(steps) = args.steps {
        config.num_steps = steps;
    }
    if let Some(particles) = args.particles {
        config.filter.num_particles = particles;
    }
    if let Some(seed) = args.seed {
        config.filter.seed = seed;
    }
    if let Some(strategy) = args.strategy {
        config.filter.estimation_strategy = strategy;
    }

    let scenario = Scenario::generate(&config).context("generating scenario")?;
    let mut filter = scenario
        .particle_filter(&config)
        .context("initializing particle filter")?;
    info!(
        "localizing against {} poles (d_max {:.2} m) with the '{}' estimator",
        filter.map().len(),
        filter.likelihood().max_distance(),
        filter.estimation_strategy()
    );
    let result = run_localization(&mut filter, &scenario.steps);

    let stats = ErrorStatistics::compute(&result.estimates, &scenario.truth);
    let dead_reckoning = ErrorStatistics::compute(&scenario.dead_reckoning(), &scenario.truth);
    info!("resampled on {} of {} steps", result.resample_count, scenario.steps.len());
    info!("particle filter: {}", stats);
    info!("dead reckoning: {}", dead_reckoning);
    if stats.mean_position_m > dead_reckoning.mean_position_m {
        warn!("particle filter did worse than dead reckoning");
    }

    if let Some(output) = &args.output {
        result
            .to_csv(output)
            .with_context(|| format!("writing estimates to {}", output.display()))?;
        info!("wrote {} estimates to {}", result.estimates.len(), output.display());
    }
    Ok(())
}

/// Initialize the logger with the specified configuration.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
fn init_logger(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init()?;
    Ok(())
}
