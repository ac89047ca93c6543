//! Operator tool for far-field antenna measurements.
//!
//! Subcommands:
//! - `models`: List registered positioner models
//! - `jog`: Move or zero a positioner
//! - `scan`: Run a pattern measurement and save it as MDIF
//! - `calibrate`: Build a calibration from a reference-antenna scan
//! - `apply-cal`: Apply a calibration to a results file
//! - `summary`: Print the axes and polarizations in a results file

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use hardware::analyzer::SimulatedAnalyzer;
use hardware::positioner::{
    Axis, ConnectOptions, Positioner, PositionerRegistry, SimulatedPositioner, TurntableConfig,
    SIMULATED_MANUFACTURER, SIMULATED_MODEL,
};
use indicatif::{ProgressBar, ProgressStyle};
use shared::calibration::Calibration;
use shared::gain_file::load_gain;
use shared::network::Frequency;
use shared::range_arg::AngleSweep;
use shared::result_set::ResultSet;
use shared::settings::SettingsStore;
use test_bench::experiment::{
    ExperimentConfig, ExperimentEvent, ExperimentRunner, FinishReason, Polarization,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Far-field antenna measurement tool
#[derive(Parser, Debug)]
#[command(name = "farfield")]
#[command(about = "Drive a positioner and network analyzer through far-field scans")]
#[command(version)]
struct Args {
    /// Settings file holding the last known positioner pose
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Turntable model description (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Which positioner to talk to.
#[derive(clap::Args, Debug, Clone)]
struct PositionerArgs {
    #[arg(long, default_value = SIMULATED_MANUFACTURER)]
    manufacturer: String,

    #[arg(long, default_value = SIMULATED_MODEL)]
    model: String,

    /// Serial port of the positioner controller
    #[arg(long, default_value = "")]
    port: String,

    /// Duration of each simulated move in milliseconds
    #[arg(long, default_value = "0")]
    sim_move_ms: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List registered positioner models
    Models,

    /// Move or zero a positioner
    Jog {
        #[command(flatten)]
        positioner: PositionerArgs,

        /// Axis to move (phi or theta)
        #[arg(short, long, default_value = "phi")]
        axis: String,

        /// Absolute angle in degrees
        #[arg(long, allow_hyphen_values = true)]
        to: Option<f64>,

        /// Relative move in degrees
        #[arg(long, allow_hyphen_values = true)]
        by: Option<f64>,

        /// Declare the current pose to be (0, 0)
        #[arg(long)]
        zero: bool,
    },

    /// Run a pattern measurement
    Scan {
        #[command(flatten)]
        positioner: PositionerArgs,

        /// Phi angles: start:stop:step, a comma list, or one value
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        phis: AngleSweep,

        /// Theta angles: start:stop:step, a comma list, or one value
        #[arg(long, default_value = "0", allow_hyphen_values = true)]
        thetas: AngleSweep,

        /// Polarization as LABEL:A:B, repeatable
        #[arg(short, long = "pol", default_value = "V:2:1")]
        polarizations: Vec<Polarization>,

        /// Sweep start in GHz
        #[arg(long, default_value = "8.0")]
        start_ghz: f64,

        /// Sweep stop in GHz
        #[arg(long, default_value = "12.0")]
        stop_ghz: f64,

        /// Sweep points
        #[arg(long, default_value = "201")]
        points: usize,

        /// Seconds to wait for each move before carrying on
        #[arg(long)]
        move_timeout: Option<f64>,

        /// Calibration applied before saving
        #[arg(long)]
        calibration: Option<PathBuf>,

        /// Output MDIF file
        #[arg(short, long, default_value = "scan.mdf")]
        output: PathBuf,
    },

    /// Build a calibration from a reference-antenna scan
    Calibrate {
        /// Raw scan of the reference antenna
        #[arg(long)]
        measured: PathBuf,

        /// Reference gain CSV (frequency_ghz, gain_db)
        #[arg(long)]
        gain: PathBuf,

        /// Free-form notes stored with the calibration
        #[arg(long, default_value = "")]
        notes: String,

        #[arg(short, long, default_value = "calibration.cal")]
        output: PathBuf,
    },

    /// Apply a calibration to a results file
    ApplyCal {
        #[arg(long)]
        results: PathBuf,

        #[arg(long)]
        calibration: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        /// Undo a previously applied calibration instead
        #[arg(long)]
        revert: bool,
    },

    /// Print what a results file contains
    Summary {
        results: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Models => {
            let registry = PositionerRegistry::with_builtin_plugins();
            for (manufacturer, models) in registry.available_models() {
                println!("{manufacturer}");
                for model in models {
                    println!("  {model}");
                }
            }
            Ok(())
        }
        Command::Jog {
            positioner,
            axis,
            to,
            by,
            zero,
        } => {
            let options = connect_options(args.settings.as_deref(), args.config.as_deref())?;
            let mut p = connect(&positioner, &options)?;
            let axis = parse_axis(&axis)?;
            run_jog(p.as_mut(), axis, to, by, zero)
        }
        Command::Scan {
            positioner,
            phis,
            thetas,
            polarizations,
            start_ghz,
            stop_ghz,
            points,
            move_timeout,
            calibration,
            output,
        } => {
            let options = connect_options(args.settings.as_deref(), args.config.as_deref())?;
            let mut config =
                ExperimentConfig::new(phis.into_vec(), thetas.into_vec(), polarizations);
            if let Some(secs) = move_timeout {
                config = config.with_move_timeout(Duration::from_secs_f64(secs));
            }
            let frequency = Frequency::linspace(start_ghz * 1e9, stop_ghz * 1e9, points);
            let calibration = calibration
                .map(|path| {
                    Calibration::load(&path)
                        .with_context(|| format!("Failed to load calibration {}", path.display()))
                })
                .transpose()?;
            run_scan(&positioner, &options, config, frequency, calibration, &output).await
        }
        Command::Calibrate {
            measured,
            gain,
            notes,
            output,
        } => {
            let results = ResultSet::load(&measured)
                .with_context(|| format!("Failed to load {}", measured.display()))?;
            let gain = load_gain(&gain)
                .with_context(|| format!("Failed to load gain file {}", gain.display()))?;
            let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
            let notes = if notes.is_empty() {
                format!("Reference scan {} ({stamp})", measured.display())
            } else {
                format!("{notes}\nReference scan {} ({stamp})", measured.display())
            };
            let cal = Calibration::from_reference(&results, &gain, notes)?;
            cal.save(&output)?;
            info!(
                "Saved calibration for {:?} to {}",
                cal.labels().collect::<Vec<_>>(),
                output.display()
            );
            Ok(())
        }
        Command::ApplyCal {
            results,
            calibration,
            output,
            revert,
        } => {
            let set = ResultSet::load(&results)
                .with_context(|| format!("Failed to load {}", results.display()))?;
            let cal = Calibration::load(&calibration)
                .with_context(|| format!("Failed to load {}", calibration.display()))?;
            let corrected = if revert {
                cal.revert(&set)?
            } else {
                cal.apply_to(&set)?
            };
            corrected.save(&output)?;
            info!("Wrote {} networks to {}", corrected.len(), output.display());
            Ok(())
        }
        Command::Summary { results } => {
            let set = ResultSet::load(&results)
                .with_context(|| format!("Failed to load {}", results.display()))?;
            print_summary(&set);
            Ok(())
        }
    }
}

fn parse_axis(s: &str) -> Result<Axis> {
    match s.to_ascii_lowercase().as_str() {
        "phi" => Ok(Axis::Phi),
        "theta" => Ok(Axis::Theta),
        other => bail!("Unknown axis '{other}', expected phi or theta"),
    }
}

fn connect_options(settings: Option<&Path>, config: Option<&Path>) -> Result<ConnectOptions> {
    let store = match settings {
        Some(path) => SettingsStore::with_path(path.to_path_buf()),
        None => SettingsStore::new(),
    }
    .context("Failed to open settings")?;
    let mut options = ConnectOptions::new(store);
    if let Some(path) = config {
        let turntable = TurntableConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load turntable config {}", path.display()))?;
        options.turntable_config = Some(turntable);
    }
    Ok(options)
}

fn connect(args: &PositionerArgs, options: &ConnectOptions) -> Result<Box<dyn Positioner>> {
    let mut options = options.clone();
    options.simulated_move_duration = Duration::from_millis(args.sim_move_ms);
    let registry = PositionerRegistry::with_builtin_plugins();
    let positioner = registry
        .connect(&args.manufacturer, &args.model, &args.port, &options)
        .with_context(|| format!("Failed to connect {}/{}", args.manufacturer, args.model))?;
    Ok(positioner)
}

fn run_jog(
    p: &mut dyn Positioner,
    axis: Axis,
    to: Option<f64>,
    by: Option<f64>,
    zero: bool,
) -> Result<()> {
    match (zero, to, by) {
        (true, None, None) => p.zero_all()?,
        (false, Some(angle), None) => p.move_absolute(axis, angle)?,
        (false, None, Some(delta)) => p.move_relative(axis, delta)?,
        (false, None, None) => {}
        _ => bail!("Use only one of --to, --by and --zero"),
    }
    println!("phi = {:.4} deg, theta = {:.4} deg", p.phi(), p.theta());
    Ok(())
}

async fn run_scan(
    positioner: &PositionerArgs,
    options: &ConnectOptions,
    config: ExperimentConfig,
    frequency: Frequency,
    calibration: Option<Calibration>,
    output: &Path,
) -> Result<()> {
    let total = config.total_points();

    let handle = if positioner.manufacturer == SIMULATED_MANUFACTURER
        && positioner.model == SIMULATED_MODEL
    {
        let p = SimulatedPositioner::new(options.settings.clone())
            .with_move_duration(Duration::from_millis(positioner.sim_move_ms));
        let analyzer = SimulatedAnalyzer::new(frequency).with_pose(p.pose());
        let p: Box<dyn Positioner> = Box::new(p);
        ExperimentRunner::spawn(p, analyzer, config)?
    } else {
        let p = connect(positioner, options)?;
        ExperimentRunner::spawn(p, SimulatedAnalyzer::new(frequency), config)?
    };

    let progress = ProgressBar::new(total as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("█▉▊▋▌▍▎▏ "),
    );
    progress.set_message("Scanning");

    let events = handle.events().clone();
    let bar = progress.clone();
    let mut watcher = tokio::task::spawn_blocking(move || {
        for event in events.iter() {
            match event {
                ExperimentEvent::TotalIterCountUpdated(n) => bar.set_position(n as u64),
                ExperimentEvent::TimeEstUpdated(eta) => {
                    bar.set_message(format!("Scanning, ~{}s left", eta.as_secs()))
                }
                ExperimentEvent::Finished(reason) => return Some(reason),
                _ => {}
            }
        }
        None
    });

    let finished = tokio::select! {
        result = &mut watcher => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, cancelling scan...");
            handle.cancel(true);
            watcher.await?
        }
    };
    progress.finish_and_clear();

    let (result, _) = tokio::task::spawn_blocking(move || handle.join()).await?;
    let outcome = result.context("Scan failed")?;
    match &finished {
        Some(FinishReason::Completed) => info!("Scan complete"),
        Some(reason) => warn!("Scan ended early: {reason:?}"),
        None => warn!("Scan ended without a finish event"),
    }
    if outcome.results.is_empty() {
        warn!("No data acquired, nothing written");
        return Ok(());
    }

    let results = match calibration {
        Some(cal) => cal.apply_to(&outcome.results)?,
        None => outcome.results,
    };
    results
        .save(output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!("Saved {} networks to {}", results.len(), output.display());
    Ok(())
}

fn print_summary(set: &ResultSet) {
    println!("networks:      {}", set.len());
    if let Some(freq) = set.frequency() {
        println!(
            "frequency:     {} points, {:.4} - {:.4} GHz",
            freq.len(),
            freq.start().unwrap_or_default() / 1e9,
            freq.stop().unwrap_or_default() / 1e9
        );
    }
    println!("azimuths:      {:?}", set.azimuths());
    println!("elevations:    {:?}", set.elevations());
    println!("polarizations: {:?}", set.polarizations());
    let calibrated = set.iter().filter(|n| n.is_calibrated()).count();
    println!("calibrated:    {calibrated}/{}", set.len());
}
