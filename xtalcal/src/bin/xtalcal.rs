// Station tool: calibrates the crystal trim of a module running RailTest
// against a tinySA and prints CTUNE=<value>, or CTUNE=-1 when it fails.
// Storing the value in the module's NVM is left to the caller.
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{fs::read_to_string, path::Path, path::PathBuf, process::ExitCode, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use xtalcal::{
    channel::{Channel, ChannelOptions},
    config::StationConfig,
    run_calibration,
    sim::SimDut,
    tinysa::TinySa,
    Calibration, CalibrationFailure, Dut,
};

#[derive(Parser)]
///Crystal trim calibration for RailTest modules
struct Args {
    #[command(subcommand)]
    command: Command,
    /// Default log filter, RUST_LOG takes precedence
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run one calibration session
    Run {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// DUT serial port, overrides discovery by VID/PID
        #[arg(long)]
        dut_port: Option<String>,
        /// Analyzer serial port, overrides discovery by VID/PID
        #[arg(long)]
        analyzer_port: Option<String>,
        /// Calibrate a simulated module instead of real hardware
        #[arg(long)]
        simulate: bool,
    },
    /// Validate a station config file and print the resolved settings
    CheckConfig { file: PathBuf },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load(path: &Path) -> Result<StationConfig> {
    let contents =
        read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config = StationConfig::from_toml(&contents)
        .with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn calibrate_hardware(station: &StationConfig) -> Result<Calibration> {
    let mut analyzer = TinySa::open(
        station.analyzer.connector()?,
        station.analyzer.channel_options(),
    )
    .context("opening spectrum analyzer")?;
    let mut channel = Channel::new(station.dut.connector()?, station.dut.channel_options());
    let mut dut = Dut::from_config(&mut channel, &station.dut);
    let result = run_calibration(&mut dut, &mut analyzer, &station.calibration);
    analyzer.close();
    Ok(result?)
}

fn calibrate_simulated(station: &StationConfig) -> Result<Calibration, CalibrationFailure> {
    // Starts 25 steps off, like a fresh module with a default trim
    let sim = SimDut::new(station.calibration.target_hz, 70, 95);
    let mut analyzer = sim.analyzer();
    let options = ChannelOptions {
        settle: Duration::ZERO,
        ..station.dut.channel_options()
    };
    let mut channel = Channel::new(sim.connector(), options);
    let mut dut = Dut::from_config(&mut channel, &station.dut);
    run_calibration(&mut dut, &mut analyzer, &station.calibration)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level);

    match args.command {
        Command::CheckConfig { file } => {
            let config = load(&file)?;
            println!("{:#?}", config);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            config,
            dut_port,
            analyzer_port,
            simulate,
        } => {
            let mut station = match config {
                Some(path) => load(&path)?,
                None => StationConfig::default(),
            };
            if dut_port.is_some() {
                station.dut.port = dut_port;
            }
            if analyzer_port.is_some() {
                station.analyzer.port = analyzer_port;
            }

            let result = if simulate {
                calibrate_simulated(&station).map_err(anyhow::Error::from)
            } else {
                calibrate_hardware(&station)
            };
            match result {
                Ok(cal) => {
                    info!(trials = cal.trials, "calibrated");
                    println!("CTUNE={}", cal.trim);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    error!("{err:#}");
                    println!("CTUNE=-1");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}
