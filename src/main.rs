//! Command-line entry point for spectro-daq.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use spectro_daq::acquisition::{Apodization, Gain};
use spectro_daq::calibration::{self, CalibrationTable};
use spectro_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use spectro_daq::error::SpectroError;
use spectro_daq::logging;
use spectro_daq::session::Session;
use spectro_daq::spectrum::Spectrum;
use std::path::PathBuf;
use tracing::{info, warn};

/// Acquire spectra from an FTIR spectrometer server and predict from them.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch (if configured), wait, acquire, save, predict and upload
    Run(AcquireArgs),
    /// Acquire one spectrum and save it as CSV
    Acquire(AcquireArgs),
    /// Wait until the server reports initialization complete
    WaitReady,
    /// Predict from a saved spectrum CSV
    Predict {
        /// Spectrum CSV with a Wavelength,Intensity header
        spectrum: PathBuf,
        /// Calibration table; defaults to the configured one
        #[arg(long)]
        calibration: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct AcquireArgs {
    /// Detector gain (Low, Medium, High, Extreme)
    #[arg(long)]
    gain: Option<Gain>,
    /// Apodization function, e.g. NortonBeerStrong
    #[arg(long)]
    apodization: Option<Apodization>,
    /// Number of spectra to average
    #[arg(long)]
    averages: Option<u32>,
    /// Also average interferograms
    #[arg(long)]
    ifgm: bool,
    /// Operator note added to the device tag on upload
    #[arg(long)]
    message: Option<String>,
}

impl AcquireArgs {
    fn apply(&self, settings: &mut Settings) {
        if let Some(gain) = self.gain {
            settings.acquisition.gain = gain;
        }
        if let Some(apodization) = self.apodization {
            settings.acquisition.apodization = apodization;
        }
        if let Some(averages) = self.averages {
            settings.acquisition.average_count = averages;
        }
        if self.ifgm {
            settings.acquisition.interferogram_averaging = true;
        }
        if let Some(message) = &self.message {
            settings.upload.message = message.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
    }
    if let Commands::Run(args) | Commands::Acquire(args) = &cli.command {
        args.apply(&mut settings);
    }
    settings.validate()?;

    logging::init(&settings.application.log_level, settings.log_format());
    info!("{} v{}", settings.application.name, env!("CARGO_PKG_VERSION"));

    let session = Session::new(settings);
    match cli.command {
        // The session owns cancellation so a launched server is stopped gracefully.
        Commands::Run(_) => run(&session).await,
        command => tokio::select! {
            result = execute(&session, command) => result,
            _ = tokio::signal::ctrl_c() => bail!("Interrupted"),
        },
    }
}

async fn run(session: &Session) -> Result<()> {
    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let outcome = match session.run_until(interrupted).await {
        Err(SpectroError::Cancelled) => bail!("Interrupted"),
        result => result?,
    };

    println!("Spectrum points: {}", outcome.report.spectrum.len());
    if let Some(saturation) = outcome.report.saturation {
        println!(
            "Saturation: {:.3}{}",
            saturation,
            if outcome.report.saturated { " (saturated)" } else { "" }
        );
    }
    if let Some(path) = &outcome.csv_path {
        println!("Saved: {}", path.display());
    }
    match outcome.prediction {
        Some(value) => println!("Prediction: {:.4}", value),
        None => println!("Prediction: n/a"),
    }
    if let Some(id) = &outcome.spectrum_id {
        println!(
            "Uploaded spectrum {} (prediction uploaded: {})",
            id, outcome.prediction_uploaded
        );
    }
    Ok(())
}

async fn execute(session: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Run(_) => run(session).await?,
        Commands::Acquire(_) => {
            let report = session.acquire().await?;
            if report.spectrum.is_empty() {
                bail!("Acquisition returned no spectrum data");
            }
            let path = session.save_spectrum(&report.spectrum)?;
            println!("Saved {} points to {}", report.spectrum.len(), path.display());
        }
        Commands::WaitReady => {
            if !session.wait_ready().await {
                bail!("Spectrometer at {} is not ready", session.settings().address());
            }
            println!("Spectrometer at {} is ready", session.settings().address());
        }
        Commands::Predict {
            spectrum,
            calibration,
        } => {
            let data = Spectrum::read_csv(&spectrum)
                .with_context(|| format!("Failed to read {}", spectrum.display()))?;
            let settings = session.settings();
            let Some(table_path) = calibration.or_else(|| settings.calibration.path.clone()) else {
                bail!("No calibration table given or configured");
            };
            let table = CalibrationTable::load(&table_path, settings.calibration.output_scale)?;
            let value = calibration::predict(&data, &table)?;
            println!("Prediction: {:.4}", value);
        }
    }
    Ok(())
}
