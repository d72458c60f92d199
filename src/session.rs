//! End-to-end measurement session.
//!
//! A session strings the stages together the way an unattended measurement
//! runs: launch the server (if configured), wait for it to be ready, acquire,
//! write the spectrum CSV, predict, upload. The server process is shut down at
//! the end whether or not the measurement succeeded.
//!
//! Failure handling follows the stage that failed. Readiness or acquisition
//! failures end the session with an error and nothing downstream runs. A
//! calibration failure only loses the prediction. Upload failures are logged
//! and reflected in the outcome.

use crate::acquisition::{AcquisitionReport, Orchestrator};
use crate::calibration::{self, CalibrationTable};
use crate::config::Settings;
use crate::error::{AppResult, SpectroError};
use crate::process::InstrumentProcess;
use crate::readiness;
use crate::spectrum::{default_csv_name, Spectrum};
use chrono::Local;
use std::future::Future;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// What a completed session produced.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// Acquisition result, including the spectrum.
    pub report: AcquisitionReport,
    /// Where the spectrum CSV was written; `None` for an empty spectrum.
    pub csv_path: Option<PathBuf>,
    /// Calibrated prediction, if a table is configured and prediction worked.
    pub prediction: Option<f64>,
    /// Backend id of the uploaded spectrum.
    pub spectrum_id: Option<String>,
    /// Whether the prediction reached the backend.
    pub prediction_uploaded: bool,
}

/// Runs measurement sessions from a validated [`Settings`].
pub struct Session {
    settings: Settings,
}

impl Session {
    /// Create a session from validated settings.
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Settings the session runs with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run a full session, managing the server process if one is configured.
    ///
    /// # Errors
    /// Returns the error of the stage that ended the session: process launch,
    /// readiness, configuration or acquisition.
    pub async fn run(&self) -> AppResult<SessionOutcome> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops measuring as soon as `cancel`
    /// completes.
    ///
    /// A launched server is still shut down gracefully on cancellation:
    /// terminate request, grace period, then kill.
    ///
    /// # Errors
    /// Returns [`SpectroError::Cancelled`] if `cancel` fired first, otherwise
    /// the error of the stage that ended the session.
    pub async fn run_until<F>(&self, cancel: F) -> AppResult<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        let process = match &self.settings.process.executable {
            Some(executable) => Some(InstrumentProcess::spawn(
                executable,
                &self.settings.process.args,
            )?),
            None => None,
        };

        let result = tokio::select! {
            result = self.measure() => result,
            _ = cancel => {
                warn!("Session cancelled, stopping");
                Err(SpectroError::Cancelled)
            }
        };

        if let Some(process) = process {
            process.shutdown(self.settings.shutdown_grace()).await;
        }
        result
    }

    async fn measure(&self) -> AppResult<SessionOutcome> {
        if self.settings.readiness.enabled {
            self.require_ready().await?;
        }

        let report = self.acquire().await?;
        if report.saturated {
            warn!("Spectrum was taken with a saturated detector");
        }

        if report.spectrum.is_empty() {
            warn!("Empty spectrum, skipping save, prediction and upload");
            return Ok(SessionOutcome {
                report,
                csv_path: None,
                prediction: None,
                spectrum_id: None,
                prediction_uploaded: false,
            });
        }

        let csv_path = self.save_spectrum(&report.spectrum)?;

        let prediction = match self.predict(&report.spectrum) {
            Ok(prediction) => prediction,
            Err(e) => {
                error!("Prediction failed: {}", e);
                None
            }
        };
        if let Some(value) = prediction {
            info!("Predicted value: {:.4}", value);
        }

        let (spectrum_id, prediction_uploaded) = self.upload(&report, prediction).await;

        Ok(SessionOutcome {
            report,
            csv_path: Some(csv_path),
            prediction,
            spectrum_id,
            prediction_uploaded,
        })
    }

    /// Probe the server until it is ready.
    pub async fn wait_ready(&self) -> bool {
        readiness::wait_until_ready(
            &self.settings.address(),
            self.settings.readiness_max_wait(),
            self.settings.readiness_settings(),
        )
        .await
    }

    async fn require_ready(&self) -> AppResult<()> {
        if self.wait_ready().await {
            Ok(())
        } else {
            Err(SpectroError::NotReady {
                address: self.settings.address(),
                waited: self.settings.readiness_max_wait(),
            })
        }
    }

    /// Connect and run one acquisition with the configured parameters.
    ///
    /// # Errors
    /// Returns a configuration, transport or protocol error.
    pub async fn acquire(&self) -> AppResult<AcquisitionReport> {
        let config = self.settings.acquisition_config()?;
        let orchestrator = Orchestrator::connect(
            &self.settings.address(),
            self.settings.connect_timeout(),
            self.settings.orchestrator_settings(),
        )
        .await?;
        orchestrator.run(config).await
    }

    /// Write `spectrum` to a timestamped CSV in the output directory.
    ///
    /// # Errors
    /// Returns an I/O or CSV error if the file cannot be written.
    pub fn save_spectrum(&self, spectrum: &Spectrum) -> AppResult<PathBuf> {
        let dir = &self.settings.application.output_dir;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(default_csv_name(&Local::now()));
        spectrum.write_csv(&path)?;
        Ok(path)
    }

    /// Predict from `spectrum` with the configured calibration table.
    ///
    /// Returns `Ok(None)` when no table is configured.
    ///
    /// # Errors
    /// Returns a calibration error if the table cannot be loaded or the
    /// spectrum is empty.
    pub fn predict(&self, spectrum: &Spectrum) -> AppResult<Option<f64>> {
        let Some(path) = &self.settings.calibration.path else {
            info!("No calibration table configured, skipping prediction");
            return Ok(None);
        };
        let table = CalibrationTable::load(path, self.settings.calibration.output_scale)?;
        Ok(Some(calibration::predict(spectrum, &table)?))
    }

    #[cfg(feature = "upload")]
    async fn upload(
        &self,
        report: &AcquisitionReport,
        prediction: Option<f64>,
    ) -> (Option<String>, bool) {
        use crate::upload::{device_tag, UploadClient};

        let upload = &self.settings.upload;
        let client = match UploadClient::from_settings(upload) {
            Ok(Some(client)) => client,
            Ok(None) => return (None, false),
            Err(e) => {
                error!("{}", e);
                return (None, false);
            }
        };

        let device_id = device_tag(&upload.device_prefix, &report.config, &upload.message);
        let Some(spectrum_id) = client.upload_spectrum(&report.spectrum, &device_id).await else {
            return (None, false);
        };
        let uploaded = match prediction {
            Some(value) => client.upload_prediction(value, &spectrum_id, &device_id).await,
            None => false,
        };
        (Some(spectrum_id), uploaded)
    }

    #[cfg(not(feature = "upload"))]
    async fn upload(
        &self,
        _report: &AcquisitionReport,
        _prediction: Option<f64>,
    ) -> (Option<String>, bool) {
        if self.settings.upload.is_enabled() {
            warn!("Upload endpoints configured but upload support is not compiled in");
        }
        (None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CalibrationError;

    fn session_in(dir: &std::path::Path) -> Session {
        let mut settings = Settings::default();
        settings.application.output_dir = dir.join("spectra");
        Session::new(settings)
    }

    fn spectrum() -> Spectrum {
        vec![(1000.0, 5.0), (2000.0, 3.0)].into_iter().collect()
    }

    #[test]
    fn test_save_spectrum_creates_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path());

        let path = session.save_spectrum(&spectrum()).unwrap();
        assert!(path.starts_with(dir.path().join("spectra")));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("spectrum_") && name.ends_with(".csv"));
        assert_eq!(Spectrum::read_csv(&path).unwrap(), spectrum());
    }

    #[test]
    fn test_predict_without_table() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(session_in(dir.path()).predict(&spectrum()).unwrap(), None);
    }

    #[test]
    fn test_predict_with_table() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("calibration_coeffs.csv");
        std::fs::write(&table, "1000,2.0,40.0\n2000,-1.0,\n").unwrap();

        let mut session = session_in(dir.path());
        session.settings.calibration.path = Some(table);
        let value = session.predict(&spectrum()).unwrap().unwrap();
        // SNV [1, -1]; (2 + 1 + 40) * 0.1
        assert!((value - 4.3).abs() < 1e-9);
    }

    #[test]
    fn test_predict_missing_table_is_calibration_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = session_in(dir.path());
        session.settings.calibration.path = Some(dir.path().join("missing.csv"));
        assert!(matches!(
            session.predict(&spectrum()),
            Err(SpectroError::Calibration(CalibrationError::Csv(_)))
        ));
    }

    #[tokio::test]
    async fn test_run_fails_when_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = session_in(dir.path());
        session.settings.instrument.port = port;
        session.settings.readiness.max_wait_ms = 50;
        session.settings.readiness.poll_interval_ms = 10;

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, SpectroError::NotReady { .. }));
        assert!(!dir.path().join("spectra").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_stops_launched_process_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("stopped");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = session_in(dir.path());
        session.settings.instrument.port = port;
        session.settings.readiness.max_wait_ms = 200;
        session.settings.readiness.poll_interval_ms = 10;
        session.settings.process.executable = Some(PathBuf::from("/bin/sh"));
        session.settings.process.args = vec![
            "-c".to_string(),
            format!(
                "trap 'touch {}; exit 0' TERM; while true; do sleep 0.05; done",
                marker.display()
            ),
        ];
        session.settings.process.shutdown_grace_ms = 2_000;

        assert!(session.run().await.is_err());
        assert!(marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_run_terminates_process_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("terminated");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session = session_in(dir.path());
        session.settings.instrument.port = port;
        session.settings.readiness.max_wait_ms = 30_000;
        session.settings.readiness.poll_interval_ms = 20;
        session.settings.process.executable = Some(PathBuf::from("/bin/sh"));
        session.settings.process.args = vec![
            "-c".to_string(),
            format!(
                "trap 'touch {}; exit 0' TERM; while true; do sleep 0.05; done",
                marker.display()
            ),
        ];
        session.settings.process.shutdown_grace_ms = 2_000;

        let started = std::time::Instant::now();
        let err = session
            .run_until(tokio::time::sleep(std::time::Duration::from_millis(400)))
            .await
            .unwrap_err();

        assert!(matches!(err, SpectroError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        // The TERM trap only runs if the server was asked to stop before any kill.
        assert!(marker.exists());
    }
}
