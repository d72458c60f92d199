//! Calibration engine: raw spectrum → scalar prediction.
//!
//! The model is linear on the standard-normal-variate transform of the
//! spectrum, resampled onto the calibration grid:
//!
//! 1. Piecewise-linear interpolation of the raw samples onto the table's
//!    wavelengths, extrapolating linearly past either end of the raw range.
//! 2. SNV: subtract the mean and divide by the population standard deviation.
//!    A flat vector maps to all zeros.
//! 3. Dot product with the coefficients, plus the constant, times the output
//!    scale.
//!
//! ## Calibration file
//!
//! Headerless three-column CSV: `wavelength, coefficient, constant`. Rows
//! without a coefficient are not part of the model; they only provide the
//! constant when no earlier row did.
//!
//! ```text
//! 1000.0,0.125,41.8
//! 1001.0,-0.031,
//! 1002.0,0.007,
//! ```

use crate::error::CalibrationError;
use crate::spectrum::Spectrum;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Output scale applied to the linear model in the current deployment.
///
/// An empirical unit correction rather than a physical constant; it is a
/// configuration value and can be overridden per table.
pub const DEFAULT_OUTPUT_SCALE: f64 = 0.1;

/// Linear calibration model on a fixed wavelength grid.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    wavelengths: Vec<f64>,
    coefficients: Vec<f64>,
    constant: f64,
    output_scale: f64,
}

impl CalibrationTable {
    /// Build a table from parallel wavelength and coefficient vectors.
    ///
    /// # Errors
    /// - [`CalibrationError::EmptyTable`] if there are no coefficients.
    /// - [`CalibrationError::LengthMismatch`] if the vectors differ in length.
    pub fn new(
        wavelengths: Vec<f64>,
        coefficients: Vec<f64>,
        constant: f64,
        output_scale: f64,
    ) -> Result<Self, CalibrationError> {
        if wavelengths.len() != coefficients.len() {
            return Err(CalibrationError::LengthMismatch {
                wavelengths: wavelengths.len(),
                coefficients: coefficients.len(),
            });
        }
        if coefficients.is_empty() {
            return Err(CalibrationError::EmptyTable);
        }
        Ok(Self {
            wavelengths,
            coefficients,
            constant,
            output_scale,
        })
    }

    /// Load a calibration CSV from `path`.
    ///
    /// # Errors
    /// Returns a [`CalibrationError`] if the file cannot be read, a cell is not
    /// numeric, or the table has no coefficients or no constant.
    pub fn load(path: impl AsRef<Path>, output_scale: f64) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(csv::Error::from)?;
        let table = Self::from_reader(file, output_scale)?;
        info!(
            "Loaded calibration table {} ({} wavelengths, constant {})",
            path.display(),
            table.len(),
            table.constant
        );
        Ok(table)
    }

    /// Parse a calibration CSV.
    ///
    /// # Errors
    /// See [`load`](Self::load).
    pub fn from_reader<R: Read>(reader: R, output_scale: f64) -> Result<Self, CalibrationError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut wavelengths = Vec::new();
        let mut coefficients = Vec::new();
        let mut constant = None;

        for record in reader.records() {
            let record = record?;
            let line = record.position().map_or(0, |p| p.line());
            let cell = |idx: usize, name: &str| parse_cell(record.get(idx), line, name);

            let wavelength = cell(0, "wavelength")?;
            let coefficient = cell(1, "coefficient")?;
            if constant.is_none() {
                constant = cell(2, "constant")?;
            }

            match (wavelength, coefficient) {
                (Some(w), Some(c)) => {
                    wavelengths.push(w);
                    coefficients.push(c);
                }
                (None, Some(_)) => {
                    return Err(CalibrationError::Malformed {
                        line,
                        message: "coefficient without a wavelength".to_string(),
                    })
                }
                _ => debug!("Calibration line {} has no coefficient, skipped", line),
            }
        }

        if coefficients.is_empty() {
            return Err(CalibrationError::EmptyTable);
        }
        let constant = constant.ok_or(CalibrationError::MissingConstant)?;
        Self::new(wavelengths, coefficients, constant, output_scale)
    }

    /// Replace the output scale.
    pub fn with_output_scale(mut self, output_scale: f64) -> Self {
        self.output_scale = output_scale;
        self
    }

    /// Calibration grid.
    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    /// Model coefficients, one per grid wavelength.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Intercept of the linear model.
    pub fn constant(&self) -> f64 {
        self.constant
    }

    /// Factor applied to the model output.
    pub fn output_scale(&self) -> f64 {
        self.output_scale
    }

    /// Number of grid points.
    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    /// Always false for a constructed table; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }
}

/// Empty cells and NaN count as missing.
fn parse_cell(raw: Option<&str>, line: u64, name: &str) -> Result<Option<f64>, CalibrationError> {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let value: f64 = raw.parse().map_err(|_| CalibrationError::Malformed {
        line,
        message: format!("{} {:?} is not a number", name, raw),
    })?;
    Ok((!value.is_nan()).then_some(value))
}

/// Resample `spectrum` onto `grid` by piecewise-linear interpolation.
///
/// Samples are ordered by wavelength first. Grid points outside the sampled
/// range are extrapolated from the outermost segment. A single-sample spectrum
/// yields its intensity everywhere; an empty spectrum yields an empty vector.
pub fn interpolate(spectrum: &Spectrum, grid: &[f64]) -> Vec<f64> {
    let mut points = spectrum.points().to_vec();
    if points.is_empty() {
        return Vec::new();
    }
    points.sort_by(|a, b| a.wavelength.total_cmp(&b.wavelength));
    let xs: Vec<f64> = points.iter().map(|p| p.wavelength).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.intensity).collect();

    grid.iter().map(|&x| interpolate_at(&xs, &ys, x)).collect()
}

fn interpolate_at(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let n = xs.len();
    if n == 1 {
        return ys[0];
    }

    let upper = xs.partition_point(|&v| v < x);
    if upper < n && xs[upper] == x {
        return ys[upper];
    }

    // Clamp to the first/last segment for extrapolation.
    let i = upper.saturating_sub(1).min(n - 2);
    let (x0, x1, y0, y1) = (xs[i], xs[i + 1], ys[i], ys[i + 1]);
    if x1 == x0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Standard normal variate transform.
///
/// Non-finite inputs are treated as 0. If the values are all equal or the
/// standard deviation is not a positive finite number, the result is all
/// zeros.
pub fn snv(values: &[f64]) -> Vec<f64> {
    let x: Vec<f64> = values
        .iter()
        .map(|&v| if v.is_finite() { v } else { 0.0 })
        .collect();
    if x.is_empty() {
        return x;
    }

    let flat = x.iter().all(|&v| v == x[0]);
    let n = x.len() as f64;
    let mean = x.iter().sum::<f64>() / n;
    let sigma = (x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    if flat || sigma == 0.0 || !sigma.is_finite() {
        return vec![0.0; x.len()];
    }
    x.iter().map(|v| (v - mean) / sigma).collect()
}

/// Predict the calibrated value for `spectrum`.
///
/// # Errors
/// Returns [`CalibrationError::EmptySpectrum`] or
/// [`CalibrationError::EmptyTable`] if either input is empty.
pub fn predict(spectrum: &Spectrum, table: &CalibrationTable) -> Result<f64, CalibrationError> {
    if spectrum.is_empty() {
        return Err(CalibrationError::EmptySpectrum);
    }
    if table.is_empty() {
        return Err(CalibrationError::EmptyTable);
    }

    let aligned = interpolate(spectrum, table.wavelengths());
    let normalized = snv(&aligned);
    let dot: f64 = normalized
        .iter()
        .zip(table.coefficients())
        .map(|(x, c)| x * c)
        .sum();

    let prediction = (dot + table.constant()) * table.output_scale();
    debug!(
        "Calibration: dot={:.6} constant={} scale={} → {:.6}",
        dot,
        table.constant(),
        table.output_scale(),
        prediction
    );
    Ok(prediction)
}
