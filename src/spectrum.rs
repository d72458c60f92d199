//! Spectrum data and its text formats.
//!
//! The spectrometer transfers spectra as ASCII: one `wavelength intensity` pair
//! per line, mixed with acknowledgements, headers and the occasional blank or
//! malformed row. [`Spectrum::parse`] keeps only lines made of exactly two
//! numeric tokens and skips everything else. There is no line-count contract in
//! the transfer format, so benign formatting variance must not fail the parse.
//!
//! Captured spectra are written to disk as a two-column CSV with the header
//! `Wavelength,Intensity`.

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

/// A single (wavelength, intensity) sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectralPoint {
    /// Wavelength as reported by the instrument.
    pub wavelength: f64,
    /// Intensity at that wavelength.
    pub intensity: f64,
}

/// Ordered spectrum, in the order the samples were received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    points: Vec<SpectralPoint>,
}

#[derive(Serialize, Deserialize)]
struct CsvRow {
    #[serde(rename = "Wavelength")]
    wavelength: f64,
    #[serde(rename = "Intensity")]
    intensity: f64,
}

impl Spectrum {
    /// Build a spectrum from points.
    pub fn new(points: Vec<SpectralPoint>) -> Self {
        Self { points }
    }

    /// Parse the raw text of a spectrum transfer.
    pub fn parse(text: &str) -> Self {
        text.lines().filter_map(parse_pair).collect()
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the spectrum has no samples.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Samples in received order.
    pub fn points(&self) -> &[SpectralPoint] {
        &self.points
    }

    /// Wavelength column.
    pub fn wavelengths(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.wavelength).collect()
    }

    /// Intensity column.
    pub fn intensities(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.intensity).collect()
    }

    /// Write the spectrum as CSV with a `Wavelength,Intensity` header.
    ///
    /// # Errors
    /// Returns a [`csv::Error`] if writing fails.
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_writer(writer);
        // Header is emitted explicitly so an empty spectrum still gets one.
        writer.write_record(["Wavelength", "Intensity"])?;
        for p in &self.points {
            writer.write_record(&[p.wavelength.to_string(), p.intensity.to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a spectrum from CSV written by [`to_writer`](Self::to_writer).
    ///
    /// # Errors
    /// Returns a [`csv::Error`] if a row is malformed.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        reader
            .deserialize::<CsvRow>()
            .map(|row| {
                row.map(|r| SpectralPoint {
                    wavelength: r.wavelength,
                    intensity: r.intensity,
                })
            })
            .collect()
    }

    /// Write the spectrum to `path`.
    ///
    /// # Errors
    /// Returns a [`csv::Error`] if the file cannot be created or written.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), csv::Error> {
        let path = path.as_ref();
        let file = File::create(path)?;
        self.to_writer(file)?;
        info!("Spectrum saved to {}", path.display());
        Ok(())
    }

    /// Read a spectrum CSV from `path`.
    ///
    /// # Errors
    /// Returns a [`csv::Error`] if the file cannot be read or is malformed.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, csv::Error> {
        Self::from_reader(File::open(path)?)
    }
}

impl FromIterator<SpectralPoint> for Spectrum {
    fn from_iter<I: IntoIterator<Item = SpectralPoint>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl FromIterator<(f64, f64)> for Spectrum {
    fn from_iter<I: IntoIterator<Item = (f64, f64)>>(iter: I) -> Self {
        iter.into_iter()
            .map(|(wavelength, intensity)| SpectralPoint {
                wavelength,
                intensity,
            })
            .collect()
    }
}

fn parse_pair(line: &str) -> Option<SpectralPoint> {
    let mut tokens = line.split_whitespace();
    let (first, second) = (tokens.next()?, tokens.next()?);
    if tokens.next().is_some() {
        return None;
    }
    Some(SpectralPoint {
        wavelength: first.parse().ok()?,
        intensity: second.parse().ok()?,
    })
}

/// Default output file name, e.g. `spectrum_20250314_091500.csv`.
pub fn default_csv_name<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("spectrum_{}.csv", now.format("%Y%m%d_%H%M%S"))
}
