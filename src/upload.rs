//! Upload of spectra and predictions to the web backend.
//!
//! Two endpoints, both JSON over HTTP POST, both answering `201 Created` on
//! success. Uploads are fire-and-forget: a failure is logged and reported to
//! the caller as `None`/`false`, never raised and never rolled back.

use crate::acquisition::AcquisitionConfig;
use crate::config::UploadSettings;
use crate::error::{AppResult, SpectroError};
use crate::spectrum::Spectrum;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info};

#[derive(Serialize)]
struct SpectrumPayload<'a> {
    wavelengths: Vec<f64>,
    intensities: Vec<f64>,
    device_id: &'a str,
}

#[derive(Serialize)]
struct PredictionPayload<'a> {
    device_id: &'a str,
    predicted_value: f64,
    spectrum: &'a str,
}

/// HTTP client for the spectrum and prediction endpoints.
#[derive(Debug, Clone)]
pub struct UploadClient {
    client: reqwest::Client,
    spectrum_url: String,
    prediction_url: String,
}

impl UploadClient {
    /// # Errors
    /// Returns [`SpectroError::Upload`] if the HTTP client cannot be built.
    pub fn new(
        spectrum_url: impl Into<String>,
        prediction_url: impl Into<String>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SpectroError::Upload(e.to_string()))?;
        Ok(Self {
            client,
            spectrum_url: spectrum_url.into(),
            prediction_url: prediction_url.into(),
        })
    }

    /// Client for the configured endpoints, or `None` if uploading is off.
    ///
    /// # Errors
    /// See [`new`](Self::new).
    pub fn from_settings(settings: &UploadSettings) -> AppResult<Option<Self>> {
        match (&settings.spectrum_url, &settings.prediction_url) {
            (Some(spectrum_url), Some(prediction_url)) => Ok(Some(Self::new(
                spectrum_url.as_str(),
                prediction_url.as_str(),
                Duration::from_millis(settings.timeout_ms),
            )?)),
            _ => Ok(None),
        }
    }

    /// Upload a spectrum and return the id the backend assigned to it.
    pub async fn upload_spectrum(&self, spectrum: &Spectrum, device_id: &str) -> Option<String> {
        let payload = SpectrumPayload {
            wavelengths: spectrum.wavelengths(),
            intensities: spectrum.intensities(),
            device_id,
        };

        let response = match self.client.post(&self.spectrum_url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) => {
                error!("Spectrum upload failed: {}", e);
                return None;
            }
        };

        let status = response.status();
        if status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            error!("Spectrum upload rejected ({}): {}", status, body);
            return None;
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                error!("Spectrum upload returned an unreadable body: {}", e);
                return None;
            }
        };
        match body.get("spectrum_id") {
            Some(Value::String(id)) => {
                info!("Spectrum uploaded, id {}", id);
                Some(id.clone())
            }
            Some(Value::Number(id)) => {
                info!("Spectrum uploaded, id {}", id);
                Some(id.to_string())
            }
            _ => {
                error!("Spectrum upload response has no spectrum_id: {}", body);
                None
            }
        }
    }

    /// Upload a prediction linked to a previously uploaded spectrum.
    pub async fn upload_prediction(&self, value: f64, spectrum_id: &str, device_id: &str) -> bool {
        let payload = PredictionPayload {
            device_id,
            predicted_value: value,
            spectrum: spectrum_id,
        };

        match self.client.post(&self.prediction_url).json(&payload).send().await {
            Ok(response) if response.status() == StatusCode::CREATED => {
                info!("Prediction {:.4} uploaded for spectrum {}", value, spectrum_id);
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!("Prediction upload rejected ({}): {}", status, body);
                false
            }
            Err(e) => {
                error!("Prediction upload failed: {}", e);
                false
            }
        }
    }
}

/// Device tag sent with every upload, e.g. `LAB3_Gain-Low_Apo-Hann_Avg-5_'rinse'`.
pub fn device_tag(prefix: &str, config: &AcquisitionConfig, message: &str) -> String {
    format!(
        "{}_Gain-{}_Apo-{}_Avg-{}_'{}'",
        prefix, config.gain, config.apodization, config.average_count, message
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::{Apodization, Gain};
    use std::num::NonZeroU32;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-shot HTTP responder; yields the request body it received.
    async fn respond_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let request_body = loop {
                let n = socket.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if raw.len() >= split + 4 + length {
                        break text[split + 4..].to_string();
                    }
                }
                if n == 0 {
                    break String::new();
                }
            };

            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request_body
        });

        (url, handle)
    }

    fn client(spectrum_url: &str, prediction_url: &str) -> UploadClient {
        UploadClient::new(spectrum_url, prediction_url, Duration::from_secs(5)).unwrap()
    }

    fn spectrum() -> Spectrum {
        vec![(1000.0, 0.5), (1001.0, 0.6)].into_iter().collect()
    }

    #[test]
    fn test_device_tag() {
        let config = AcquisitionConfig {
            gain: Gain::Medium,
            apodization: Apodization::Hann,
            average_count: NonZeroU32::new(12).unwrap(),
            interferogram_averaging: false,
        };
        assert_eq!(
            device_tag("LAB3", &config, "rinse"),
            "LAB3_Gain-Medium_Apo-Hann_Avg-12_'rinse'"
        );
    }

    #[test]
    fn test_from_settings_requires_both_urls() {
        let mut settings = UploadSettings::default();
        assert!(UploadClient::from_settings(&settings).unwrap().is_none());

        settings.spectrum_url = Some("http://localhost:8000/api/spectra/".to_string());
        assert!(UploadClient::from_settings(&settings).unwrap().is_none());

        settings.prediction_url = Some("http://localhost:8000/api/predictions/".to_string());
        assert!(UploadClient::from_settings(&settings).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upload_spectrum_returns_id() {
        let (url, server) = respond_once("201 Created", r#"{"spectrum_id": 42}"#).await;
        let id = client(&url, &url).upload_spectrum(&spectrum(), "LAB3").await;
        assert_eq!(id.as_deref(), Some("42"));

        let body: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["device_id"], "LAB3");
        assert_eq!(body["wavelengths"], serde_json::json!([1000.0, 1001.0]));
        assert_eq!(body["intensities"], serde_json::json!([0.5, 0.6]));
    }

    #[tokio::test]
    async fn test_upload_spectrum_rejected() {
        let (url, _server) = respond_once("400 Bad Request", r#"{"detail": "bad"}"#).await;
        assert!(client(&url, &url)
            .upload_spectrum(&spectrum(), "LAB3")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_upload_prediction() {
        let (url, server) = respond_once("201 Created", "{}").await;
        assert!(client(&url, &url).upload_prediction(4.25, "42", "LAB3").await);

        let body: Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["predicted_value"], 4.25);
        assert_eq!(body["spectrum"], "42");
    }

    #[tokio::test]
    async fn test_upload_prediction_wrong_status() {
        // 200 is not the backend's success code for creation.
        let (url, _server) = respond_once("200 OK", "{}").await;
        assert!(!client(&url, &url).upload_prediction(1.0, "42", "LAB3").await);
    }

    #[tokio::test]
    async fn test_connection_refused_is_not_raised() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/api/", listener.local_addr().unwrap());
        drop(listener);

        let client = client(&url, &url);
        assert!(client.upload_spectrum(&spectrum(), "LAB3").await.is_none());
        assert!(!client.upload_prediction(1.0, "42", "LAB3").await);
    }
}
