//! REST transport.
//!
//! Opening the link probes the configured health path; every frame becomes a
//! JSON `POST` to `{base_url}{frame.address}`. HTTP has no push channel, so
//! subscriptions and scans are unsupported.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::HttpConfig;

use super::{Advertisement, Frame, Transport, TransportError, TransportSignal, SIGNAL_CHANNEL_CAPACITY};

/// Transport over plain HTTP requests.
pub struct HttpTransport {
    config: HttpConfig,
    client: Client,
    device_id: Mutex<Option<String>>,
    signals: broadcast::Sender<TransportSignal>,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| TransportError::Io(format!("failed to build HTTP client: {}", e)))?;
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            client,
            device_id: Mutex::new(None),
            signals,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn commands_path(device_id: &str) -> String {
        format!("/devices/{}/commands", device_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn open_device(&self) -> Result<String, TransportError> {
        self.device_id.lock().clone().ok_or(TransportError::NotOpen)
    }

    async fn health_check(&self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let response = self
            .authorize(self.client.get(self.url(&self.config.health_path)))
            .send()
            .await
            .map_err(map_request_error)?;
        check_status(response.status())?;
        Ok(started.elapsed())
    }
}

fn map_request_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(0)
    } else if err.is_connect() {
        TransportError::Unreachable(err.to_string())
    } else {
        TransportError::Io(err.to_string())
    }
}

fn check_status(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(TransportError::AuthRejected)
    } else if status == StatusCode::NOT_FOUND {
        Err(TransportError::NoPeer(status.to_string()))
    } else {
        Err(TransportError::Refused(format!("HTTP {}", status)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    async fn open(&self, device_id: &str) -> Result<(), TransportError> {
        let elapsed = self.health_check().await?;
        debug!(
            base_url = %self.config.base_url,
            device_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "HTTP endpoint healthy"
        );
        *self.device_id.lock() = Some(device_id.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.device_id.lock().take();
        Ok(())
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        let device_id = self.open_device()?;
        let path = frame
            .address
            .unwrap_or_else(|| Self::commands_path(&device_id));
        let response = self
            .authorize(self.client.post(self.url(&path)))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame.payload)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            warn!(device_id = %device_id, status = %status, "HTTP command rejected");
        }
        check_status(status)
    }

    async fn subscribe(&self, _address: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "http has no subscriptions".to_string(),
        ))
    }

    async fn unsubscribe(&self, _address: &str) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(
            "http has no subscriptions".to_string(),
        ))
    }

    async fn probe(&self) -> Result<Duration, TransportError> {
        self.open_device()?;
        self.health_check().await
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }

    async fn scan(&self, _window: Duration) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        Err(TransportError::Unsupported(
            "http has no discovery".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        let transport = HttpTransport::new(HttpConfig {
            base_url: "http://hub.local:8080/".to_string(),
            ..HttpConfig::default()
        })
        .unwrap();
        assert_eq!(
            transport.url(&HttpTransport::commands_path("cam")),
            "http://hub.local:8080/devices/cam/commands"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert_eq!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(TransportError::AuthRejected)
        );
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE),
            Err(TransportError::Refused(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_is_unsupported() {
        let transport = HttpTransport::new(HttpConfig::default()).unwrap();
        assert!(matches!(
            transport.subscribe("x").await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
