//! Advertisement-scan discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use unilink_core::error::{ConnectionError, ConnectionResult};
use unilink_core::protocol::ProtocolKind;

use crate::adapter::{DeviceDiscovery, DiscoveryStream};
use crate::transport::{Advertisement, Transport};

/// Predicate deciding which advertisements count as discovered devices.
pub type AdvertisementFilter = Arc<dyn Fn(&Advertisement) -> bool + Send + Sync>;

/// Discovery backed by a transport scan.
pub struct ScanDiscovery {
    protocol: ProtocolKind,
    transport: Arc<dyn Transport>,
    filter: AdvertisementFilter,
    max_window: Option<Duration>,
}

impl ScanDiscovery {
    pub fn new(protocol: ProtocolKind, transport: Arc<dyn Transport>) -> Self {
        Self {
            protocol,
            transport,
            filter: Arc::new(|_| true),
            max_window: None,
        }
    }

    pub fn with_filter(mut self, filter: AdvertisementFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Cap every discovery window at `window`.
    pub fn with_max_window(mut self, window: Duration) -> Self {
        self.max_window = Some(window);
        self
    }
}

#[async_trait]
impl DeviceDiscovery for ScanDiscovery {
    fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    async fn discover(&self, window: Duration) -> ConnectionResult<DiscoveryStream> {
        let window = self.max_window.map_or(window, |max| window.min(max));
        let mut rx = self
            .transport
            .scan(window)
            .await
            .map_err(ConnectionError::from)?;
        debug!(protocol = %self.protocol, window_ms = window.as_millis() as u64, "Scan started");

        let protocol = self.protocol;
        let filter = self.filter.clone();
        let deadline = tokio::time::Instant::now() + window;
        Ok(Box::pin(async_stream::stream! {
            while let Ok(Some(ad)) = tokio::time::timeout_at(deadline, rx.recv()).await {
                if filter(&ad) {
                    yield ad.into_discovered(protocol);
                }
            }
        }))
    }
}
