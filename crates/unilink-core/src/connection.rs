//! Connection state, quality and statistics.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::device::DeviceId;
use crate::protocol::ProtocolKind;

/// Connection state of one device session.
///
/// Allowed transitions:
///
/// ```text
/// disconnected -> connecting -> connected -> disconnecting -> disconnected
///                 connecting -> error | disconnected
///                                connected -> error
///                                             error -> connecting | disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// Session being established
    Connecting,
    /// Session established and operational
    Connected,
    /// Session being torn down
    Disconnecting,
    /// Session failed
    Error,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` follows a defined edge.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Error)
                | (Disconnecting, Disconnected)
                | (Error, Connecting)
                | (Error, Disconnected)
        )
    }

    /// Connected or on the way there.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnecting => write!(f, "disconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Discrete quality level derived from a quality score.
///
/// Variants are declared worst to best so that `Ord` follows the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Bad,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    /// Bucket a 0-100 score.
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Self::Excellent,
            60..=79 => Self::Good,
            40..=59 => Self::Fair,
            20..=39 => Self::Poor,
            _ => Self::Bad,
        }
    }
}

/// Link quality snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionQuality {
    /// Link stability in [0, 1]
    pub stability: f64,
    /// Round trip latency in milliseconds
    pub latency_ms: f64,
    /// Throughput in bytes per second
    pub throughput_bps: f64,
    /// Packet loss ratio in [0, 1]
    pub packet_loss: f64,
    /// Error ratio in [0, 1]
    pub error_rate: f64,
}

impl Default for ConnectionQuality {
    fn default() -> Self {
        Self {
            stability: 1.0,
            latency_ms: 0.0,
            throughput_bps: 0.0,
            packet_loss: 0.0,
            error_rate: 0.0,
        }
    }
}

impl ConnectionQuality {
    /// Integer score in [0, 100].
    ///
    /// `stability*30 + max(0, 30 - latency/10) + min(20, throughput/1000)
    ///  + max(0, 10 - loss*100) + max(0, 10 - errors*100)`
    pub fn score(&self) -> u8 {
        let stability = finite_or(self.stability, 0.0).clamp(0.0, 1.0);
        let latency = finite_or(self.latency_ms, f64::MAX).max(0.0);
        let throughput = finite_or(self.throughput_bps, 0.0).max(0.0);
        let loss = finite_or(self.packet_loss, 1.0).clamp(0.0, 1.0);
        let errors = finite_or(self.error_rate, 1.0).clamp(0.0, 1.0);

        let total = stability * 30.0
            + (30.0 - latency / 10.0).max(0.0)
            + (throughput / 1000.0).min(20.0)
            + (10.0 - loss * 100.0).max(0.0)
            + (10.0 - errors * 100.0).max(0.0);

        total.round().clamp(0.0, 100.0) as u8
    }

    /// Quality level bucketed from [`score`](Self::score).
    pub fn level(&self) -> QualityLevel {
        QualityLevel::from_score(self.score())
    }
}

fn finite_or(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Accumulating counters since the last explicit reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatistics {
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub disconnections: u64,
    pub reconnections: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_failed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub last_reset: DateTime<Utc>,
}

impl Default for ConnectionStatistics {
    fn default() -> Self {
        Self {
            connection_attempts: 0,
            successful_connections: 0,
            failed_connections: 0,
            disconnections: 0,
            reconnections: 0,
            messages_sent: 0,
            messages_received: 0,
            messages_failed: 0,
            bytes_sent: 0,
            bytes_received: 0,
            errors: 0,
            last_reset: Utc::now(),
        }
    }
}

impl ConnectionStatistics {
    pub fn record_attempt(&mut self) {
        self.connection_attempts = self.connection_attempts.saturating_add(1);
    }

    pub fn record_connected(&mut self) {
        self.successful_connections = self.successful_connections.saturating_add(1);
    }

    pub fn record_connect_failure(&mut self) {
        self.failed_connections = self.failed_connections.saturating_add(1);
        self.errors = self.errors.saturating_add(1);
    }

    pub fn record_disconnect(&mut self) {
        self.disconnections = self.disconnections.saturating_add(1);
    }

    pub fn record_reconnect(&mut self) {
        self.reconnections = self.reconnections.saturating_add(1);
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.messages_sent = self.messages_sent.saturating_add(1);
        self.bytes_sent = self.bytes_sent.saturating_add(bytes as u64);
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.messages_received = self.messages_received.saturating_add(1);
        self.bytes_received = self.bytes_received.saturating_add(bytes as u64);
    }

    pub fn record_send_failure(&mut self) {
        self.messages_failed = self.messages_failed.saturating_add(1);
        self.errors = self.errors.saturating_add(1);
    }

    /// Successful connections over attempts; 1.0 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            return 1.0;
        }
        self.successful_connections as f64 / self.connection_attempts as f64
    }

    /// Delivered messages over all send attempts; 1.0 when nothing was sent.
    pub fn message_success_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_failed;
        if total == 0 {
            return 1.0;
        }
        self.messages_sent as f64 / total as f64
    }

    /// Clear every counter.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Exponential backoff between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.1 = +/-10%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay.max(0.0) as u64)
    }

    /// [`delay_for`](Self::delay_for) with random jitter applied, never above
    /// `max_delay_ms`.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        let jittered = Duration::from_secs_f64(base.as_secs_f64() * factor);
        jittered.min(Duration::from_millis(self.max_delay_ms))
    }
}

/// Parameters a session is established with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Maximum time for establishing the session
    pub connect_timeout_ms: u64,
    /// Maximum time for a single send/subscribe
    pub operation_timeout_ms: u64,
    /// Keep-alive interval
    pub keep_alive_secs: u64,
    /// Reconnect automatically after link loss
    pub auto_reconnect: bool,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Delay policy between reconnect attempts
    pub backoff: BackoffPolicy,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 5_000,
            keep_alive_secs: 60,
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ConnectionParameters {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// The live record of one connected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub device_id: DeviceId,
    pub protocol: ProtocolKind,
    pub state: ConnectionState,
    pub parameters: ConnectionParameters,
    pub quality: ConnectionQuality,
    pub statistics: ConnectionStatistics,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ConnectionInfo {
    /// Create a record for a freshly established session.
    pub fn new(
        device_id: impl Into<String>,
        protocol: ProtocolKind,
        parameters: ConnectionParameters,
    ) -> Self {
        let now = Utc::now();
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            protocol,
            state: ConnectionState::Connected,
            parameters,
            quality: ConnectionQuality::default(),
            statistics: ConnectionStatistics::default(),
            created_at: now,
            last_updated: now,
            last_active: now,
        }
    }

    /// Record activity on the link.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_active = now;
        self.last_updated = now;
    }

    pub fn update_quality(&mut self, quality: ConnectionQuality) {
        self.quality = quality;
        self.last_updated = Utc::now();
    }

    pub fn update_statistics(&mut self, statistics: ConnectionStatistics) {
        self.statistics = statistics;
        self.last_updated = Utc::now();
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.last_updated = Utc::now();
    }

    /// Whether no activity was seen for longer than `timeout`.
    pub fn is_inactive(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(self.last_active);
        idle.to_std().map(|idle| idle > timeout).unwrap_or(false)
    }
}
