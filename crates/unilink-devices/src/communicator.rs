//! Per-device connection orchestration.
//!
//! A [`DeviceCommunicator`] owns the communication context of one device. It
//! asks the strategy engine for a protocol, obtains adapters from the factory,
//! walks the selection's alternatives until one connects, and republishes what
//! the adapter reports on the event bus.
//!
//! Background work runs in [`ScheduledTask`]s owned by the communicator:
//! - a quality monitor, alive only while `Connected`
//! - a periodic re-evaluation of the active strategy
//! - a reconnect loop after a failed initial connect
//! - the adapter event forwarder
//!
//! Tasks hold a `Weak` reference back to the communicator, so dropping the
//! last handle or calling [`shutdown`](DeviceCommunicator::shutdown) stops
//! every timer.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use unilink_core::config::CommunicatorConfig;
use unilink_core::connection::{
    ConnectionInfo, ConnectionQuality, ConnectionState, ConnectionStatistics,
};
use unilink_core::context::{CommunicationContext, ConnectionHistory, ConnectionRecord};
use unilink_core::error::{ConnectionError, ConnectionResult};
use unilink_core::event::ConnectivityEvent;
use unilink_core::eventbus::EventBus;
use unilink_core::protocol::ProtocolKind;

use crate::adapter::{AdapterEvent, AdapterEventStream, AdapterMessage, ProtocolAdapter};
use crate::factory::{AdapterFactory, FactoryError};
use crate::scheduler::ScheduledTask;
use crate::strategy::{ConnectionStrategy, StrategyEngine};

struct ActiveLink {
    adapter: Arc<dyn ProtocolAdapter>,
    protocol: ProtocolKind,
}

#[derive(Default)]
struct Tasks {
    quality: Option<ScheduledTask>,
    reevaluation: Option<ScheduledTask>,
    reconnect: Option<ScheduledTask>,
    forwarder: Option<ScheduledTask>,
    out_of_band: Option<ScheduledTask>,
}

impl Tasks {
    fn cancel_all(&mut self) {
        for task in [
            &mut self.quality,
            &mut self.reevaluation,
            &mut self.reconnect,
            &mut self.forwarder,
            &mut self.out_of_band,
        ] {
            if let Some(mut task) = task.take() {
                task.cancel();
            }
        }
    }
}

struct Inner {
    me: Weak<Inner>,
    device_id: String,
    factory: Arc<AdapterFactory>,
    engine: Arc<StrategyEngine>,
    bus: EventBus,
    config: CommunicatorConfig,
    context: RwLock<CommunicationContext>,
    strategy: RwLock<Option<String>>,
    link: RwLock<Option<ActiveLink>>,
    info: RwLock<Option<ConnectionInfo>>,
    state: watch::Sender<ConnectionState>,
    /// Bumped to fail in-flight operations with `ConnectionLost`.
    teardown: watch::Sender<u64>,
    reconnect_attempts: AtomicU32,
    shut_down: AtomicBool,
    /// Serializes connect, disconnect and strategy switches.
    ops: tokio::sync::Mutex<()>,
    tasks: Mutex<Tasks>,
}

impl Inner {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn protocol(&self) -> Option<ProtocolKind> {
        self.link.read().as_ref().map(|l| l.protocol)
    }

    fn adapter(&self) -> Option<Arc<dyn ProtocolAdapter>> {
        self.link.read().as_ref().map(|l| l.adapter.clone())
    }

    fn ensure_running(&self) -> ConnectionResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ConnectionError::InvalidState(format!(
                "communicator for {} is shut down",
                self.device_id
            )));
        }
        Ok(())
    }

    /// Move to `next` along a valid edge and publish the change. Publishing
    /// happens under the state lock so per-device events stay ordered.
    fn transition(&self, next: ConnectionState) -> bool {
        let protocol = self.protocol();
        let bus = &self.bus;
        let device_id = &self.device_id;
        let mut rejected = None;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                rejected = Some(*current);
                return false;
            }
            let old = *current;
            *current = next;
            bus.publish(ConnectivityEvent::state_changed(
                device_id.clone(),
                protocol,
                old,
                next,
            ));
            true
        });

        if let Some(from) = rejected {
            debug!(device_id = %self.device_id, from = %from, to = %next, "Skipping state transition");
        }
        if changed {
            if let Some(info) = self.info.write().as_mut() {
                info.set_state(next);
            }
            if next == ConnectionState::Connected {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.start_quality_monitor();
            } else {
                self.tasks.lock().quality = None;
            }
        }
        changed
    }

    fn fail_in_flight(&self) {
        self.teardown.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    async fn guarded<T, F>(&self, op: F) -> ConnectionResult<T>
    where
        F: Future<Output = ConnectionResult<T>>,
    {
        let mut teardown = self.teardown.subscribe();
        tokio::select! {
            result = op => result,
            _ = teardown.changed() => Err(ConnectionError::ConnectionLost),
        }
    }

    fn record_history(&self, protocol: ProtocolKind, elapsed: Duration, quality: u8, success: bool) {
        self.context.write().history.push(ConnectionRecord::new(
            protocol,
            elapsed.as_millis() as u64,
            quality,
            success,
        ));
    }

    fn publish_failure(&self, protocol: Option<ProtocolKind>, attempts: u32, error: &ConnectionError) {
        warn!(
            device_id = %self.device_id,
            attempts,
            error = %error,
            "Connection failed"
        );
        self.bus.publish(ConnectivityEvent::ConnectionFailed {
            device_id: self.device_id.clone(),
            protocol,
            attempts,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn start_quality_monitor(&self) {
        let weak = self.me.clone();
        let task = ScheduledTask::interval(
            "quality-monitor",
            self.config.quality_monitor_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => {
                            inner.sample_quality();
                            true
                        }
                        None => false,
                    }
                }
            },
        );
        self.tasks.lock().quality = Some(task);
    }

    fn sample_quality(&self) {
        let Some((adapter, protocol)) = self
            .link
            .read()
            .as_ref()
            .map(|l| (l.adapter.clone(), l.protocol))
        else {
            return;
        };
        let quality = adapter.diagnostics().quality();
        let statistics = adapter.statistics();
        if let Some(info) = self.info.write().as_mut() {
            info.update_quality(quality);
            info.update_statistics(statistics);
        }
        self.bus
            .publish(ConnectivityEvent::quality_updated(&self.device_id, protocol, quality));
    }

    fn ensure_reevaluation(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.reevaluation.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let weak = self.me.clone();
        tasks.reevaluation = Some(ScheduledTask::interval(
            "reevaluation",
            self.config.reevaluation_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return false;
                    };
                    if let Err(e) = inner.reevaluate().await {
                        warn!(device_id = %inner.device_id, error = %e, "Re-evaluation failed");
                    }
                    true
                }
            },
        ));
    }

    fn start_forwarder(&self, mut events: AdapterEventStream, protocol: ProtocolKind) {
        let weak = self.me.clone();
        let task = ScheduledTask::spawn("adapter-events", async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.on_adapter_event(protocol, event) {
                    break;
                }
            }
        });
        self.tasks.lock().forwarder = Some(task);
    }

    /// Translate one adapter event. Returns false once the session is over.
    fn on_adapter_event(&self, protocol: ProtocolKind, event: AdapterEvent) -> bool {
        match event {
            AdapterEvent::StateChanged { new, .. } => {
                // Disconnects are driven from here, not mirrored.
                if matches!(
                    new,
                    ConnectionState::Error | ConnectionState::Connecting | ConnectionState::Connected
                ) {
                    self.transition(new);
                }
                true
            }
            AdapterEvent::Message { topic, payload } => {
                if let Some(info) = self.info.write().as_mut() {
                    info.touch();
                }
                self.bus.publish(ConnectivityEvent::MessageReceived {
                    device_id: self.device_id.clone(),
                    protocol,
                    topic,
                    payload,
                    timestamp: Utc::now(),
                });
                true
            }
            AdapterEvent::Reconnected { attempts } => {
                info!(device_id = %self.device_id, protocol = %protocol, attempts, "Link restored");
                self.record_history(protocol, Duration::ZERO, ConnectionQuality::default().score(), true);
                true
            }
            AdapterEvent::ConnectionFailed { attempts, error } => {
                self.record_history(protocol, Duration::ZERO, 0, false);
                self.transition(ConnectionState::Disconnected);
                self.link.write().take();
                self.info.write().take();
                self.tasks.lock().reevaluation = None;
                self.publish_failure(Some(protocol), attempts, &error);
                false
            }
        }
    }

    /// Disconnect the active adapter, keeping the link record.
    async fn close_adapter(&self) {
        self.tasks.lock().forwarder = None;
        let adapter = self.adapter();
        if let Some(adapter) = adapter {
            if let Err(e) = adapter.disconnect().await {
                debug!(device_id = %self.device_id, error = %e, "Adapter disconnect failed");
            }
        }
    }

    fn drop_link(&self) {
        self.link.write().take();
        self.info.write().take();
    }

    /// Tear down the current session and go back to `Disconnected`.
    async fn teardown_session(&self) {
        self.fail_in_flight();
        if self.current() == ConnectionState::Connected {
            self.transition(ConnectionState::Disconnecting);
        }
        self.close_adapter().await;
        self.transition(ConnectionState::Disconnected);
        self.drop_link();
    }

    /// One connect pass: select, then walk protocol and alternatives.
    async fn attempt(&self, strategy: Option<Arc<dyn ConnectionStrategy>>) -> ConnectionResult<()> {
        self.close_adapter().await;
        self.drop_link();
        self.transition(ConnectionState::Connecting);
        match self.establish(strategy).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.transition(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn establish(&self, strategy: Option<Arc<dyn ConnectionStrategy>>) -> ConnectionResult<()> {
        let context = self.context.read().clone();
        let (strategy_name, selection) = match strategy {
            Some(s) => {
                let selection = s.select_protocol(&context, self.engine.defaults())?;
                (s.name().to_string(), selection)
            }
            None => {
                let (eval, selection) = self.engine.select(&context)?;
                (eval.strategy, selection)
            }
        };

        let mut last_error = ConnectionError::ResourceUnavailable(format!(
            "no adapter available for {}",
            selection.protocol
        ));
        for (protocol, config) in selection.attempts() {
            let Some(config) = config else {
                debug!(device_id = %self.device_id, protocol = %protocol, "No adapter, trying next");
                continue;
            };
            let adapter: Arc<dyn ProtocolAdapter> =
                match self.factory.create_adapter_for(protocol, &config) {
                    Ok(adapter) => Arc::from(adapter),
                    Err(FactoryError::UnsupportedType(_)) => continue,
                    Err(e) => {
                        last_error = e.into();
                        continue;
                    }
                };

            let started = Instant::now();
            match adapter.connect(&context.device).await {
                Ok(_) => {
                    if self.shut_down.load(Ordering::SeqCst) {
                        let _ = adapter.disconnect().await;
                        return self.ensure_running();
                    }
                    self.commit(adapter, protocol, strategy_name, started.elapsed());
                    return Ok(());
                }
                Err(e) => {
                    self.record_history(protocol, started.elapsed(), 0, false);
                    warn!(
                        device_id = %self.device_id,
                        protocol = %protocol,
                        error = %e,
                        "Connect attempt failed, trying next protocol"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn commit(
        &self,
        adapter: Arc<dyn ProtocolAdapter>,
        protocol: ProtocolKind,
        strategy: String,
        elapsed: Duration,
    ) {
        let events = adapter.events();
        *self.strategy.write() = Some(strategy.clone());
        *self.info.write() = Some(ConnectionInfo::new(
            self.device_id.clone(),
            protocol,
            self.factory.parameters().clone(),
        ));
        *self.link.write() = Some(ActiveLink { adapter, protocol });
        self.record_history(protocol, elapsed, ConnectionQuality::default().score(), true);
        self.transition(ConnectionState::Connected);
        self.start_forwarder(events, protocol);
        self.ensure_reevaluation();
        info!(
            device_id = %self.device_id,
            protocol = %protocol,
            strategy = %strategy,
            elapsed_ms = elapsed.as_millis() as u64,
            "Device connected"
        );
    }

    /// After a failed connect: retry in the background or give up.
    fn after_failed_connect(&self, error: &ConnectionError) {
        let params = self.factory.parameters();
        let running = !self.shut_down.load(Ordering::SeqCst);
        if running && params.auto_reconnect && params.max_reconnect_attempts > 0 {
            self.schedule_reconnect(error.clone());
        } else {
            self.transition(ConnectionState::Disconnected);
            self.publish_failure(None, 1, error);
        }
    }

    fn schedule_reconnect(&self, first_error: ConnectionError) {
        let weak = self.me.clone();
        let params = self.factory.parameters().clone();
        let task = ScheduledTask::spawn("reconnect", async move {
            let max_attempts = params.max_reconnect_attempts;
            let mut last_error = first_error;
            for attempt in 1..=max_attempts {
                tokio::time::sleep(params.backoff.jittered_delay_for(attempt)).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let _ops = inner.ops.lock().await;
                if inner.current() != ConnectionState::Error {
                    return;
                }
                inner.reconnect_attempts.store(attempt, Ordering::SeqCst);
                debug!(device_id = %inner.device_id, attempt, max_attempts, "Retrying connect");
                match inner.attempt(None).await {
                    Ok(()) => return,
                    Err(e) => last_error = e,
                }
            }
            if let Some(inner) = weak.upgrade() {
                let _ops = inner.ops.lock().await;
                if inner.current() == ConnectionState::Error {
                    inner.transition(ConnectionState::Disconnected);
                    inner.publish_failure(None, max_attempts, &last_error);
                }
            }
        });
        self.tasks.lock().reconnect = Some(task);
    }

    async fn reevaluate(&self) -> ConnectionResult<Option<String>> {
        let _ops = self.ops.lock().await;
        if self.shut_down.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let Some(current) = self.strategy.read().clone() else {
            return Ok(None);
        };
        let context = self.context.read().clone();
        let score = match self.engine.evaluate(&current, &context) {
            Ok(eval) if eval.applicable => eval.suitability_score,
            _ => 0,
        };
        let threshold = self.config.reevaluation_threshold;
        if score >= threshold {
            debug!(device_id = %self.device_id, strategy = %current, score, "Strategy still suitable");
            return Ok(None);
        }

        let Some((strategy, eval)) = self.engine.best_strategy(&context) else {
            warn!(device_id = %self.device_id, strategy = %current, score, "No better strategy available");
            return Ok(None);
        };
        if eval.strategy == current {
            return Ok(None);
        }
        if !context.preferences.allow_protocol_switching {
            info!(
                device_id = %self.device_id,
                from = %current,
                to = %eval.strategy,
                "Strategy switch vetoed by user preferences"
            );
            return Ok(None);
        }

        let reason = format!(
            "{} scored {} below threshold {}; {} scored {}",
            current, score, threshold, eval.strategy, eval.suitability_score
        );
        info!(device_id = %self.device_id, from = %current, to = %eval.strategy, %reason, "Switching strategy");
        self.bus.publish(ConnectivityEvent::StrategyChanged {
            device_id: self.device_id.clone(),
            from: Some(current),
            to: eval.strategy.clone(),
            reason,
            timestamp: Utc::now(),
        });
        *self.strategy.write() = Some(eval.strategy.clone());

        if self.current() == ConnectionState::Connected {
            self.teardown_session().await;
            if let Err(e) = self.attempt(Some(strategy)).await {
                self.after_failed_connect(&e);
            }
        }
        Ok(Some(eval.strategy))
    }
}

/// Orchestrates the connection to one device.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct DeviceCommunicator {
    inner: Arc<Inner>,
}

impl DeviceCommunicator {
    pub fn new(
        mut context: CommunicationContext,
        factory: Arc<AdapterFactory>,
        engine: Arc<StrategyEngine>,
        bus: EventBus,
        config: CommunicatorConfig,
    ) -> Self {
        if context.history.is_empty() && context.history.capacity() != config.history_capacity {
            context.history = ConnectionHistory::with_capacity(config.history_capacity);
        }
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (teardown, _) = watch::channel(0);
        let device_id = context.device.device_id.clone();
        Self {
            inner: Arc::new_cyclic(|me| Inner {
                me: me.clone(),
                device_id,
                factory,
                engine,
                bus,
                config,
                context: RwLock::new(context),
                strategy: RwLock::new(None),
                link: RwLock::new(None),
                info: RwLock::new(None),
                state,
                teardown,
                reconnect_attempts: AtomicU32::new(0),
                shut_down: AtomicBool::new(false),
                ops: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Connect through the best strategy.
    ///
    /// A no-op when already connected or connecting. On failure the error is
    /// returned and, with auto-reconnect enabled, retries continue in the
    /// background until the attempt cap.
    pub async fn connect(&self) -> ConnectionResult<()> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let _ops = inner.ops.lock().await;
        inner.ensure_running()?;
        if matches!(
            inner.current(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return Ok(());
        }
        inner.tasks.lock().reconnect = None;
        match inner.attempt(None).await {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.after_failed_connect(&e);
                Err(e)
            }
        }
    }

    /// Close the session, cancel pending reconnects and fail in-flight operations.
    pub async fn disconnect(&self) -> ConnectionResult<()> {
        let inner = &self.inner;
        let _ops = inner.ops.lock().await;
        {
            let mut tasks = inner.tasks.lock();
            tasks.reconnect = None;
            tasks.reevaluation = None;
            tasks.out_of_band = None;
        }
        inner.teardown_session().await;
        Ok(())
    }

    /// Send a message. Fails fast with `NotConnected` when not connected.
    pub async fn send(&self, message: AdapterMessage) -> ConnectionResult<()> {
        let adapter = self.connected_adapter()?;
        let result = self.inner.guarded(adapter.send(message)).await;
        if result.is_ok() {
            if let Some(info) = self.inner.info.write().as_mut() {
                info.touch();
            }
        }
        result
    }

    pub async fn subscribe(&self, topic: &str) -> ConnectionResult<()> {
        let adapter = self.connected_adapter()?;
        self.inner.guarded(adapter.subscribe(topic)).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> ConnectionResult<()> {
        let adapter = self.connected_adapter()?;
        self.inner.guarded(adapter.unsubscribe(topic)).await
    }

    /// Replace the context. A changed device type or capability set triggers
    /// an immediate re-evaluation; returns whether it did.
    ///
    /// The existing connection history is kept when `context` carries none.
    pub fn update_context(&self, mut context: CommunicationContext) -> bool {
        let inner = &self.inner;
        let changed = {
            let mut current = inner.context.write();
            if context.history.is_empty() {
                context.history = current.history.clone();
            }
            let changed = current.device_changed(&context);
            *current = context;
            changed
        };
        if !changed || inner.strategy.read().is_none() {
            return false;
        }
        debug!(device_id = %inner.device_id, "Device changed, re-evaluating");
        let weak = inner.me.clone();
        let task = ScheduledTask::spawn("reevaluate-now", async move {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.reevaluate().await {
                    warn!(device_id = %inner.device_id, error = %e, "Re-evaluation failed");
                }
            }
        });
        inner.tasks.lock().out_of_band = Some(task);
        true
    }

    /// Re-score the active strategy now. Returns the new strategy's name when
    /// it switched.
    pub async fn reevaluate(&self) -> ConnectionResult<Option<String>> {
        self.inner.ensure_running()?;
        self.inner.reevaluate().await
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.current()
    }

    /// Watch the connection state.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// The live connection record, refreshed from the adapter.
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        let adapter = self.inner.adapter();
        let mut info = self.inner.info.read().clone()?;
        if let Some(adapter) = adapter {
            info.statistics = adapter.statistics();
        }
        Some(info)
    }

    pub fn statistics(&self) -> Option<ConnectionStatistics> {
        self.inner.adapter().map(|a| a.statistics())
    }

    pub fn current_strategy(&self) -> Option<String> {
        self.inner.strategy.read().clone()
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.inner.protocol()
    }

    pub fn context(&self) -> CommunicationContext {
        self.inner.context.read().clone()
    }

    /// Background reconnect attempts made since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Disconnect and stop every timer. The communicator cannot be reused.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let _ = self.disconnect().await;
        self.inner.tasks.lock().cancel_all();
        debug!(device_id = %self.inner.device_id, "Communicator shut down");
    }

    /// Give up on a failed connect and shut down.
    ///
    /// Background retries still pending are cancelled and reported as one
    /// terminal `ConnectionFailed`. Nothing is published when the failure was
    /// already reported.
    pub async fn abandon(&self, error: &ConnectionError) {
        let inner = &self.inner;
        inner.shut_down.store(true, Ordering::SeqCst);
        {
            let _ops = inner.ops.lock().await;
            inner.tasks.lock().reconnect = None;
            if inner.current() == ConnectionState::Error {
                let attempts = inner.reconnect_attempts.load(Ordering::SeqCst).max(1);
                inner.transition(ConnectionState::Disconnected);
                inner.publish_failure(None, attempts, error);
            }
        }
        self.shutdown().await;
    }

    fn connected_adapter(&self) -> ConnectionResult<Arc<dyn ProtocolAdapter>> {
        if self.inner.current() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        self.inner.adapter().ok_or(ConnectionError::NotConnected)
    }
}

impl std::fmt::Debug for DeviceCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCommunicator")
            .field("device_id", &self.inner.device_id)
            .field("state", &self.inner.current())
            .field("protocol", &self.inner.protocol())
            .finish()
    }
}
