//! Command processor for handling command execution.
//!
//! Pulls commands from the [`CommandQueue`] and hands them to a
//! [`CommandExecutor`] with bounded concurrency. Every command runs under its
//! own timeout; an expired timeout resolves the command as failed and frees the
//! slot for the next entry. At most one command per device is in flight, which
//! keeps per-device execution in queue order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, oneshot, watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use unilink_core::command::{CommandId, CommandStatus, DeviceCommand, DeviceCommandResult};
use unilink_core::config::ProcessorConfig;

use crate::queue::{CommandQueue, QueueEntry, QueueError};

/// Executes a single command against a device.
///
/// Implementations fold every failure into a failed [`DeviceCommandResult`];
/// the processor decides about timeouts and retries.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &DeviceCommand) -> DeviceCommandResult;
}

/// Handle on a submitted command.
#[derive(Debug)]
pub struct CommandTicket {
    command: DeviceCommand,
    rx: oneshot::Receiver<DeviceCommandResult>,
}

impl CommandTicket {
    pub fn command_id(&self) -> &str {
        &self.command.command_id
    }

    /// Wait for the terminal result.
    ///
    /// Resolves to a cancelled result if the processor went away before the
    /// command finished.
    pub async fn wait(self) -> DeviceCommandResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => DeviceCommandResult::cancelled(&self.command, "command processor stopped"),
        }
    }
}

/// Command processor.
pub struct CommandProcessor {
    config: ProcessorConfig,
    queue: Arc<CommandQueue>,
    executor: Arc<dyn CommandExecutor>,
    tickets: Arc<DashMap<CommandId, oneshot::Sender<DeviceCommandResult>>>,
    busy_devices: Arc<DashSet<String>>,
    results: broadcast::Sender<DeviceCommandResult>,
    shutdown: watch::Sender<bool>,
    task_handle: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl CommandProcessor {
    /// Create a new command processor.
    pub fn new(
        queue: Arc<CommandQueue>,
        executor: Arc<dyn CommandExecutor>,
        config: ProcessorConfig,
    ) -> Self {
        let (results, _) = broadcast::channel(config.result_channel_capacity.max(1));
        let (shutdown, _) = watch::channel(true);
        Self {
            config,
            queue,
            executor,
            tickets: Arc::new(DashMap::new()),
            busy_devices: Arc::new(DashSet::new()),
            results,
            shutdown,
            task_handle: Arc::new(RwLock::new(None)),
        }
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    /// Subscribe to every terminal command result.
    pub fn subscribe_results(&self) -> broadcast::Receiver<DeviceCommandResult> {
        self.results.subscribe()
    }

    /// Validate and enqueue a command.
    pub async fn submit(&self, command: DeviceCommand) -> Result<CommandTicket, QueueError> {
        let (tx, rx) = oneshot::channel();
        match self.tickets.entry(command.command_id.clone()) {
            Entry::Occupied(_) => return Err(QueueError::DuplicateCommand(command.command_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        match self.queue.enqueue(command.clone()).await {
            Ok(evicted) => {
                if let Some(entry) = evicted {
                    let result = DeviceCommandResult::cancelled(
                        &entry.command,
                        "evicted from full command queue",
                    );
                    finish(&self.queue, &self.tickets, &self.results, result).await;
                }
                Ok(CommandTicket { command, rx })
            }
            Err(e) => {
                self.tickets.remove(&command.command_id);
                Err(e)
            }
        }
    }

    /// Cancel one queued command. In-flight commands run to completion.
    pub async fn cancel(&self, command_id: &str) -> bool {
        match self.queue.remove(command_id).await {
            Some(entry) => {
                let result = DeviceCommandResult::cancelled(&entry.command, "cancelled by caller");
                finish(&self.queue, &self.tickets, &self.results, result).await;
                true
            }
            None => false,
        }
    }

    /// Cancel every queued command for a device. Returns how many were cancelled.
    pub async fn cancel_device(&self, device_id: &str, reason: &str) -> usize {
        let entries = self.queue.cancel_device(device_id).await;
        let count = entries.len();
        for entry in entries {
            let result = DeviceCommandResult::cancelled(&entry.command, reason);
            finish(&self.queue, &self.tickets, &self.results, result).await;
        }
        if count > 0 {
            info!(device_id, count, reason, "Cancelled queued commands");
        }
        count
    }

    /// Cancel everything still queued, for every device.
    pub async fn cancel_all(&self, reason: &str) -> usize {
        let entries = self.queue.clear().await;
        let count = entries.len();
        for entry in entries {
            let result = DeviceCommandResult::cancelled(&entry.command, reason);
            finish(&self.queue, &self.tickets, &self.results, result).await;
        }
        count
    }

    /// Start the processor.
    pub async fn start(&self) {
        let mut task = self.task_handle.write().await;
        if task.is_some() {
            return;
        }
        self.shutdown.send_replace(false);

        let worker = Worker {
            queue: self.queue.clone(),
            executor: self.executor.clone(),
            tickets: self.tickets.clone(),
            busy_devices: self.busy_devices.clone(),
            results: self.results.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent.max(1))),
            poll_interval: self.config.poll_interval(),
        };
        let shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(worker.run(shutdown)));
        info!(
            max_concurrent = self.config.max_concurrent,
            "Command processor started"
        );
    }

    /// Stop the processor. Queued commands stay queued; in-flight commands
    /// finish within their own timeout.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let mut task = self.task_handle.write().await;
        if let Some(handle) = task.take() {
            drop(task);
            handle.await.ok();
            info!("Command processor stopped");
        }
    }

    /// Check if processor is running.
    pub async fn is_running(&self) -> bool {
        self.task_handle.read().await.is_some()
    }

    /// Commands currently executing.
    pub fn in_flight(&self) -> usize {
        self.busy_devices.len()
    }
}

/// Resolve a command: statistics, submitter ticket, broadcast.
async fn finish(
    queue: &CommandQueue,
    tickets: &DashMap<CommandId, oneshot::Sender<DeviceCommandResult>>,
    results: &broadcast::Sender<DeviceCommandResult>,
    result: DeviceCommandResult,
) {
    queue.record_result(&result).await;
    if let Some((_, tx)) = tickets.remove(&result.command_id) {
        let _ = tx.send(result.clone());
    }
    let _ = results.send(result);
}

/// State shared by the dispatch loop and the execution tasks.
#[derive(Clone)]
struct Worker {
    queue: Arc<CommandQueue>,
    executor: Arc<dyn CommandExecutor>,
    tickets: Arc<DashMap<CommandId, oneshot::Sender<DeviceCommandResult>>>,
    busy_devices: Arc<DashSet<String>>,
    results: broadcast::Sender<DeviceCommandResult>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let busy = &self.busy_devices;
            let next = self
                .queue
                .dequeue_next_where(|device_id| !busy.contains(device_id))
                .await;

            let Some(entry) = next else {
                drop(permit);
                tokio::select! {
                    _ = self.queue.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };

            self.busy_devices.insert(entry.command.device_id.clone());
            let worker = self.clone();
            tokio::spawn(async move {
                worker.execute(entry).await;
                drop(permit);
            });
        }
    }

    async fn execute(&self, entry: QueueEntry) {
        let QueueEntry {
            command, attempt, ..
        } = entry;
        debug!(
            command_id = %command.command_id,
            device_id = %command.device_id,
            attempt,
            "Executing command"
        );

        let result = match tokio::time::timeout(command.timeout(), self.executor.execute(&command))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    command_id = %command.command_id,
                    device_id = %command.device_id,
                    timeout_ms = command.timeout_ms,
                    "Command timed out"
                );
                DeviceCommandResult::timed_out(&command)
            }
        };
        self.busy_devices.remove(&command.device_id);

        let retryable = result.status == CommandStatus::Failed
            && !result.is_timeout()
            && result.error.as_ref().is_some_and(|e| e.is_retryable());
        if retryable && attempt < command.max_retries {
            debug!(
                command_id = %command.command_id,
                attempt = attempt + 1,
                max_retries = command.max_retries,
                "Retrying failed command"
            );
            match self.queue.requeue(command.clone(), attempt + 1).await {
                Ok(evicted) => {
                    if let Some(evicted) = evicted {
                        let cancelled = DeviceCommandResult::cancelled(
                            &evicted.command,
                            "evicted from full command queue",
                        );
                        finish(&self.queue, &self.tickets, &self.results, cancelled).await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(command_id = %command.command_id, error = %e, "Retry could not be queued");
                }
            }
        }

        finish(&self.queue, &self.tickets, &self.results, result).await;
    }
}
