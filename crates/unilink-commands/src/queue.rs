//! Command queue for device command management.
//!
//! Commands are buffered per target device. Each device queue is bounded by
//! [`QueueConfig::max_size`]; when it is full the configured
//! [`OverflowPolicy`] either rejects the new command or evicts the oldest one.
//!
//! Ordering is stable: every entry gets a global sequence number at enqueue
//! time and entries with the same rank leave in sequence order. In priority
//! mode the rank is the command priority, in FIFO mode every entry has the
//! same rank.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use unilink_core::command::{CommandPriority, CommandStatus, DeviceCommand, DeviceCommandResult};
use unilink_core::config::{OverflowPolicy, QueueConfig, QueueOrdering};
use unilink_core::error::ControlError;

/// A queued command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub command: DeviceCommand,
    pub enqueued_at: DateTime<Utc>,
    /// Execution attempts already made (0 for a fresh command)
    pub attempt: u32,
    sequence: u64,
}

impl QueueEntry {
    /// Global arrival order of this entry.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Total number of commands in queue
    pub total_count: usize,
    /// Devices with at least one queued command
    pub device_count: usize,
    /// Count by priority
    pub by_priority: [(String, usize); 4],
    /// Commands evicted to make room
    pub evicted_count: u64,
    /// Commands refused because a queue was full
    pub rejected_count: u64,
    /// Commands that completed
    pub processed_count: u64,
    /// Commands that failed, timeouts included
    pub failed_count: u64,
    /// Commands that failed with a timeout
    pub timed_out_count: u64,
    /// Commands cancelled while queued or in flight
    pub cancelled_count: u64,
}

/// Queue error types.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue for device {device_id} is full (capacity {capacity})")]
    Full { device_id: String, capacity: usize },

    #[error("Queue is closed")]
    Closed,

    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] ControlError),

    #[error("Duplicate command id: {0}")]
    DuplicateCommand(String),
}

/// Sort key: rank first, then arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    rank: Reverse<u8>,
    sequence: u64,
}

#[derive(Default)]
struct Counters {
    evicted: u64,
    rejected: u64,
    processed: u64,
    failed: u64,
    timed_out: u64,
    cancelled: u64,
}

/// Inner queue data.
#[derive(Default)]
struct QueueInner {
    devices: HashMap<String, BTreeMap<QueueKey, QueueEntry>>,
    next_sequence: u64,
    counters: Counters,
    closed: bool,
}

impl QueueInner {
    fn total(&self) -> usize {
        self.devices.values().map(BTreeMap::len).sum()
    }

    fn pop_device(&mut self, device_id: &str) -> Option<QueueEntry> {
        let queue = self.devices.get_mut(device_id)?;
        let entry = queue.pop_first().map(|(_, entry)| entry);
        if queue.is_empty() {
            self.devices.remove(device_id);
        }
        entry
    }
}

/// Bounded per-device command queue.
pub struct CommandQueue {
    config: QueueConfig,
    inner: Arc<RwLock<QueueInner>>,
    notify: Arc<Notify>,
}

impl CommandQueue {
    /// Create a new command queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(QueueInner::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Priority queue bounded at `max_size` per device, rejecting when full.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::new(QueueConfig::default().with_max_size(max_size))
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn key_for(&self, priority: CommandPriority, sequence: u64) -> QueueKey {
        let rank = match self.config.ordering {
            QueueOrdering::Priority => priority.value(),
            QueueOrdering::Fifo => 0,
        };
        QueueKey {
            rank: Reverse(rank),
            sequence,
        }
    }

    /// Enqueue a fresh command.
    ///
    /// The command is validated first. Returns the entry evicted to make room,
    /// if the overflow policy is [`OverflowPolicy::DropOldest`] and the device
    /// queue was full.
    pub async fn enqueue(&self, command: DeviceCommand) -> Result<Option<QueueEntry>, QueueError> {
        command.validate()?;
        self.push(command, 0).await
    }

    /// Put a command back for another attempt. It queues behind everything
    /// already waiting at its rank.
    pub async fn requeue(
        &self,
        command: DeviceCommand,
        attempt: u32,
    ) -> Result<Option<QueueEntry>, QueueError> {
        self.push(command, attempt).await
    }

    async fn push(
        &self,
        command: DeviceCommand,
        attempt: u32,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let mut inner = self.inner.write().await;
        if inner.closed {
            return Err(QueueError::Closed);
        }

        let capacity = self.config.max_size.max(1);
        let device_id = command.device_id.clone();
        let queued = inner.devices.get(&device_id).map_or(0, BTreeMap::len);

        let mut evicted = None;
        if queued >= capacity {
            match self.config.overflow {
                OverflowPolicy::Reject => {
                    inner.counters.rejected += 1;
                    return Err(QueueError::Full {
                        device_id,
                        capacity,
                    });
                }
                OverflowPolicy::DropOldest => {
                    evicted = inner.devices.get_mut(&device_id).and_then(|queue| {
                        let oldest = queue.keys().min_by_key(|key| key.sequence).copied()?;
                        queue.remove(&oldest)
                    });
                    if let Some(entry) = &evicted {
                        inner.counters.evicted += 1;
                        warn!(
                            device_id = %device_id,
                            command_id = %entry.command.command_id,
                            "Queue full, evicted oldest command"
                        );
                    }
                }
            }
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let key = self.key_for(command.priority, sequence);
        debug!(
            device_id = %device_id,
            command_id = %command.command_id,
            priority = %command.priority,
            attempt,
            "Command enqueued"
        );
        let entry = QueueEntry {
            command,
            enqueued_at: Utc::now(),
            attempt,
            sequence,
        };
        inner.devices.entry(device_id).or_default().insert(key, entry);
        drop(inner);

        self.notify.notify_one();
        Ok(evicted)
    }

    /// Dequeue the next command for one device.
    pub async fn dequeue(&self, device_id: &str) -> Option<QueueEntry> {
        self.inner.write().await.pop_device(device_id)
    }

    /// Dequeue the next command across all devices.
    pub async fn dequeue_next(&self) -> Option<QueueEntry> {
        self.dequeue_next_where(|_| true).await
    }

    /// Dequeue the next command across devices accepted by `eligible`.
    ///
    /// Heads of the device queues are compared by rank, then arrival.
    pub async fn dequeue_next_where<F>(&self, eligible: F) -> Option<QueueEntry>
    where
        F: Fn(&str) -> bool,
    {
        let mut inner = self.inner.write().await;
        let device_id = inner
            .devices
            .iter()
            .filter(|(device_id, _)| eligible(device_id))
            .filter_map(|(device_id, queue)| queue.keys().next().map(|key| (*key, device_id)))
            .min_by_key(|(key, _)| *key)
            .map(|(_, device_id)| device_id.clone())?;
        inner.pop_device(&device_id)
    }

    /// Remove one queued command.
    pub async fn remove(&self, command_id: &str) -> Option<QueueEntry> {
        let mut inner = self.inner.write().await;
        let (device_id, key) = inner.devices.iter().find_map(|(device_id, queue)| {
            queue
                .iter()
                .find(|(_, entry)| entry.command.command_id == command_id)
                .map(|(key, _)| (device_id.clone(), *key))
        })?;
        let queue = inner.devices.get_mut(&device_id)?;
        let entry = queue.remove(&key);
        if queue.is_empty() {
            inner.devices.remove(&device_id);
        }
        entry
    }

    /// Remove every queued command for a device, in dequeue order.
    pub async fn cancel_device(&self, device_id: &str) -> Vec<QueueEntry> {
        let mut inner = self.inner.write().await;
        inner
            .devices
            .remove(device_id)
            .map(|queue| queue.into_values().collect())
            .unwrap_or_default()
    }

    /// Get the current queue size.
    pub async fn len(&self) -> usize {
        self.inner.read().await.total()
    }

    /// Commands queued for one device.
    pub async fn len_for(&self, device_id: &str) -> usize {
        self.inner
            .read()
            .await
            .devices
            .get(device_id)
            .map_or(0, BTreeMap::len)
    }

    /// Check if queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.devices.is_empty()
    }

    /// Queued commands of one device in dequeue order.
    pub async fn snapshot(&self, device_id: &str) -> Vec<QueueEntry> {
        self.inner
            .read()
            .await
            .devices
            .get(device_id)
            .map(|queue| queue.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Clear all commands from the queue and return them.
    pub async fn clear(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.write().await;
        let mut entries: Vec<QueueEntry> = inner
            .devices
            .drain()
            .flat_map(|(_, queue)| queue.into_values())
            .collect();
        entries.sort_by_key(QueueEntry::sequence);
        entries
    }

    /// Stop accepting commands. Queued entries stay until dequeued or cleared.
    pub async fn close(&self) {
        self.inner.write().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.read().await.closed
    }

    /// Wait until a command is enqueued.
    pub async fn notified(&self) {
        self.notify.notified().await
    }

    /// Count a terminal result in the statistics.
    pub async fn record_result(&self, result: &DeviceCommandResult) {
        let mut inner = self.inner.write().await;
        match result.status {
            CommandStatus::Completed => inner.counters.processed += 1,
            CommandStatus::Failed => {
                inner.counters.failed += 1;
                if result.is_timeout() {
                    inner.counters.timed_out += 1;
                }
            }
            CommandStatus::Cancelled => inner.counters.cancelled += 1,
        }
    }

    /// Get queue statistics.
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.read().await;

        let mut by_priority: [(String, usize); 4] =
            CommandPriority::ALL.map(|p| (p.type_name().to_string(), 0));
        for entry in inner.devices.values().flat_map(BTreeMap::values) {
            let idx = (entry.command.priority.value() as usize).saturating_sub(1);
            if let Some(slot) = by_priority.get_mut(idx) {
                slot.1 += 1;
            }
        }

        QueueStats {
            total_count: inner.total(),
            device_count: inner.devices.len(),
            by_priority,
            evicted_count: inner.counters.evicted,
            rejected_count: inner.counters.rejected,
            processed_count: inner.counters.processed,
            failed_count: inner.counters.failed,
            timed_out_count: inner.counters.timed_out,
            cancelled_count: inner.counters.cancelled,
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}
