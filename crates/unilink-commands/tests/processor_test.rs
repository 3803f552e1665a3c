//! Command processor tests.
//!
//! Tests the processing lifecycle, timeouts, retries and cancellation against
//! a scripted executor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use unilink_commands::{
    CommandExecutor, CommandProcessor, CommandQueue, OverflowPolicy, ProcessorConfig,
    QueueConfig, QueueError,
};
use unilink_core::command::{CommandPayload, CommandStatus, DeviceCommand, DeviceCommandResult};
use unilink_core::error::ControlError;

/// What the scripted executor does for a command id.
#[derive(Clone)]
enum Script {
    Succeed,
    Hang,
    FailTimes(usize),
    Reject,
}

#[derive(Default)]
struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<String>>,
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedExecutor {
    fn script(&self, command_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(command_id.to_string(), script);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, command: &DeviceCommand) -> DeviceCommandResult {
        self.calls.lock().unwrap().push(command.command_id.clone());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            sleep(delay).await;
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&command.command_id)
            .cloned()
            .unwrap_or(Script::Succeed);
        match script {
            Script::Succeed => DeviceCommandResult::completed(command, None, Duration::ZERO),
            Script::Hang => {
                sleep(Duration::from_secs(3600)).await;
                DeviceCommandResult::completed(command, None, Duration::ZERO)
            }
            Script::FailTimes(n) => {
                if self.failures.fetch_add(1, Ordering::SeqCst) < n {
                    DeviceCommandResult::failed(
                        command,
                        ControlError::ExecutionFailed("flaky link".into()),
                        Duration::ZERO,
                    )
                } else {
                    DeviceCommandResult::completed(command, None, Duration::ZERO)
                }
            }
            Script::Reject => DeviceCommandResult::failed(
                command,
                ControlError::DeviceNotRouted(command.device_id.clone()),
                Duration::ZERO,
            ),
        }
    }
}

fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        poll_interval_ms: 10,
        max_concurrent: 4,
        result_channel_capacity: 64,
    }
}

fn create_test_processor(executor: Arc<ScriptedExecutor>) -> CommandProcessor {
    let queue = Arc::new(CommandQueue::with_capacity(100));
    CommandProcessor::new(queue, executor, fast_config())
}

fn switch(device: &str, id: &str) -> DeviceCommand {
    DeviceCommand::new(device, CommandPayload::Switch { on: true }).with_id(id)
}

#[tokio::test]
async fn test_processor_start_stop() {
    let processor = create_test_processor(Arc::new(ScriptedExecutor::default()));
    assert!(!processor.is_running().await);

    processor.start().await;
    processor.start().await;
    assert!(processor.is_running().await);

    processor.stop().await;
    assert!(!processor.is_running().await);
}

#[tokio::test]
async fn test_command_completes() {
    let executor = Arc::new(ScriptedExecutor::default());
    let processor = create_test_processor(executor.clone());
    let mut results = processor.subscribe_results();
    processor.start().await;

    let ticket = processor.submit(switch("lamp", "c1")).await.unwrap();
    assert_eq!(ticket.command_id(), "c1");
    let result = ticket.wait().await;
    assert_eq!(result.status, CommandStatus::Completed);

    let broadcast = results.recv().await.unwrap();
    assert_eq!(broadcast.command_id, "c1");
    assert_eq!(processor.queue().stats().await.processed_count, 1);
    processor.stop().await;
}

#[tokio::test]
async fn test_timeout_resolves_failed_and_queue_moves_on() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("stuck", Script::Hang);
    let processor = create_test_processor(executor.clone());
    processor.start().await;

    let stuck = processor
        .submit(switch("lamp", "stuck").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap();
    let next = processor.submit(switch("plug", "next")).await.unwrap();

    let next_result = tokio::time::timeout(Duration::from_secs(2), next.wait())
        .await
        .expect("second command must not wait for the stuck one");
    assert!(next_result.is_success());

    let stuck_result = tokio::time::timeout(Duration::from_secs(2), stuck.wait())
        .await
        .expect("timeout must resolve the command");
    assert_eq!(stuck_result.status, CommandStatus::Failed);
    assert!(stuck_result.is_timeout());
    assert_eq!(processor.queue().stats().await.timed_out_count, 1);
    processor.stop().await;
}

#[tokio::test]
async fn test_retry_budget() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("flaky", Script::FailTimes(2));
    let processor = create_test_processor(executor.clone());
    processor.start().await;

    let ticket = processor
        .submit(switch("lamp", "flaky").with_retries(2))
        .await
        .unwrap();
    let result = ticket.wait().await;
    assert!(result.is_success());
    assert_eq!(executor.calls().len(), 3);
    processor.stop().await;
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("flaky", Script::FailTimes(10));
    let processor = create_test_processor(executor.clone());
    processor.start().await;

    let result = processor
        .submit(switch("lamp", "flaky").with_retries(1))
        .await
        .unwrap()
        .wait()
        .await;
    assert_eq!(result.status, CommandStatus::Failed);
    assert_eq!(executor.calls().len(), 2);
    processor.stop().await;
}

#[tokio::test]
async fn test_routing_errors_are_not_retried() {
    let executor = Arc::new(ScriptedExecutor::default());
    executor.script("lost", Script::Reject);
    let processor = create_test_processor(executor.clone());
    processor.start().await;

    let result = processor
        .submit(switch("ghost", "lost").with_retries(5))
        .await
        .unwrap()
        .wait()
        .await;
    assert!(matches!(result.error, Some(ControlError::DeviceNotRouted(_))));
    assert_eq!(executor.calls().len(), 1);
    processor.stop().await;
}

#[tokio::test]
async fn test_per_device_order() {
    let executor = Arc::new(ScriptedExecutor::default());
    *executor.delay.lock().unwrap() = Some(Duration::from_millis(20));
    let processor = create_test_processor(executor.clone());

    let mut tickets = Vec::new();
    for i in 0..4 {
        tickets.push(
            processor
                .submit(switch("lamp", &format!("c{}", i)))
                .await
                .unwrap(),
        );
    }
    processor.start().await;
    for ticket in tickets {
        assert!(ticket.wait().await.is_success());
    }
    assert_eq!(executor.calls(), vec!["c0", "c1", "c2", "c3"]);
    processor.stop().await;
}

#[tokio::test]
async fn test_cancel_device() {
    let processor = create_test_processor(Arc::new(ScriptedExecutor::default()));
    let t1 = processor.submit(switch("lamp", "a")).await.unwrap();
    let t2 = processor.submit(switch("lamp", "b")).await.unwrap();
    let other = processor.submit(switch("plug", "c")).await.unwrap();

    assert_eq!(processor.cancel_device("lamp", "device removed").await, 2);
    assert_eq!(t1.wait().await.status, CommandStatus::Cancelled);
    assert_eq!(t2.wait().await.status, CommandStatus::Cancelled);

    assert!(processor.cancel("c").await);
    assert_eq!(other.wait().await.status, CommandStatus::Cancelled);
    assert!(!processor.cancel("c").await);
}

#[tokio::test]
async fn test_eviction_resolves_ticket() {
    let queue = Arc::new(CommandQueue::new(
        QueueConfig::default()
            .with_max_size(1)
            .with_overflow(OverflowPolicy::DropOldest),
    ));
    let processor = CommandProcessor::new(queue, Arc::new(ScriptedExecutor::default()), fast_config());

    let first = processor.submit(switch("lamp", "old")).await.unwrap();
    let _second = processor.submit(switch("lamp", "new")).await.unwrap();
    let evicted = first.wait().await;
    assert_eq!(evicted.status, CommandStatus::Cancelled);
}

#[tokio::test]
async fn test_submit_rejects_invalid_and_duplicate() {
    let processor = create_test_processor(Arc::new(ScriptedExecutor::default()));

    let bad = DeviceCommand::new("lamp", CommandPayload::Dim { level: 200 });
    assert!(matches!(
        processor.submit(bad).await,
        Err(QueueError::InvalidCommand(_))
    ));

    let _ticket = processor.submit(switch("lamp", "same")).await.unwrap();
    assert!(matches!(
        processor.submit(switch("lamp", "same")).await,
        Err(QueueError::DuplicateCommand(_))
    ));
}

#[tokio::test]
async fn test_cancel_all_resolves_every_ticket() {
    let processor = create_test_processor(Arc::new(ScriptedExecutor::default()));
    let a = processor.submit(switch("lamp", "a")).await.unwrap();
    let b = processor.submit(switch("plug", "b")).await.unwrap();

    assert_eq!(processor.cancel_all("shutting down").await, 2);
    assert_eq!(a.wait().await.status, CommandStatus::Cancelled);
    assert_eq!(b.wait().await.status, CommandStatus::Cancelled);
    assert!(processor.queue().is_empty().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_submits_keep_first_ticket() {
    let processor = Arc::new(create_test_processor(Arc::new(ScriptedExecutor::default())));

    let submits = (0..8).map(|_| {
        let processor = processor.clone();
        tokio::spawn(async move { processor.submit(switch("lamp", "twin")).await })
    });
    let mut accepted = Vec::new();
    for handle in futures::future::join_all(submits).await {
        match handle.unwrap() {
            Ok(ticket) => accepted.push(ticket),
            Err(e) => assert!(matches!(e, QueueError::DuplicateCommand(_))),
        }
    }
    assert_eq!(accepted.len(), 1);
    assert_eq!(processor.queue().len().await, 1);

    processor.start().await;
    let result = accepted.pop().unwrap().wait().await;
    assert_eq!(result.status, CommandStatus::Completed);
    processor.stop().await;
}
