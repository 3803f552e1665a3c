//! Command queue tests.
//!
//! Covers capacity handling, eviction, cross-device ordering and the
//! priority-stability property.

use proptest::prelude::*;

use unilink_commands::{CommandQueue, OverflowPolicy, QueueConfig, QueueError, QueueOrdering};
use unilink_core::command::{CommandPayload, CommandPriority, DeviceCommand};

fn make_command(device_id: &str, id: &str, priority: CommandPriority) -> DeviceCommand {
    DeviceCommand::new(device_id, CommandPayload::Switch { on: true })
        .with_id(id)
        .with_priority(priority)
}

#[tokio::test]
async fn test_queue_full_rejects() {
    let queue = CommandQueue::with_capacity(2);

    assert!(queue
        .enqueue(make_command("d1", "c1", CommandPriority::Normal))
        .await
        .is_ok());
    assert!(queue
        .enqueue(make_command("d1", "c2", CommandPriority::Normal))
        .await
        .is_ok());

    let result = queue
        .enqueue(make_command("d1", "c3", CommandPriority::Critical))
        .await;
    assert!(matches!(result, Err(QueueError::Full { capacity: 2, .. })));
    assert_eq!(queue.len().await, 2);
    assert_eq!(queue.stats().await.rejected_count, 1);
}

#[tokio::test]
async fn test_capacity_is_per_device() {
    let queue = CommandQueue::with_capacity(1);
    queue
        .enqueue(make_command("d1", "c1", CommandPriority::Normal))
        .await
        .unwrap();
    queue
        .enqueue(make_command("d2", "c2", CommandPriority::Normal))
        .await
        .unwrap();
    assert_eq!(queue.len().await, 2);
    assert_eq!(queue.stats().await.device_count, 2);
}

#[tokio::test]
async fn test_drop_oldest_keeps_capacity() {
    let config = QueueConfig::default()
        .with_max_size(10)
        .with_ordering(QueueOrdering::Priority)
        .with_overflow(OverflowPolicy::DropOldest);
    let queue = CommandQueue::new(config);

    let mut evicted = Vec::new();
    for i in 0..11 {
        let priority = if i % 2 == 0 {
            CommandPriority::High
        } else {
            CommandPriority::Low
        };
        if let Some(entry) = queue
            .enqueue(make_command("lamp", &format!("c{}", i), priority))
            .await
            .unwrap()
        {
            evicted.push(entry.command.command_id);
        }
    }

    assert_eq!(queue.len().await, 10);
    assert_eq!(evicted, vec!["c0".to_string()]);
    let remaining = queue.snapshot("lamp").await;
    assert!(remaining.iter().all(|e| e.command.command_id != "c0"));
    assert_eq!(queue.stats().await.evicted_count, 1);
}

#[tokio::test]
async fn test_dequeue_next_across_devices() {
    let queue = CommandQueue::with_capacity(10);
    queue
        .enqueue(make_command("a", "a-normal", CommandPriority::Normal))
        .await
        .unwrap();
    queue
        .enqueue(make_command("b", "b-normal", CommandPriority::Normal))
        .await
        .unwrap();
    queue
        .enqueue(make_command("b", "b-critical", CommandPriority::Critical))
        .await
        .unwrap();

    let order: Vec<String> = [
        queue.dequeue_next().await,
        queue.dequeue_next().await,
        queue.dequeue_next().await,
    ]
    .into_iter()
    .flatten()
    .map(|e| e.command.command_id)
    .collect();
    assert_eq!(order, vec!["b-critical", "a-normal", "b-normal"]);
    assert!(queue.dequeue_next().await.is_none());
}

#[tokio::test]
async fn test_dequeue_next_where_skips_devices() {
    let queue = CommandQueue::with_capacity(10);
    queue
        .enqueue(make_command("busy", "x", CommandPriority::Critical))
        .await
        .unwrap();
    queue
        .enqueue(make_command("idle", "y", CommandPriority::Low))
        .await
        .unwrap();

    let entry = queue.dequeue_next_where(|d| d != "busy").await.unwrap();
    assert_eq!(entry.command.command_id, "y");
    assert_eq!(queue.len_for("busy").await, 1);
}

#[tokio::test]
async fn test_cancel_device_and_remove() {
    let queue = CommandQueue::with_capacity(10);
    for i in 0..3 {
        queue
            .enqueue(make_command("d1", &format!("c{}", i), CommandPriority::Normal))
            .await
            .unwrap();
    }
    queue
        .enqueue(make_command("d2", "other", CommandPriority::Normal))
        .await
        .unwrap();

    assert!(queue.remove("c1").await.is_some());
    assert!(queue.remove("c1").await.is_none());

    let cancelled = queue.cancel_device("d1").await;
    let ids: Vec<_> = cancelled.iter().map(|e| e.command.command_id.as_str()).collect();
    assert_eq!(ids, vec!["c0", "c2"]);
    assert_eq!(queue.len().await, 1);
}

#[tokio::test]
async fn test_stats_by_priority() {
    let queue = CommandQueue::with_capacity(10);
    queue
        .enqueue(make_command("d", "1", CommandPriority::Low))
        .await
        .unwrap();
    queue
        .enqueue(make_command("d", "2", CommandPriority::Critical))
        .await
        .unwrap();
    queue
        .enqueue(make_command("d", "3", CommandPriority::Critical))
        .await
        .unwrap();

    let stats = queue.stats().await;
    assert_eq!(stats.total_count, 3);
    assert_eq!(stats.by_priority[0].1, 1);
    assert_eq!(stats.by_priority[3].1, 2);
}

fn priority_from(n: u8) -> CommandPriority {
    match n % 4 {
        0 => CommandPriority::Low,
        1 => CommandPriority::Normal,
        2 => CommandPriority::High,
        _ => CommandPriority::Critical,
    }
}

fn drain_order(ordering: QueueOrdering, priorities: &[u8]) -> Vec<(CommandPriority, usize)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(async {
        let queue = CommandQueue::new(
            QueueConfig::default()
                .with_max_size(priorities.len().max(1))
                .with_ordering(ordering),
        );
        for (i, p) in priorities.iter().enumerate() {
            queue
                .enqueue(make_command("dev", &i.to_string(), priority_from(*p)))
                .await
                .unwrap();
        }
        let mut out = Vec::new();
        while let Some(entry) = queue.dequeue("dev").await {
            let arrival: usize = entry.command.command_id.parse().unwrap();
            out.push((entry.command.priority, arrival));
        }
        out
    })
}

proptest! {
    #[test]
    fn prop_priority_order_is_stable(priorities in proptest::collection::vec(0u8..4, 0..40)) {
        let order = drain_order(QueueOrdering::Priority, &priorities);
        prop_assert_eq!(order.len(), priorities.len());
        for pair in order.windows(2) {
            let (p1, a1) = pair[0];
            let (p2, a2) = pair[1];
            prop_assert!(p1 >= p2, "priority increased: {:?} then {:?}", p1, p2);
            if p1 == p2 {
                prop_assert!(a1 < a2, "arrival order broken at equal priority");
            }
        }
    }

    #[test]
    fn prop_fifo_is_arrival_order(priorities in proptest::collection::vec(0u8..4, 0..40)) {
        let order = drain_order(QueueOrdering::Fifo, &priorities);
        let arrivals: Vec<usize> = order.into_iter().map(|(_, a)| a).collect();
        let expected: Vec<usize> = (0..priorities.len()).collect();
        prop_assert_eq!(arrivals, expected);
    }
}
