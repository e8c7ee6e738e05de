//! Stress tests for mailbox backpressure and executor ordering
//!
//! Many producers against small mailboxes: nothing may be lost, duplicated
//! or reordered per producer, and shutdown must never hang.

use bluestack_core::{ExecutorConfig, QueueError, Signal, StackResult};
use bluestack_runtime::{
    executor, DispatchTable, PostStatus, TaskContext, TaskExecutor, WaitPolicy,
};
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Test Utilities
// ----------------------------------------------------------------------------

const RECORD: Signal = Signal::new(1);

#[derive(Debug, Default)]
struct Journal {
    entries: Vec<(u32, u32)>,
}

fn on_record(state: &mut Journal, _: &TaskContext<(u32, u32)>, entry: (u32, u32)) -> StackResult<()> {
    state.entries.push(entry);
    Ok(())
}

fn journal_table() -> DispatchTable<Journal, (u32, u32)> {
    let mut table = DispatchTable::new();
    table.register(RECORD, "record", on_record).unwrap();
    table
}

/// Every producer's sequence numbers must appear complete and in order
fn assert_per_producer_fifo(entries: &[(u32, u32)], producers: u32, per_producer: u32) {
    assert_eq!(entries.len() as u32, producers * per_producer);
    for producer in 0..producers {
        let seen: Vec<u32> = entries
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(seen, (0..per_producer).collect::<Vec<_>>());
    }
}

// ----------------------------------------------------------------------------
// Backpressure Tests
// ----------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_against_small_mailbox() {
    const PRODUCERS: u32 = 8;
    const PER_PRODUCER: u32 = 500;

    let (executor, handle) = TaskExecutor::new(
        ExecutorConfig::new("journal", 4),
        journal_table(),
        |_| Journal::default(),
    );
    let runner = tokio::spawn(executor.run_forever());

    let producers = (0..PRODUCERS).map(|producer| {
        let handle = handle.clone();
        tokio::spawn(async move {
            for seq in 0..PER_PRODUCER {
                let status = handle
                    .post(RECORD, (producer, seq), WaitPolicy::BlockingForever)
                    .await;
                assert!(status.is_success());
            }
        })
    });
    for result in join_all(producers).await {
        result.unwrap();
    }

    assert!(handle.shutdown().await.is_success());
    let journal = timeout(Duration::from_secs(10), runner)
        .await
        .expect("executor did not stop")
        .unwrap();

    assert_per_producer_fifo(&journal.entries, PRODUCERS, PER_PRODUCER);
    let stats = handle.stats();
    assert_eq!(stats.processed, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.rejected_posts, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bounded_waits_time_out_while_consumer_is_stalled() {
    let (executor, handle) = TaskExecutor::new(
        ExecutorConfig::new("stalled", 2),
        journal_table(),
        |_| Journal::default(),
    );

    // Nobody runs the executor yet, so the mailbox fills up
    assert!(handle.try_post(RECORD, (0, 0)).is_success());
    assert!(handle.try_post(RECORD, (0, 1)).is_success());

    let waits = (0..4).map(|seq| {
        let handle = handle.clone();
        async move {
            handle
                .post(
                    RECORD,
                    (1, seq),
                    WaitPolicy::BlockingWithTimeout(Duration::from_millis(20)),
                )
                .await
        }
    });
    for status in join_all(waits).await {
        assert!(matches!(status, PostStatus::Fail(QueueError::Timeout { .. })));
    }
    assert_eq!(handle.stats().rejected_posts, 4);

    let runner = tokio::spawn(executor.run_forever());
    assert!(handle.shutdown().await.is_success());
    let journal = runner.await.unwrap();
    assert_eq!(journal.entries, vec![(0, 0), (0, 1)]);
}

// ----------------------------------------------------------------------------
// Dedicated Thread Tests
// ----------------------------------------------------------------------------

#[test]
fn test_os_thread_producers_with_non_blocking_retry() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 250;

    let journal = Arc::new(Mutex::new(Vec::new()));

    fn on_shared_record(
        state: &mut Arc<Mutex<Vec<(u32, u32)>>>,
        _: &TaskContext<(u32, u32)>,
        entry: (u32, u32),
    ) -> StackResult<()> {
        state.lock().unwrap().push(entry);
        Ok(())
    }

    let mut table = DispatchTable::new();
    table.register(RECORD, "record", on_shared_record).unwrap();
    let spawned = executor::spawn(ExecutorConfig::new("shared", 2), table, {
        let journal = journal.clone();
        move |_: &TaskContext<(u32, u32)>| journal
    })
    .unwrap();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let handle = spawned.handle().clone();
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    loop {
                        match handle.try_post(RECORD, (producer, seq)) {
                            PostStatus::Success => break,
                            PostStatus::Fail(QueueError::Full { .. }) => thread::yield_now(),
                            PostStatus::Fail(e) => panic!("unexpected post failure: {}", e),
                        }
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    spawned.shutdown().unwrap();
    assert_per_producer_fifo(&journal.lock().unwrap(), PRODUCERS, PER_PRODUCER);
}

#[test]
fn test_repeated_spawn_and_shutdown_does_not_hang() {
    for round in 0..20 {
        let spawned = executor::spawn(
            ExecutorConfig::new(format!("round-{}", round), 1),
            journal_table(),
            |_| Journal::default(),
        )
        .unwrap();
        let _ = spawned.handle().try_post(RECORD, (round, 0));
        spawned.shutdown().unwrap();
    }
}
