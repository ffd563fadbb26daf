//! Ordering guarantees of a single queue under concurrent and delayed posting

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use rvoip_message_queue::{FakeClock, HandlerRef, Message, MessageQueue, MessageQueueManager};

fn isolated_queue() -> MessageQueue {
    MessageQueue::builder()
        .manager(Arc::new(MessageQueueManager::new()))
        .build()
}

fn noop_handler() -> Arc<impl Fn(&mut Message) + Send + Sync> {
    Arc::new(|_msg: &mut Message| {})
}

#[test]
fn test_per_producer_order_is_preserved() {
    const PRODUCERS: u32 = 4;
    const PER_PRODUCER: u32 = 500;

    let queue = Arc::new(isolated_queue());
    let handler = noop_handler();

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = queue.clone();
            let handler_ref = HandlerRef::new(&handler);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    queue.post(
                        Some(handler_ref.clone()),
                        producer,
                        Some(Box::new(seq)),
                        false,
                    );
                }
            })
        })
        .collect();

    let mut last_seen: HashMap<u32, u32> = HashMap::new();
    let mut received = 0;
    while received < PRODUCERS * PER_PRODUCER {
        let Some(mut msg) = queue.get(Some(Duration::from_secs(5)), false) else {
            panic!("timed out after {} messages", received);
        };
        let seq = *msg.take_data::<u32>().unwrap();
        if let Some(prev) = last_seen.insert(msg.message_id, seq) {
            assert!(
                seq > prev,
                "producer {} delivered {} after {}",
                msg.message_id,
                seq,
                prev
            );
        }
        received += 1;
    }

    for producer in producers {
        producer.join().unwrap();
    }
    assert!(queue.is_empty());
    assert!(last_seen.values().all(|&last| last == PER_PRODUCER - 1));
}

#[test]
fn test_shorter_delay_delivered_first() {
    let queue = isolated_queue();
    let handler = noop_handler();

    let start = Instant::now();
    queue.post_delayed(Duration::from_millis(100), Some(HandlerRef::new(&handler)), 1, None);
    queue.post_delayed(Duration::from_millis(50), Some(HandlerRef::new(&handler)), 2, None);

    let first = queue.get(Some(Duration::from_secs(5)), false).unwrap();
    assert_eq!(first.message_id, 2);
    assert!(start.elapsed() >= Duration::from_millis(50));

    let second = queue.get(Some(Duration::from_secs(5)), false).unwrap();
    assert_eq!(second.message_id, 1);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_identical_trigger_times_keep_submission_order() {
    let queue = isolated_queue();
    let handler = noop_handler();
    let trigger = Instant::now() + Duration::from_millis(20);

    queue.post_at(trigger, Some(HandlerRef::new(&handler)), 1, None);
    queue.post_at(trigger, Some(HandlerRef::new(&handler)), 2, None);

    let first = queue.get(Some(Duration::from_secs(5)), false).unwrap();
    let second = queue.get(Some(Duration::from_secs(5)), false).unwrap();
    assert_eq!((first.message_id, second.message_id), (1, 2));
}

#[test]
fn test_blocked_get_wakes_for_post_from_other_thread() {
    let queue = Arc::new(isolated_queue());
    let handler = noop_handler();
    let handler_ref = HandlerRef::new(&handler);

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            queue.post(Some(handler_ref), 42, None, false);
        })
    };

    let start = Instant::now();
    let msg = queue.get(None, true).unwrap();
    assert_eq!(msg.message_id, 42);
    assert!(start.elapsed() < Duration::from_secs(5));
    producer.join().unwrap();
}

#[test]
fn test_get_delay_reflects_pending_work() {
    let queue = isolated_queue();
    let handler = noop_handler();
    assert_eq!(queue.get_delay(), None);

    queue.post_delayed(Duration::from_secs(10), Some(HandlerRef::new(&handler)), 1, None);
    let delay = queue.get_delay().unwrap();
    assert!(delay > Duration::from_secs(9) && delay <= Duration::from_secs(10));

    queue.post(Some(HandlerRef::new(&handler)), 2, None, false);
    assert_eq!(queue.get_delay(), Some(Duration::ZERO));
}

proptest! {
    #[test]
    fn prop_delayed_messages_sorted_by_trigger_then_submission(
        delays in proptest::collection::vec(0u64..50, 1..40)
    ) {
        let clock = Arc::new(FakeClock::new());
        let queue = MessageQueue::builder()
            .manager(Arc::new(MessageQueueManager::new()))
            .clock(clock.clone())
            .build();
        let handler = noop_handler();

        for (index, delay) in delays.iter().enumerate() {
            queue.post_delayed(
                Duration::from_millis(*delay),
                Some(HandlerRef::new(&handler)),
                index as u32,
                None,
            );
        }
        clock.advance(Duration::from_millis(50));

        let delivered: Vec<u32> = std::iter::from_fn(|| queue.get(Some(Duration::ZERO), false))
            .map(|msg| msg.message_id)
            .collect();

        let mut expected: Vec<(u64, u32)> = delays
            .iter()
            .enumerate()
            .map(|(index, delay)| (*delay, index as u32))
            .collect();
        expected.sort();
        let expected: Vec<u32> = expected.into_iter().map(|(_, index)| index).collect();

        prop_assert_eq!(delivered, expected);
    }
}
