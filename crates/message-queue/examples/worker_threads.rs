//! Three worker threads, each owning a message queue, fed from the main thread.
//!
//! Run with `cargo run --example worker_threads`; set `RUST_LOG=debug` to see
//! queue lifecycle events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rvoip_message_queue::logging::{log_welcome, setup_logging, LoggingConfig};
use rvoip_message_queue::{
    HandlerId, HandlerRef, Message, MessageHandler, MessageQueue, MessageQueueConfig,
    MessageQueueManager, VERSION,
};
use tracing::{info, Level};

const MSG_FRAME: u32 = 1;
const MSG_STATS: u32 = 2;

/// Sums the samples of every frame it receives
struct FrameMixer {
    name: String,
    samples: AtomicU64,
    frames: AtomicU64,
}

impl MessageHandler for FrameMixer {
    fn on_message(&self, msg: &mut Message) {
        match msg.message_id {
            MSG_FRAME => {
                if let Some(frame) = msg.take_data::<Vec<i16>>() {
                    let sum: u64 = frame.iter().map(|s| s.unsigned_abs() as u64).sum();
                    self.samples.fetch_add(sum, Ordering::Relaxed);
                    self.frames.fetch_add(1, Ordering::Relaxed);
                }
            }
            MSG_STATS => info!(
                mixer = %self.name,
                frames = self.frames.load(Ordering::Relaxed),
                "stats tick"
            ),
            _ => {}
        }
    }
}

impl Drop for FrameMixer {
    fn drop(&mut self) {
        MessageQueueManager::global().clear(HandlerId::of(self));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    setup_logging(LoggingConfig::new(Level::INFO, "worker_threads"))?;
    log_welcome("worker_threads", VERSION);

    let config = MessageQueueConfig::from_toml_str(
        r#"
        max_msg_latency_ms = 100
        slow_dispatch_threshold_ms = 20
        "#,
    )?;

    let mut queues = Vec::new();
    let mut mixers = Vec::new();
    let mut workers = Vec::new();

    for i in 0..3 {
        let name = format!("mixer-{}", i);
        let queue = Arc::new(
            MessageQueue::builder()
                .config(config.clone())
                .name(name.clone())
                .build(),
        );
        let mixer = Arc::new(FrameMixer {
            name,
            samples: AtomicU64::new(0),
            frames: AtomicU64::new(0),
        });

        let consumer = queue.clone();
        workers.push(thread::spawn(move || {
            while let Some(msg) = consumer.get(None, true) {
                consumer.dispatch(msg);
            }
        }));
        queues.push(queue);
        mixers.push(mixer);
    }

    for (queue, mixer) in queues.iter().zip(&mixers) {
        queue.post_delayed(Duration::from_millis(50), Some(HandlerRef::new(mixer)), MSG_STATS, None);
        for n in 0..100i16 {
            let frame = vec![n; 160];
            queue.post(Some(HandlerRef::new(mixer)), MSG_FRAME, Some(Box::new(frame)), true);
        }
    }

    MessageQueueManager::global().process_all_message_queues(None);
    for mixer in &mixers {
        info!(
            mixer = %mixer.name,
            frames = mixer.frames.load(Ordering::Relaxed),
            samples = mixer.samples.load(Ordering::Relaxed),
            "all frames mixed"
        );
    }

    thread::sleep(Duration::from_millis(80));

    // Dropping a mixer purges whatever is still queued for it
    drop(mixers);
    for queue in &queues {
        queue.quit();
    }
    for worker in workers {
        let _ = worker.join();
    }
    drop(queues);

    info!(
        registry_alive = MessageQueueManager::global().is_initialized(),
        "shutdown complete"
    );
    Ok(())
}
