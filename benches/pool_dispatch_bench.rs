//! Benchmark: submit -> worker pool -> two-stage continuation chain, no sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use sedadb::pipeline::{Event, Payload, Registry};
use sedadb::stages;

const CONFIG: &str = r#"
[SEDA_BASE]
ThreadPools = ["SQLThreads", "IOThreads"]
STAGES = ["SessionStage", "EchoStage"]

[SQLThreads]
count = 4

[IOThreads]
count = 4

[SessionStage]
ThreadId = "SQLThreads"
NextStages = "EchoStage"

[EchoStage]
ThreadId = "IOThreads"
"#;

const BATCH: usize = 1024;

fn run_batch(entry: &sedadb::StageRef, done: &Arc<AtomicUsize>, payload: &[u8]) {
    let target = done.load(Ordering::Acquire) + BATCH;
    for _ in 0..BATCH {
        let done = Arc::clone(done);
        let event = Event::new(Payload::Raw(payload.to_vec())).on_complete(move |_| {
            done.fetch_add(1, Ordering::AcqRel);
        });
        entry.submit(event);
    }
    while done.load(Ordering::Acquire) < target {
        std::hint::spin_loop();
    }
}

fn main() {
    let mut registry = Registry::new(stages::default_factory());
    let doc: toml::Table = toml::from_str(CONFIG).expect("bench config");
    registry.init(&doc).expect("pipeline starts");
    let entry = registry.get_stage("SessionStage").expect("entry stage");

    let done = Arc::new(AtomicUsize::new(0));
    let payload = b"select * from bench";

    // Warm up
    for _ in 0..20 {
        run_batch(&entry, &done, payload);
    }

    const TARGET_DURATION: Duration = Duration::from_secs(2);
    let before = done.load(Ordering::Acquire);
    let start = Instant::now();
    let mut batches: u64 = 0;
    while start.elapsed() < TARGET_DURATION {
        run_batch(&entry, &done, payload);
        batches += 1;
    }
    let elapsed = start.elapsed();
    let events = done.load(Ordering::Acquire) - before;

    eprintln!("pool_dispatch: {} events in {:?} ({} batches)", events, elapsed, batches);
    eprintln!(
        "  {:.0} events/s  {:.2} us/batch",
        events as f64 / elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1e6 / batches.max(1) as f64
    );

    registry.cleanup();
}
