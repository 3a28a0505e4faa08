//! Periodic deadline sweep over every pool's queues.
//!
//! Workers already check the deadline when they dequeue an event; the sweep
//! catches events that sit behind a busy or blocked worker.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::pool::WorkerPool;

struct Signal {
    stop: Mutex<bool>,
    wake: Condvar,
}

pub struct Sweeper {
    signal: Arc<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn spawn(pools: Vec<Arc<WorkerPool>>, interval: Duration) -> io::Result<Self> {
        let signal = Arc::new(Signal {
            stop: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("deadline-sweeper".into())
            .spawn(move || run(&pools, interval, &thread_signal))?;
        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        *self.signal.stop.lock() = true;
        self.signal.wake.notify_all();
        if handle.join().is_err() {
            tracing::error!("deadline sweeper panicked");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One pass: expire every queued event whose deadline has passed.
pub(crate) fn sweep(pools: &[Arc<WorkerPool>]) -> usize {
    let mut expired = 0;
    for pool in pools {
        let jobs = pool.take_expired();
        if jobs.is_empty() {
            continue;
        }
        tracing::debug!(pool = pool.name(), count = jobs.len(), "sweeping expired events");
        expired += jobs.len();
        for job in jobs {
            job.expire();
        }
    }
    expired
}

fn run(pools: &[Arc<WorkerPool>], interval: Duration, signal: &Signal) {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "deadline sweeper started");
    loop {
        {
            let mut stop = signal.stop.lock();
            if !*stop {
                signal.wake.wait_for(&mut stop, interval);
            }
            if *stop {
                break;
            }
        }
        sweep(pools);
    }
    tracing::debug!("deadline sweeper stopped");
}
