//! Fixed-size worker pools.
//!
//! Every stage bound to a pool gets its own FIFO lane; workers take from the
//! lanes round-robin so one busy stage cannot starve the others sharing the
//! pool. Shutdown goes through the same queue as the work: one `Poison` job per
//! live worker, served ahead of pending events.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use super::continuation::Context;
use super::event::Event;
use super::stage::StageRef;
use crate::metrics;

pub(crate) enum Job {
    Dispatch {
        stage: StageRef,
        event: Event,
    },
    Resume {
        stage: StageRef,
        event: Event,
        context: Context,
    },
    /// Tells exactly one worker to exit.
    Poison,
}

impl Job {
    fn event(&self) -> Option<&Event> {
        match self {
            Job::Dispatch { event, .. } | Job::Resume { event, .. } => Some(event),
            Job::Poison => None,
        }
    }

    fn is_expired(&self) -> bool {
        self.event().is_some_and(Event::has_expired)
    }

    /// Run the job on the calling thread, expiring it instead if its deadline
    /// has already passed.
    pub(crate) fn run(self) {
        if self.is_expired() {
            self.expire();
            return;
        }
        match self {
            Job::Dispatch { stage, event } => stage.dispatch(event),
            Job::Resume {
                stage,
                event,
                context,
            } => stage.resume(event, context),
            Job::Poison => {}
        }
    }

    pub(crate) fn expire(self) {
        match self {
            Job::Dispatch { event, .. } => event.expire(),
            Job::Resume {
                stage,
                mut event,
                context,
            } => {
                event.restore(stage, context);
                event.expire();
            }
            Job::Poison => {}
        }
    }
}

struct Lane {
    stage: String,
    jobs: VecDeque<Job>,
}

#[derive(Default)]
struct Queues {
    lanes: Vec<Lane>,
    control: VecDeque<Job>,
    cursor: usize,
}

impl Queues {
    fn next_job(&mut self) -> Option<Job> {
        if let Some(job) = self.control.pop_front() {
            return Some(job);
        }
        let n = self.lanes.len();
        for i in 0..n {
            let idx = (self.cursor + i) % n;
            if let Some(job) = self.lanes[idx].jobs.pop_front() {
                self.cursor = (idx + 1) % n;
                return Some(job);
            }
        }
        None
    }

    fn queued(&self) -> usize {
        self.lanes.iter().map(|l| l.jobs.len()).sum()
    }
}

struct Shared {
    name: String,
    queues: Mutex<Queues>,
    ready: Condvar,
    live: AtomicUsize,
    poison_consumed: AtomicUsize,
}

/// Decrements the live-worker count when a worker exits, panics included.
struct LiveGuard<'a>(&'a Shared);

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct WorkerPool {
    size: usize,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize) -> Self {
        Self {
            size,
            shared: Arc::new(Shared {
                name: name.to_string(),
                queues: Mutex::new(Queues::default()),
                ready: Condvar::new(),
                live: AtomicUsize::new(0),
                poison_consumed: AtomicUsize::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configured thread count.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Poison jobs taken by workers since the pool was created.
    pub fn poison_consumed(&self) -> usize {
        self.shared.poison_consumed.load(Ordering::Acquire)
    }

    /// Events waiting across all lanes.
    pub fn queued(&self) -> usize {
        self.shared.queues.lock().queued()
    }

    /// Per-stage queue depth, in lane order.
    pub fn lane_depths(&self) -> Vec<(String, usize)> {
        let q = self.shared.queues.lock();
        q.lanes
            .iter()
            .map(|l| (l.stage.clone(), l.jobs.len()))
            .collect()
    }

    pub(crate) fn add_lane(&self, stage: &str) -> usize {
        let mut q = self.shared.queues.lock();
        q.lanes.push(Lane {
            stage: stage.to_string(),
            jobs: VecDeque::new(),
        });
        q.lanes.len() - 1
    }

    pub(crate) fn lane_len(&self, lane: usize) -> usize {
        let q = self.shared.queues.lock();
        q.lanes.get(lane).map_or(0, |l| l.jobs.len())
    }

    /// Spawn `count` workers. If any spawn fails, the ones already running
    /// are stopped again before the error is returned.
    pub fn start(&self, count: usize) -> io::Result<()> {
        let mut workers = self.workers.lock();
        for i in 0..count {
            let shared = Arc::clone(&self.shared);
            shared.live.fetch_add(1, Ordering::AcqRel);
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.shared.name, i))
                .spawn(move || worker_loop(shared, i));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    self.shared.live.fetch_sub(1, Ordering::AcqRel);
                    tracing::error!(pool = %self.shared.name, worker = i, error = %e, "failed to spawn worker");
                    let started = std::mem::take(&mut *workers);
                    drop(workers);
                    self.stop_workers(started);
                    return Err(e);
                }
            }
        }
        tracing::debug!(pool = %self.shared.name, workers = count, "pool started");
        Ok(())
    }

    pub(crate) fn enqueue(&self, lane: usize, job: Job) {
        {
            let mut q = self.shared.queues.lock();
            let Some(l) = q.lanes.get_mut(lane) else {
                crate::invariant_violation!("pool '{}' has no lane {lane}", self.shared.name);
            };
            l.jobs.push_back(job);
        }
        self.shared.ready.notify_one();
    }

    /// Pull every queued job whose deadline has passed.
    pub(crate) fn take_expired(&self) -> Vec<Job> {
        let mut expired = Vec::new();
        let mut q = self.shared.queues.lock();
        for lane in &mut q.lanes {
            if !lane.jobs.iter().any(Job::is_expired) {
                continue;
            }
            let mut keep = VecDeque::with_capacity(lane.jobs.len());
            for job in lane.jobs.drain(..) {
                if job.is_expired() {
                    expired.push(job);
                } else {
                    keep.push_back(job);
                }
            }
            lane.jobs = keep;
        }
        expired
    }

    /// Stop every worker and wait for them to exit. Jobs still queued are
    /// expired on the calling thread, so each event still reaches a terminal
    /// state; returns how many. Safe to call more than once.
    pub fn shutdown(&self) -> usize {
        let started = std::mem::take(&mut *self.workers.lock());
        if !started.is_empty() {
            self.stop_workers(started);
        }

        let mut expired = 0;
        loop {
            // A completion sink may submit again; drain until the lanes stay empty.
            let leftover: Vec<Job> = {
                let mut q = self.shared.queues.lock();
                q.control.clear();
                q.lanes
                    .iter_mut()
                    .flat_map(|l| l.jobs.drain(..))
                    .collect()
            };
            if leftover.is_empty() {
                break;
            }
            expired += leftover.len();
            for job in leftover {
                job.expire();
            }
        }
        if expired > 0 {
            metrics::add_shutdown_expired(expired);
            tracing::warn!(pool = %self.shared.name, expired, "timed out queued events at shutdown");
        }
        expired
    }

    fn stop_workers(&self, handles: Vec<JoinHandle<()>>) {
        {
            let mut q = self.shared.queues.lock();
            for _ in 0..handles.len() {
                q.control.push_back(Job::Poison);
            }
        }
        self.shared.ready.notify_all();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(pool = %self.shared.name, "worker panicked");
            }
        }
        tracing::debug!(
            pool = %self.shared.name,
            live = self.live_workers(),
            "pool stopped"
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    let _live = LiveGuard(&shared);
    tracing::trace!(pool = %shared.name, worker = index, "worker started");

    loop {
        let job = {
            let mut q = shared.queues.lock();
            loop {
                if let Some(job) = q.next_job() {
                    break job;
                }
                shared.ready.wait(&mut q);
            }
        };

        if let Job::Poison = job {
            shared.poison_consumed.fetch_add(1, Ordering::AcqRel);
            break;
        }
        job.run();
    }

    tracing::trace!(pool = %shared.name, worker = index, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::event::Payload;
    use crate::pipeline::stage::test_support::recording_stage;

    #[test]
    fn lanes_are_served_round_robin() {
        let mut q = Queues::default();
        for name in ["a", "b"] {
            q.lanes.push(Lane {
                stage: name.to_string(),
                jobs: VecDeque::new(),
            });
        }
        let (a, _) = recording_stage("a");
        let (b, _) = recording_stage("b");
        for _ in 0..2 {
            q.lanes[0].jobs.push_back(Job::Dispatch {
                stage: a.clone(),
                event: Event::new(Payload::Raw(Vec::new())),
            });
        }
        q.lanes[1].jobs.push_back(Job::Dispatch {
            stage: b.clone(),
            event: Event::new(Payload::Raw(Vec::new())),
        });

        let order: Vec<String> = std::iter::from_fn(|| q.next_job())
            .map(|job| match job {
                Job::Dispatch { stage, event } => {
                    event.finish();
                    stage.name().to_string()
                }
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, ["a", "b", "a"]);
    }

    #[test]
    fn poison_is_served_before_lanes() {
        let mut q = Queues::default();
        q.lanes.push(Lane {
            stage: "a".to_string(),
            jobs: VecDeque::new(),
        });
        let (a, _) = recording_stage("a");
        q.lanes[0].jobs.push_back(Job::Dispatch {
            stage: a,
            event: Event::new(Payload::Raw(Vec::new())),
        });
        q.control.push_back(Job::Poison);
        assert!(matches!(q.next_job(), Some(Job::Poison)));
        assert!(matches!(q.next_job(), Some(Job::Dispatch { .. })));
    }

    #[test]
    fn start_and_shutdown_converge() {
        let pool = WorkerPool::new("p", 3);
        pool.start(3).unwrap();
        assert_eq!(pool.live_workers(), 3);
        assert_eq!(pool.shutdown(), 0);
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.poison_consumed(), 3);
        assert_eq!(pool.shutdown(), 0);
    }

    #[test]
    fn shutdown_times_out_queued_jobs() {
        let pool = WorkerPool::new("p", 1);
        let lane = pool.add_lane("a");
        let (stage, log) = recording_stage("a");

        let (dispatch, dispatch_ticket) = Event::with_ticket(Payload::Raw(b"queued".to_vec()));
        pool.enqueue(
            lane,
            Job::Dispatch {
                stage: stage.clone(),
                event: dispatch,
            },
        );
        let (resume, resume_ticket) = Event::with_ticket(Payload::Raw(b"resume".to_vec()));
        pool.enqueue(
            lane,
            Job::Resume {
                stage,
                event: resume,
                context: None,
            },
        );

        assert_eq!(pool.shutdown(), 2);
        assert_eq!(pool.queued(), 0);
        for ticket in [dispatch_ticket, resume_ticket] {
            assert_eq!(ticket.wait().unwrap().state, crate::pipeline::EventState::TimedOut);
        }
        // Only the queued resume had a continuation to time out.
        assert_eq!(log.lock().as_slice(), ["timeout a"]);
        assert_eq!(pool.shutdown(), 0);
    }

    #[test]
    fn shutdown_without_start_is_noop() {
        let pool = WorkerPool::new("idle", 2);
        assert_eq!(pool.shutdown(), 0);
        assert_eq!(pool.live_workers(), 0);
    }
}
