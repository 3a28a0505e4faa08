#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Pipeline (cumulative)
    static EVENTS_SUBMITTED: AtomicU64 = AtomicU64::new(0);
    static EVENTS_COMPLETED: AtomicU64 = AtomicU64::new(0);
    static EVENTS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
    static EVENTS_DISCARDED: AtomicU64 = AtomicU64::new(0);
    static SHUTDOWN_EXPIRED: AtomicU64 = AtomicU64::new(0);
    // Front end (cumulative)
    static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static CONNECTIONS_CLOSED: AtomicU64 = AtomicU64::new(0);
    static REQUESTS_READ: AtomicU64 = AtomicU64::new(0);
    static RESPONSES_WRITTEN: AtomicU64 = AtomicU64::new(0);
    static OVERSIZED: AtomicU64 = AtomicU64::new(0);
    static RESP_RING_FULL: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static RESP_OCC: AtomicUsize = AtomicUsize::new(0);
    static RESP_MAX_OCC: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Clone, Copy, Default)]
    pub struct MetricsSnapshot {
        pub events_submitted: u64,
        pub events_completed: u64,
        pub events_timed_out: u64,
        pub events_discarded: u64,
        pub shutdown_expired: u64,
        pub connections_accepted: u64,
        pub connections_closed: u64,
        pub requests_read: u64,
        pub responses_written: u64,
        pub oversized: u64,
        pub resp_ring_full: u64,
        pub resp_occ: usize,
        pub resp_max_occ: usize,
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_events_submitted() {
        EVENTS_SUBMITTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_completed() {
        EVENTS_COMPLETED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_timed_out() {
        EVENTS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_events_discarded() {
        EVENTS_DISCARDED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_shutdown_expired(n: usize) {
        SHUTDOWN_EXPIRED.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_connections_accepted() {
        CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_connections_closed() {
        CONNECTIONS_CLOSED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_requests_read() {
        REQUESTS_READ.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_responses_written() {
        RESPONSES_WRITTEN.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_oversized() {
        OVERSIZED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resp_ring_full() {
        RESP_RING_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_resp_occ() {
        let v = RESP_OCC.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&RESP_MAX_OCC, v);
    }

    pub fn dec_resp_occ() {
        RESP_OCC.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            events_submitted: EVENTS_SUBMITTED.load(Ordering::Relaxed),
            events_completed: EVENTS_COMPLETED.load(Ordering::Relaxed),
            events_timed_out: EVENTS_TIMED_OUT.load(Ordering::Relaxed),
            events_discarded: EVENTS_DISCARDED.load(Ordering::Relaxed),
            shutdown_expired: SHUTDOWN_EXPIRED.load(Ordering::Relaxed),
            connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
            connections_closed: CONNECTIONS_CLOSED.load(Ordering::Relaxed),
            requests_read: REQUESTS_READ.load(Ordering::Relaxed),
            responses_written: RESPONSES_WRITTEN.load(Ordering::Relaxed),
            oversized: OVERSIZED.load(Ordering::Relaxed),
            resp_ring_full: RESP_RING_FULL.load(Ordering::Relaxed),
            resp_occ: RESP_OCC.load(Ordering::Relaxed),
            resp_max_occ: RESP_MAX_OCC.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(|| {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let snap = snapshot();
                    tracing::info!(
                        interval_s = INTERVAL_SECS,
                        submitted = snap.events_submitted.saturating_sub(last.events_submitted),
                        completed = snap.events_completed.saturating_sub(last.events_completed),
                        timed_out = snap.events_timed_out.saturating_sub(last.events_timed_out),
                        discarded = snap.events_discarded.saturating_sub(last.events_discarded),
                        shutdown_expired = snap.shutdown_expired.saturating_sub(last.shutdown_expired),
                        accepted = snap.connections_accepted.saturating_sub(last.connections_accepted),
                        closed = snap.connections_closed.saturating_sub(last.connections_closed),
                        requests = snap.requests_read.saturating_sub(last.requests_read),
                        responses = snap.responses_written.saturating_sub(last.responses_written),
                        oversized = snap.oversized.saturating_sub(last.oversized),
                        resp_ring_full = snap.resp_ring_full.saturating_sub(last.resp_ring_full),
                        resp_occ = snap.resp_occ,
                        resp_max = snap.resp_max_occ,
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "metrics reporter not started");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Debug, Clone, Copy, Default)]
    pub struct MetricsSnapshot {
        pub events_submitted: u64,
        pub events_completed: u64,
        pub events_timed_out: u64,
        pub events_discarded: u64,
        pub shutdown_expired: u64,
        pub connections_accepted: u64,
        pub connections_closed: u64,
        pub requests_read: u64,
        pub responses_written: u64,
        pub oversized: u64,
        pub resp_ring_full: u64,
        pub resp_occ: usize,
        pub resp_max_occ: usize,
    }

    pub fn inc_events_submitted() {}
    pub fn inc_events_completed() {}
    pub fn inc_events_timed_out() {}
    pub fn inc_events_discarded() {}
    pub fn add_shutdown_expired(_: usize) {}
    pub fn inc_connections_accepted() {}
    pub fn inc_connections_closed() {}
    pub fn inc_requests_read() {}
    pub fn inc_responses_written() {}
    pub fn inc_oversized() {}
    pub fn inc_resp_ring_full() {}
    pub fn inc_resp_occ() {}
    pub fn dec_resp_occ() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
