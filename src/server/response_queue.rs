//! Worker → reactor response channel.
//!
//! Stage code finishes events on arbitrary worker threads, but only the
//! reactor thread touches sockets. Responses travel over a multi-producer
//! disruptor ring; after publishing, the producer pokes an eventfd so the
//! reactor wakes up and drains the ring.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use disruptor::{
    BusySpin, EventPoller, MultiProducer, MultiProducerBarrier, Producer, RingBufferFull,
    SingleConsumerBarrier, build_multi_producer,
};

use crate::metrics;

/// Response ring capacity. Must be a power of two.
pub const RESPONSE_QUEUE_SIZE: usize = 65536;

/// One framed response addressed to a connection.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    /// Slab key of the connection on the reactor.
    pub key: usize,
    /// Connection id, to reject responses for a recycled slab key.
    pub conn_id: u64,
    /// NUL-terminated wire bytes.
    pub frame: Vec<u8>,
    /// Set on the reply that finishes the connection's current request.
    pub completes: bool,
}

pub type RespProducer = MultiProducer<ResponseSlot, SingleConsumerBarrier>;
pub type RespPoller = EventPoller<ResponseSlot, MultiProducerBarrier>;

/// Wakes the reactor out of its blocking wait.
#[derive(Debug)]
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    /// Reset the counter; only the readiness-based reactor needs this.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Producer half. Each connection holds its own clone behind its send lock.
#[derive(Clone)]
pub struct ResponseProducer {
    producer: RespProducer,
    waker: Arc<Waker>,
}

impl ResponseProducer {
    /// Publish one frame and wake the reactor. Gives up and returns `false`
    /// if `closed` is raised while the ring is full.
    pub fn send(
        &mut self,
        key: usize,
        conn_id: u64,
        frame: Vec<u8>,
        completes: bool,
        closed: &AtomicBool,
    ) -> bool {
        let mut frame = Some(frame);
        loop {
            match self.producer.try_publish(|slot| {
                slot.key = key;
                slot.conn_id = conn_id;
                slot.frame = frame.take().unwrap_or_default();
                slot.completes = completes;
            }) {
                Ok(_) => {
                    metrics::inc_resp_occ();
                    break;
                }
                Err(RingBufferFull) => {
                    metrics::inc_resp_ring_full();
                    if closed.load(Ordering::Acquire) {
                        return false;
                    }
                    // Let the reactor drain.
                    self.waker.wake();
                    std::hint::spin_loop();
                }
            }
        }
        self.waker.wake();
        true
    }

    pub fn waker(&self) -> &Arc<Waker> {
        &self.waker
    }
}

/// Build the producer/poller pair for one reactor.
pub fn build_response_channel(capacity: usize, waker: Arc<Waker>) -> (ResponseProducer, RespPoller) {
    let builder = build_multi_producer(capacity, ResponseSlot::default, BusySpin);
    let (poller, builder) = builder.event_poller();
    let producer = builder.build();

    (ResponseProducer { producer, waker }, poller)
}
