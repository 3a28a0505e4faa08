use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::ptr;

use io_uring::{IoUring, opcode, squeue::Entry, types::Fd};
use socket2::Socket;

use super::Core;
use super::connection::CloseReason;
use crate::error::ServerError;

/// Encode operation type + connection key into io_uring user_data.
const OP_ACCEPT: u64 = 0;
const OP_READ: u64 = 1;
const OP_WRITE: u64 = 2;
const OP_WAKE: u64 = 3;

const RING_ENTRIES: u32 = 4096;

fn encode_user_data(op: u64, key: usize) -> u64 {
    (op << 32) | key as u64
}

fn decode_user_data(user_data: u64) -> (u64, usize) {
    (user_data >> 32, (user_data as u32) as usize)
}

pub(super) fn create_ring() -> io::Result<IoUring> {
    IoUring::new(RING_ENTRIES)
}

fn is_retryable(result: i32) -> bool {
    result == -libc::EAGAIN || result == -libc::EINTR
}

// `ring` is declared first so it is dropped before the buffers it points into.
pub(super) struct UringReactor {
    ring: IoUring,
    core: Core,
    wake_buf: Box<u64>,
}

impl UringReactor {
    pub fn new(ring: IoUring, core: Core) -> Self {
        Self {
            ring,
            core,
            wake_buf: Box::new(0),
        }
    }

    pub fn run(mut self) -> Result<(), ServerError> {
        self.submit_accept()?;
        self.submit_wake_read()?;

        while !self.core.stop_requested() {
            self.wait()?;
            for (user_data, result) in self.reap() {
                let (op, key) = decode_user_data(user_data);
                match op {
                    OP_ACCEPT => self.on_accept(result)?,
                    OP_READ => self.on_read(key, result)?,
                    OP_WRITE => self.on_write(key, result)?,
                    OP_WAKE => self.on_wake()?,
                    _ => {}
                }
            }
        }

        self.quiesce()
    }

    fn wait(&mut self) -> Result<(), ServerError> {
        match self.ring.submit_and_wait(1) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(()),
            Err(e) => Err(ServerError::Io(e)),
        }
    }

    fn reap(&mut self) -> Vec<(u64, i32)> {
        self.ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect()
    }

    /// Push an SQE, flushing the submission queue if full.
    fn push(&mut self, sqe: &Entry) -> io::Result<()> {
        loop {
            // Buffers referenced by `sqe` live in `core.conns` or `wake_buf`
            // and stay put until the matching completion is reaped.
            let pushed = unsafe { self.ring.submission().push(sqe) };
            match pushed {
                Ok(()) => return Ok(()),
                Err(_) => {
                    self.ring.submit()?;
                }
            }
        }
    }

    fn on_accept(&mut self, result: i32) -> Result<(), ServerError> {
        if result >= 0 {
            let socket = unsafe { Socket::from_raw_fd(result as RawFd) };
            if let Some(key) = self.core.register(socket) {
                self.submit_read(key)?;
            }
        } else if !is_retryable(result) {
            tracing::warn!(error = %io::Error::from_raw_os_error(-result), "accept failed");
        }
        if !self.core.stop_requested() {
            self.submit_accept()?;
        }
        Ok(())
    }

    fn on_read(&mut self, key: usize, result: i32) -> Result<(), ServerError> {
        let Some(conn) = self.core.conns.get_mut(key) else {
            return Ok(());
        };
        conn.read_inflight = false;
        if conn.closing.is_some() {
            self.release_if_idle(key);
            return Ok(());
        }
        if is_retryable(result) {
            return Ok(self.submit_read(key)?);
        }
        if result <= 0 {
            let reason = if result == 0 {
                CloseReason::PeerClosed
            } else {
                CloseReason::ReadError
            };
            self.close(key, reason);
            return Ok(());
        }

        conn.read_len += result as usize;
        match self.core.dispatch_requests(key) {
            Ok(()) => self.submit_read(key)?,
            Err(reason) => self.close(key, reason),
        }
        Ok(())
    }

    fn on_write(&mut self, key: usize, result: i32) -> Result<(), ServerError> {
        let Some(conn) = self.core.conns.get_mut(key) else {
            return Ok(());
        };
        conn.write_inflight = false;
        if conn.closing.is_some() {
            self.release_if_idle(key);
            return Ok(());
        }
        if result < 0 && !is_retryable(result) {
            self.close(key, CloseReason::WriteError);
            return Ok(());
        }
        if result > 0 {
            conn.advance_write(result as usize);
        }
        Ok(self.submit_write(key)?)
    }

    fn on_wake(&mut self) -> Result<(), ServerError> {
        for key in self.core.drain_responses() {
            self.submit_write(key)?;
        }
        if !self.core.stop_requested() {
            self.submit_wake_read()?;
        }
        Ok(())
    }

    fn close(&mut self, key: usize, reason: CloseReason) {
        self.core.begin_close(key, reason);
        self.release_if_idle(key);
    }

    /// Free the slot once the kernel no longer references its buffers;
    /// otherwise shut the socket down so the pending ops complete.
    fn release_if_idle(&mut self, key: usize) {
        let Some(conn) = self.core.conns.get(key) else {
            return;
        };
        if conn.ops_in_flight() {
            let _ = conn.socket.shutdown(Shutdown::Both);
        } else {
            self.core.release(key);
        }
    }

    /// Stop every connection and wait for their in-flight ops to complete.
    fn quiesce(&mut self) -> Result<(), ServerError> {
        self.core.close_all();
        let keys: Vec<usize> = self.core.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.close(key, CloseReason::Shutdown);
        }
        while self.core.conns.iter().any(|(_, c)| c.ops_in_flight()) {
            self.wait()?;
            for (user_data, _) in self.reap() {
                let (op, key) = decode_user_data(user_data);
                let Some(conn) = self.core.conns.get_mut(key) else {
                    continue;
                };
                match op {
                    OP_READ => conn.read_inflight = false,
                    OP_WRITE => conn.write_inflight = false,
                    _ => continue,
                }
                self.release_if_idle(key);
            }
        }
        Ok(())
    }

    fn submit_accept(&mut self) -> io::Result<()> {
        let sqe = opcode::Accept::new(
            Fd(self.core.listener.as_raw_fd()),
            ptr::null_mut(),
            ptr::null_mut(),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build()
        .user_data(encode_user_data(OP_ACCEPT, 0));
        self.push(&sqe)
    }

    fn submit_read(&mut self, key: usize) -> io::Result<()> {
        let Some(conn) = self.core.conns.get_mut(key) else {
            return Ok(());
        };
        if conn.read_inflight || conn.closing.is_some() {
            return Ok(());
        }
        conn.read_inflight = true;

        let fd = conn.socket.as_raw_fd();
        let space = conn.read_space();
        let sqe = opcode::Read::new(Fd(fd), space.as_mut_ptr(), space.len() as u32)
            .build()
            .user_data(encode_user_data(OP_READ, key));
        self.push(&sqe)
    }

    fn submit_write(&mut self, key: usize) -> io::Result<()> {
        let Some(conn) = self.core.conns.get_mut(key) else {
            return Ok(());
        };
        if conn.closing.is_some() || !conn.stage_write() {
            return Ok(());
        }
        conn.write_inflight = true;

        let fd = conn.socket.as_raw_fd();
        let out = conn.unwritten();
        let sqe = opcode::Write::new(Fd(fd), out.as_ptr(), out.len() as u32)
            .build()
            .user_data(encode_user_data(OP_WRITE, key));
        self.push(&sqe)
    }

    fn submit_wake_read(&mut self) -> io::Result<()> {
        let buf = &mut *self.wake_buf as *mut u64 as *mut u8;
        let sqe = opcode::Read::new(Fd(self.core.waker.as_raw_fd()), buf, 8)
            .build()
            .user_data(encode_user_data(OP_WAKE, 0));
        self.push(&sqe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_round_trips_op_and_key() {
        let ud = encode_user_data(OP_WRITE, 4095);
        assert_eq!(decode_user_data(ud), (OP_WRITE, 4095));
        assert_eq!(decode_user_data(encode_user_data(OP_ACCEPT, 0)), (OP_ACCEPT, 0));
    }
}
