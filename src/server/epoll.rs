use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::Core;
use super::connection::CloseReason;
use crate::error::ServerError;

const LISTENER: u64 = u64::MAX;
const WAKER: u64 = u64::MAX - 1;
const MAX_EVENTS: usize = 256;

const READ_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
const WRITE_INTEREST: u32 = READ_INTEREST | libc::EPOLLOUT as u32;

pub(super) struct EpollReactor {
    epfd: OwnedFd,
    core: Core,
    events: Vec<libc::epoll_event>,
    // Keys currently registered with EPOLLOUT.
    want_write: Vec<bool>,
}

impl EpollReactor {
    pub fn new(core: Core) -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let reactor = Self {
            epfd: unsafe { OwnedFd::from_raw_fd(fd) },
            core,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            want_write: Vec::new(),
        };
        reactor.ctl(
            libc::EPOLL_CTL_ADD,
            reactor.core.listener.as_raw_fd(),
            libc::EPOLLIN as u32,
            LISTENER,
        )?;
        reactor.ctl(
            libc::EPOLL_CTL_ADD,
            reactor.core.waker.as_raw_fd(),
            libc::EPOLLIN as u32,
            WAKER,
        )?;
        Ok(reactor)
    }

    pub fn run(mut self) -> Result<(), ServerError> {
        while !self.core.stop_requested() {
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd.as_raw_fd(),
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    -1,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Io(err));
            }

            for i in 0..n as usize {
                let ev = self.events[i];
                let (token, flags) = (ev.u64, ev.events);
                match token {
                    LISTENER => self.accept_all(),
                    WAKER => self.on_wake(),
                    key => {
                        let key = key as usize;
                        if flags & (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                            self.on_readable(key);
                        }
                        if flags & libc::EPOLLOUT as u32 != 0 {
                            self.flush(key);
                        }
                    }
                }
            }
        }

        self.core.close_all();
        let keys: Vec<usize> = self.core.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.close(key, CloseReason::Shutdown);
        }
        Ok(())
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.core.listener.accept() {
                Ok((socket, _)) => {
                    if let Err(e) = socket.set_nonblocking(true) {
                        tracing::warn!(error = %e, "cannot make client socket non-blocking");
                        continue;
                    }
                    let fd = socket.as_raw_fd();
                    let Some(key) = self.core.register(socket) else {
                        continue;
                    };
                    if let Err(e) = self.ctl(libc::EPOLL_CTL_ADD, fd, READ_INTEREST, key as u64) {
                        tracing::error!(error = %e, "epoll registration failed");
                        self.core.begin_close(key, CloseReason::ReadError);
                        self.core.release(key);
                        continue;
                    }
                    if self.want_write.len() <= key {
                        self.want_write.resize(key + 1, false);
                    }
                    self.want_write[key] = false;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_readable(&mut self, key: usize) {
        loop {
            let Some(conn) = self.core.conns.get_mut(key) else {
                return;
            };
            let read = (&conn.socket).read(&mut conn.read_buf[conn.read_len..]);
            match read {
                Ok(0) => return self.close(key, CloseReason::PeerClosed),
                Ok(n) => {
                    conn.read_len += n;
                    if let Err(reason) = self.core.dispatch_requests(key) {
                        return self.close(key, reason);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "read failed");
                    return self.close(key, CloseReason::ReadError);
                }
            }
        }
    }

    fn on_wake(&mut self) {
        self.core.waker.drain();
        for key in self.core.drain_responses() {
            self.flush(key);
        }
    }

    /// Write as much as the socket takes; arm EPOLLOUT for the rest.
    fn flush(&mut self, key: usize) {
        loop {
            let Some(conn) = self.core.conns.get_mut(key) else {
                return;
            };
            if !conn.stage_write() {
                break;
            }
            let written = (&conn.socket).write(conn.unwritten());
            match written {
                Ok(n) => {
                    conn.advance_write(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "write failed");
                    return self.close(key, CloseReason::WriteError);
                }
            }
        }

        let Some(conn) = self.core.conns.get(key) else {
            return;
        };
        let want = conn.has_unsent();
        if want != self.want_write.get(key).copied().unwrap_or(false) {
            let interest = if want { WRITE_INTEREST } else { READ_INTEREST };
            let fd = conn.socket.as_raw_fd();
            if let Err(e) = self.ctl(libc::EPOLL_CTL_MOD, fd, interest, key as u64) {
                tracing::error!(error = %e, "epoll interest update failed");
                return self.close(key, CloseReason::WriteError);
            }
            self.want_write[key] = want;
        }
    }

    fn close(&mut self, key: usize, reason: CloseReason) {
        let Some(conn) = self.core.conns.get(key) else {
            return;
        };
        let fd = conn.socket.as_raw_fd();
        let _ = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0);
        if let Some(flag) = self.want_write.get_mut(key) {
            *flag = false;
        }
        self.core.begin_close(key, reason);
        self.core.release(key);
    }
}
