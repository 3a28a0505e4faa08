//! Front-end acceptor.
//!
//! One reactor thread owns the listener and every client socket. Complete
//! requests become session events submitted to the entry stage; responses come
//! back from worker threads over the response ring and are written out by the
//! reactor. Two backends share the same [`Core`]: io_uring (completion based)
//! and epoll (readiness based).

pub mod connection;
mod epoll;
pub mod response_queue;
mod uring;

use std::fmt;
use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use disruptor::Polling;
use slab::Slab;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

pub use connection::ConnectionContext;
use connection::{CloseReason, Connection};
use response_queue::{
    RESPONSE_QUEUE_SIZE, RespPoller, ResponseProducer, Waker, build_response_channel,
};

use crate::config::Backend;
use crate::constants::{
    DEFAULT_BACKLOG, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, MAX_CONNECTIONS, TIMEOUT_RESPONSE,
};
use crate::error::ServerError;
use crate::metrics;
use crate::pipeline::{Deadline, Event, EventState, Outcome, Payload, SessionRequest, StageRef};
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: ListenAddr,
    pub backlog: i32,
    /// Receive buffer per connection; a request must fit, terminator included.
    pub max_message_size: usize,
    pub backend: Backend,
    /// Deadline attached to every request event.
    pub request_timeout: Option<Duration>,
    /// Copied into every accepted connection.
    pub session: Session,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: ListenAddr::Tcp(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))),
            backlog: DEFAULT_BACKLOG,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            backend: Backend::Auto,
            request_timeout: None,
            session: Session::default(),
        }
    }
}

/// Asks the reactor to stop after its current dispatch round.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

pub struct Server {
    listener: Socket,
    local: ListenAddr,
    options: ServerOptions,
    entry: StageRef,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
}

fn socket_err(op: &'static str) -> impl FnOnce(io::Error) -> ServerError {
    move |source| ServerError::Socket { op, source }
}

impl Server {
    /// Create the listening socket. Requests will be submitted to `entry`.
    pub fn bind(options: ServerOptions, entry: StageRef) -> Result<Self, ServerError> {
        let (listener, local) = match &options.listen {
            ListenAddr::Tcp(addr) => {
                let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
                    .map_err(socket_err("socket"))?;
                socket
                    .set_reuse_address(true)
                    .map_err(socket_err("SO_REUSEADDR"))?;
                socket.set_nodelay(true).map_err(socket_err("TCP_NODELAY"))?;
                socket.bind(&(*addr).into()).map_err(socket_err("bind"))?;
                let local = socket
                    .local_addr()
                    .map_err(socket_err("getsockname"))?
                    .as_socket()
                    .map_or(ListenAddr::Tcp(*addr), ListenAddr::Tcp);
                (socket, local)
            }
            ListenAddr::Unix(path) => {
                if path.exists() {
                    tracing::debug!(path = %path.display(), "removing stale socket file");
                    fs::remove_file(path).map_err(socket_err("unlink"))?;
                }
                let socket =
                    Socket::new(Domain::UNIX, Type::STREAM, None).map_err(socket_err("socket"))?;
                let addr = SockAddr::unix(path).map_err(socket_err("sockaddr"))?;
                socket.bind(&addr).map_err(socket_err("bind"))?;
                (socket, ListenAddr::Unix(path.clone()))
            }
        };
        listener
            .listen(options.backlog)
            .map_err(socket_err("listen"))?;
        listener
            .set_nonblocking(true)
            .map_err(socket_err("O_NONBLOCK"))?;

        let waker = Arc::new(Waker::new().map_err(ServerError::Reactor)?);
        tracing::info!(addr = %local, backend = ?options.backend, "listening");
        Ok(Self {
            listener,
            local,
            options,
            entry,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// The bound address; for TCP port 0 this carries the real port.
    pub fn local_addr(&self) -> &ListenAddr {
        &self.local
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run the reactor on the calling thread until shut down.
    pub fn run(self) -> Result<(), ServerError> {
        let unix_path = match &self.local {
            ListenAddr::Unix(path) => Some(path.clone()),
            ListenAddr::Tcp(_) => None,
        };

        let ring = match self.options.backend {
            Backend::Epoll => None,
            Backend::Uring => Some(uring::create_ring().map_err(ServerError::Reactor)?),
            Backend::Auto => match uring::create_ring() {
                Ok(ring) => Some(ring),
                Err(e) => {
                    tracing::warn!(error = %e, "io_uring unavailable, falling back to epoll");
                    None
                }
            },
        };

        let (producer, poller) = build_response_channel(RESPONSE_QUEUE_SIZE, Arc::clone(&self.waker));
        let core = Core {
            listener: self.listener,
            is_unix: unix_path.is_some(),
            entry: self.entry,
            request_timeout: self.options.request_timeout,
            session: self.options.session.clone(),
            max_message_size: self.options.max_message_size,
            producer,
            poller,
            waker: self.waker,
            stop: self.stop,
            conns: Slab::with_capacity(MAX_CONNECTIONS),
            next_id: 1,
        };

        let result = match ring {
            Some(ring) => {
                tracing::info!("reactor running on io_uring");
                uring::UringReactor::new(ring, core).run()
            }
            None => {
                tracing::info!("reactor running on epoll");
                epoll::EpollReactor::new(core)
                    .map_err(ServerError::Reactor)?
                    .run()
            }
        };

        if let Some(path) = unix_path {
            let _ = fs::remove_file(path);
        }
        tracing::info!("reactor stopped");
        result
    }

    /// Run the reactor on its own thread.
    pub fn spawn(self) -> Result<RunningServer, ServerError> {
        let shutdown = self.shutdown_handle();
        let addr = self.local.clone();
        let handle = thread::Builder::new()
            .name("reactor".into())
            .spawn(move || self.run())
            .map_err(ServerError::Reactor)?;
        Ok(RunningServer {
            handle,
            shutdown,
            addr,
        })
    }
}

pub struct RunningServer {
    handle: JoinHandle<Result<(), ServerError>>,
    shutdown: ShutdownHandle,
    addr: ListenAddr,
}

impl RunningServer {
    pub fn local_addr(&self) -> &ListenAddr {
        &self.addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the reactor thread to exit.
    pub fn join(self) -> Result<(), ServerError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(ServerError::Reactor(io::Error::other("reactor thread panicked"))),
        }
    }

    pub fn stop(self) -> Result<(), ServerError> {
        self.shutdown.shutdown();
        self.join()
    }
}

/// Reactor state shared by both backends.
pub(crate) struct Core {
    listener: Socket,
    is_unix: bool,
    entry: StageRef,
    request_timeout: Option<Duration>,
    session: Session,
    max_message_size: usize,
    // Held so the ring stays open while no connection exists.
    producer: ResponseProducer,
    poller: RespPoller,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    conns: Slab<Connection>,
    next_id: u64,
}

impl Core {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Take ownership of an accepted socket. `None` if the connection table is full.
    fn register(&mut self, socket: Socket) -> Option<usize> {
        if self.conns.len() >= MAX_CONNECTIONS {
            tracing::warn!(max = MAX_CONNECTIONS, "connection table full, rejecting client");
            return None;
        }
        let peer = if self.is_unix {
            "unix".to_string()
        } else {
            socket
                .peer_addr()
                .ok()
                .and_then(|a| a.as_socket())
                .map_or_else(|| "unknown".to_string(), |a| a.to_string())
        };

        let id = self.next_id;
        self.next_id += 1;
        let entry = self.conns.vacant_entry();
        let key = entry.key();
        let ctx = Arc::new(ConnectionContext::new(
            id,
            key,
            peer,
            self.session.clone(),
            self.producer.clone(),
        ));
        tracing::debug!(conn = id, peer = ctx.peer(), "accepted");
        entry.insert(Connection::new(ctx, socket, self.max_message_size));
        metrics::inc_connections_accepted();
        Some(key)
    }

    /// Parse every complete request in the connection's buffer and submit the
    /// first one unless an earlier request is still awaiting its reply.
    fn dispatch_requests(&mut self, key: usize) -> Result<(), CloseReason> {
        let Some(conn) = self.conns.get_mut(key) else {
            return Ok(());
        };
        let requests = conn.take_requests()?;
        if requests.is_empty() {
            return Ok(());
        }
        conn.defer_requests(requests);
        if let Some(request) = conn.start_next() {
            let ctx = Arc::clone(&conn.ctx);
            self.submit_request(&ctx, request);
        }
        Ok(())
    }

    fn submit_request(&self, ctx: &Arc<ConnectionContext>, request: Vec<u8>) {
        metrics::inc_requests_read();
        let reply_to = Arc::clone(ctx);
        let mut event = Event::new(Payload::Session(SessionRequest {
            connection: Arc::clone(ctx),
            request,
        }))
        .on_complete(move |outcome| reply(&reply_to, outcome));
        if let Some(timeout) = self.request_timeout {
            event.attach_deadline(Deadline::after(timeout));
        }
        tracing::trace!(conn = ctx.id(), event = event.id(), "request");
        self.entry.submit(event);
    }

    /// Move published responses onto their connections and submit the next
    /// buffered request of each connection whose reply arrived. Returns the
    /// keys that now have bytes to write.
    fn drain_responses(&mut self) -> Vec<usize> {
        let mut keys = Vec::new();
        let mut next = Vec::new();
        match self.poller.poll() {
            Ok(mut guard) => {
                for slot in &mut guard {
                    metrics::dec_resp_occ();
                    match self.conns.get_mut(slot.key) {
                        Some(conn) if conn.ctx.id() == slot.conn_id && conn.closing.is_none() => {
                            conn.queue_response(&slot.frame);
                            metrics::inc_responses_written();
                            keys.push(slot.key);
                            if slot.completes {
                                conn.reply_queued();
                                if let Some(request) = conn.start_next() {
                                    next.push((Arc::clone(&conn.ctx), request));
                                }
                            }
                        }
                        _ => {
                            tracing::debug!(conn = slot.conn_id, "dropping response for closed connection");
                        }
                    }
                }
            }
            Err(Polling::NoEvents) | Err(Polling::Shutdown) => {}
        }
        for (ctx, request) in next {
            self.submit_request(&ctx, request);
        }
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Mark a connection closed for senders. The slot stays until [`Core::release`].
    fn begin_close(&mut self, key: usize, reason: CloseReason) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if conn.closing.is_some() {
            return;
        }
        conn.closing = Some(reason);
        conn.ctx.mark_closed();
        match reason {
            CloseReason::Oversized => {
                metrics::inc_oversized();
                tracing::warn!(
                    conn = conn.ctx.id(),
                    limit = conn.capacity(),
                    "request exceeds receive buffer, closing connection"
                );
            }
            CloseReason::ReadError | CloseReason::WriteError => {
                tracing::error!(conn = conn.ctx.id(), ?reason, "connection I/O error");
            }
            CloseReason::PeerClosed | CloseReason::Shutdown => {
                tracing::debug!(conn = conn.ctx.id(), ?reason, "closing connection");
            }
        }
    }

    /// Drop the connection and its socket.
    fn release(&mut self, key: usize) {
        if let Some(conn) = self.conns.try_remove(key) {
            conn.ctx.mark_closed();
            metrics::inc_connections_closed();
        }
    }

    /// Senders must stop waiting on the ring once the reactor is gone.
    fn close_all(&mut self) {
        for (_, conn) in self.conns.iter() {
            conn.ctx.mark_closed();
        }
    }
}

fn reply(ctx: &ConnectionContext, outcome: Outcome) {
    let result = match outcome.state {
        EventState::TimedOut => ctx.complete(TIMEOUT_RESPONSE),
        _ => ctx.complete(&outcome.response),
    };
    if let Err(e) = result {
        tracing::debug!(event = outcome.id, error = %e, "response not delivered");
    }
}
