//! Per-connection state.
//!
//! [`ConnectionContext`] is the part stage code sees: it travels inside
//! session events and is how a response gets back to the client. The
//! reactor-private [`Connection`] owns the socket and the buffers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use socket2::Socket;

use super::response_queue::ResponseProducer;
use crate::error::SendError;
use crate::protocol::{self, FrameResult};
use crate::session::Session;

pub struct ConnectionContext {
    id: u64,
    key: usize,
    peer: String,
    closed: AtomicBool,
    session: Session,
    // The per-connection send lock; it also guards this connection's ring producer.
    sender: Mutex<ResponseProducer>,
}

impl ConnectionContext {
    pub(crate) fn new(
        id: u64,
        key: usize,
        peer: String,
        session: Session,
        sender: ResponseProducer,
    ) -> Self {
        Self {
            id,
            key,
            peer,
            closed: AtomicBool::new(false),
            session,
            sender: Mutex::new(sender),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Queue `payload` for the client, NUL-terminated on the wire whether or
    /// not the payload already ends with one. Concurrent senders on the same
    /// connection are serialized.
    pub fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        self.publish(payload, false)
    }

    /// Send the final reply to the current request, letting the reactor
    /// start the next one buffered on this connection.
    pub(crate) fn complete(&self, payload: &[u8]) -> Result<(), SendError> {
        self.publish(payload, true)
    }

    fn publish(&self, payload: &[u8], completes: bool) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::Closed(self.id));
        }
        let mut frame = Vec::with_capacity(payload.len() + 1);
        protocol::write_response(&mut frame, payload);

        let mut sender = self.sender.lock();
        if sender.send(self.key, self.id, frame, completes, &self.closed) {
            Ok(())
        } else {
            Err(SendError::Closed(self.id))
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("db", &self.session.current_db())
            .finish()
    }
}

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    PeerClosed,
    Oversized,
    ReadError,
    WriteError,
    Shutdown,
}

/// Reactor-side connection: socket, receive buffer and outgoing bytes.
pub(crate) struct Connection {
    pub ctx: std::sync::Arc<ConnectionContext>,
    pub socket: Socket,
    pub read_buf: Box<[u8]>,
    pub read_len: usize,
    /// Bytes handed to the kernel; frozen while a write is in flight.
    pub write_buf: Vec<u8>,
    pub write_pos: usize,
    /// Responses that arrived while `write_buf` was busy.
    pub pending: Vec<u8>,
    /// Parsed requests waiting for the one in the pipeline to reply.
    backlog: VecDeque<Vec<u8>>,
    awaiting_reply: bool,
    pub read_inflight: bool,
    pub write_inflight: bool,
    pub closing: Option<CloseReason>,
}

impl Connection {
    pub fn new(ctx: std::sync::Arc<ConnectionContext>, socket: Socket, max_message_size: usize) -> Self {
        Self {
            ctx,
            socket,
            read_buf: vec![0u8; max_message_size].into_boxed_slice(),
            read_len: 0,
            write_buf: Vec::new(),
            write_pos: 0,
            pending: Vec::new(),
            backlog: VecDeque::new(),
            awaiting_reply: false,
            read_inflight: false,
            write_inflight: false,
            closing: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.read_buf.len()
    }

    /// Free space at the end of the receive buffer.
    pub fn read_space(&mut self) -> &mut [u8] {
        let len = self.read_len;
        &mut self.read_buf[len..]
    }

    /// Split every complete request out of the receive buffer, compacting
    /// what is left. Bytes after the last terminator stay for the next read.
    pub fn take_requests(&mut self) -> Result<Vec<Vec<u8>>, CloseReason> {
        let capacity = self.capacity();
        let mut requests = Vec::new();
        let mut consumed = 0;
        loop {
            match protocol::try_parse_frame(&self.read_buf[consumed..self.read_len], capacity) {
                FrameResult::Complete { len, consumed: n } => {
                    requests.push(self.read_buf[consumed..consumed + len].to_vec());
                    consumed += n;
                }
                FrameResult::Incomplete => break,
                FrameResult::Oversized => return Err(CloseReason::Oversized),
            }
        }
        if consumed > 0 {
            self.read_buf.copy_within(consumed..self.read_len, 0);
            self.read_len -= consumed;
        }
        Ok(requests)
    }

    /// Hold `requests` until the pipeline is free for this connection.
    pub fn defer_requests(&mut self, requests: Vec<Vec<u8>>) {
        self.backlog.extend(requests);
    }

    /// The next request to submit, or `None` while one is still awaiting
    /// its reply. At most one request per connection is in the pipeline,
    /// so replies leave in request order.
    pub fn start_next(&mut self) -> Option<Vec<u8>> {
        if self.awaiting_reply {
            return None;
        }
        let request = self.backlog.pop_front()?;
        self.awaiting_reply = true;
        Some(request)
    }

    /// The in-flight request has replied.
    pub fn reply_queued(&mut self) {
        self.awaiting_reply = false;
    }

    pub fn queue_response(&mut self, frame: &[u8]) {
        self.pending.extend_from_slice(frame);
    }

    /// Move pending bytes into the write buffer if it is free. Returns true if
    /// there is something to write.
    pub fn stage_write(&mut self) -> bool {
        if self.write_inflight {
            return false;
        }
        if self.write_pos >= self.write_buf.len() {
            self.write_buf.clear();
            self.write_pos = 0;
            std::mem::swap(&mut self.write_buf, &mut self.pending);
        }
        self.write_pos < self.write_buf.len()
    }

    pub fn unwritten(&self) -> &[u8] {
        &self.write_buf[self.write_pos..]
    }

    /// Record `n` written bytes; true once the write buffer is drained.
    pub fn advance_write(&mut self, n: usize) -> bool {
        self.write_pos += n;
        self.write_pos >= self.write_buf.len()
    }

    pub fn has_unsent(&self) -> bool {
        self.write_pos < self.write_buf.len() || !self.pending.is_empty()
    }

    pub fn ops_in_flight(&self) -> bool {
        self.read_inflight || self.write_inflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::response_queue::{Waker, build_response_channel};
    use socket2::{Domain, Type};
    use std::sync::Arc;

    fn connection(capacity: usize) -> Connection {
        let waker = Arc::new(Waker::new().unwrap());
        let (producer, _poller) = build_response_channel(64, waker);
        let ctx = Arc::new(ConnectionContext::new(1, 0, "test".into(), Session::default(), producer));
        let (a, _b) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        Connection::new(ctx, a, capacity)
    }

    fn fill(conn: &mut Connection, bytes: &[u8]) {
        conn.read_space()[..bytes.len()].copy_from_slice(bytes);
        conn.read_len += bytes.len();
    }

    #[test]
    fn splits_requests_and_keeps_the_tail() {
        let mut conn = connection(32);
        fill(&mut conn, b"PING\0STATUS\0par");
        let reqs = conn.take_requests().unwrap();
        assert_eq!(reqs, vec![b"PING".to_vec(), b"STATUS".to_vec()]);
        assert_eq!(&conn.read_buf[..conn.read_len], b"par");

        fill(&mut conn, b"tial\0");
        assert_eq!(conn.take_requests().unwrap(), vec![b"partial".to_vec()]);
        assert_eq!(conn.read_len, 0);
    }

    #[test]
    fn full_buffer_without_terminator_is_oversized() {
        let mut conn = connection(4);
        fill(&mut conn, b"ABCD");
        assert_eq!(conn.take_requests(), Err(CloseReason::Oversized));
    }

    #[test]
    fn one_request_in_the_pipeline_at_a_time() {
        let mut conn = connection(32);
        fill(&mut conn, b"one\0two\0three\0");
        let reqs = conn.take_requests().unwrap();
        conn.defer_requests(reqs);

        assert_eq!(conn.start_next(), Some(b"one".to_vec()));
        assert_eq!(conn.start_next(), None);

        conn.reply_queued();
        assert_eq!(conn.start_next(), Some(b"two".to_vec()));
        conn.reply_queued();
        assert_eq!(conn.start_next(), Some(b"three".to_vec()));
        conn.reply_queued();
        assert_eq!(conn.start_next(), None);
    }

    #[test]
    fn responses_queue_behind_an_in_flight_write() {
        let mut conn = connection(8);
        conn.queue_response(b"a\0");
        assert!(conn.stage_write());
        conn.write_inflight = true;
        conn.queue_response(b"b\0");
        assert!(!conn.stage_write());
        assert_eq!(conn.unwritten(), b"a\0");

        conn.write_inflight = false;
        assert!(conn.advance_write(2));
        assert!(conn.stage_write());
        assert_eq!(conn.unwritten(), b"b\0");
    }

    #[test]
    fn each_context_owns_its_session() {
        let conn = connection(8);
        assert_eq!(conn.ctx.session().current_db(), None);
        conn.ctx.session().set_current_db("test");
        assert_eq!(conn.ctx.session().current_db().as_deref(), Some("test"));
        assert_eq!(connection(8).ctx.session().current_db(), None);
    }

    #[test]
    fn send_on_closed_context_fails() {
        let conn = connection(8);
        conn.ctx.mark_closed();
        assert_eq!(conn.ctx.send(b"late"), Err(SendError::Closed(1)));
    }
}
