//! Front-end tests: real sockets, the reactor thread and a running pipeline.

mod common;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use common::*;
use sedadb::config::Backend;
use sedadb::pipeline::{Event, PipelineLayout, Registry, Stage, StageRef};
use sedadb::protocol::{read_message, write_message};
use sedadb::server::{ListenAddr, RunningServer, Server, ServerOptions};
use sedadb::session::Session;
use sedadb::stages;

const GREETING: &[u8] = b"Hello, world!\n";

trait Duplex: Read + Write + Send {}
impl<T: Read + Write + Send> Duplex for T {}

struct Client {
    stream: Box<dyn Duplex>,
    pending: Vec<u8>,
}

impl Client {
    fn connect(addr: &ListenAddr) -> Client {
        let stream: Box<dyn Duplex> = match addr {
            ListenAddr::Tcp(addr) => {
                let s = TcpStream::connect(addr).expect("tcp connect");
                s.set_read_timeout(Some(WAIT)).unwrap();
                Box::new(s)
            }
            ListenAddr::Unix(path) => {
                let s = UnixStream::connect(path).expect("unix connect");
                s.set_read_timeout(Some(WAIT)).unwrap();
                Box::new(s)
            }
        };
        Client {
            stream,
            pending: Vec::new(),
        }
    }

    fn send(&mut self, request: &[u8]) {
        write_message(&mut self.stream, request).expect("send request");
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send bytes");
    }

    fn recv(&mut self) -> io::Result<Vec<u8>> {
        read_message(&mut self.stream, &mut self.pending)
    }

    fn round_trip(&mut self, request: &[u8]) -> Vec<u8> {
        self.send(request);
        self.recv().expect("reply")
    }
}

/// A running pipeline with the front end attached to its entry stage.
struct Harness {
    server: Option<RunningServer>,
    registry: Registry,
}

impl Harness {
    fn start(registry: Registry, options: ServerOptions) -> Harness {
        let entry = registry.get_stage("SessionStage").expect("entry stage");
        let server = Server::bind(options, entry)
            .expect("bind")
            .spawn()
            .expect("spawn reactor");
        Harness {
            server: Some(server),
            registry,
        }
    }

    fn addr(&self) -> ListenAddr {
        self.server.as_ref().unwrap().local_addr().clone()
    }

    fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.stop().expect("reactor exits cleanly");
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop();
        self.registry.cleanup();
    }
}

const ECHO_PIPELINE: &str = r#"
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

/// Session in front of an echo stage, with several workers per pool.
fn echo_registry() -> Registry {
    running_registry(ECHO_PIPELINE, |_| {})
}

fn builtin_registry() -> Registry {
    let mut registry = Registry::new(stages::default_factory());
    registry.init_with_layout(PipelineLayout::builtin()).unwrap();
    registry
}

fn tcp_options(backend: Backend) -> ServerOptions {
    ServerOptions {
        listen: ListenAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 0))),
        backend,
        ..ServerOptions::default()
    }
}

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sedadb-{}-{name}.sock", std::process::id()))
}

fn uring_available() -> bool {
    io_uring::IoUring::new(8).is_ok()
}

fn greets_twice(backend: Backend) {
    let harness = Harness::start(builtin_registry(), tcp_options(backend));
    let mut client = Client::connect(&harness.addr());
    assert_eq!(client.round_trip(b"PING"), GREETING);
    assert_eq!(client.round_trip(b"PING"), GREETING);
}

#[test]
fn greets_over_tcp_with_epoll() {
    greets_twice(Backend::Epoll);
}

#[test]
fn greets_over_tcp_with_io_uring() {
    if !uring_available() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }
    greets_twice(Backend::Uring);
}

#[test]
fn greets_over_tcp_with_auto_backend() {
    greets_twice(Backend::Auto);
}

#[test]
fn greets_over_unix_socket() {
    let path = socket_path("greet");
    let mut harness = Harness::start(
        builtin_registry(),
        ServerOptions {
            listen: ListenAddr::Unix(path.clone()),
            ..ServerOptions::default()
        },
    );
    assert_eq!(harness.addr(), ListenAddr::Unix(path.clone()));

    let mut client = Client::connect(&harness.addr());
    assert_eq!(client.round_trip(b"PING"), GREETING);
    assert_eq!(client.round_trip(b"PING"), GREETING);

    harness.stop();
    assert!(!path.exists());
}

#[test]
fn pipelined_requests_in_one_write_each_get_a_reply() {
    let harness = Harness::start(echo_registry(), tcp_options(Backend::Epoll));
    let mut client = Client::connect(&harness.addr());

    let requests: Vec<Vec<u8>> = (0..50).map(|i| format!("req{i}").into_bytes()).collect();
    let mut burst = Vec::new();
    for request in &requests {
        burst.extend_from_slice(request);
        burst.push(0);
    }
    // The last request arrives split across two writes.
    burst.extend_from_slice(b"tai");
    client.send_raw(&burst);
    for request in &requests {
        assert_eq!(&client.recv().unwrap(), request);
    }
    client.send_raw(b"l\0");
    assert_eq!(client.recv().unwrap(), b"tail");
}

#[test]
fn pipelined_replies_keep_request_order_with_io_uring() {
    if !uring_available() {
        return;
    }
    let harness = Harness::start(echo_registry(), tcp_options(Backend::Uring));
    let mut client = Client::connect(&harness.addr());
    let burst: Vec<u8> = (0..20).flat_map(|i| format!("q{i}\0").into_bytes()).collect();
    client.send_raw(&burst);
    for i in 0..20 {
        assert_eq!(client.recv().unwrap(), format!("q{i}").into_bytes());
    }
}

#[test]
fn session_forwards_to_downstream_echo() {
    let harness = Harness::start(echo_registry(), tcp_options(Backend::Auto));
    let mut client = Client::connect(&harness.addr());
    assert_eq!(client.round_trip(b"select 1"), b"select 1");
    // Blank requests are answered by the session stage itself.
    assert_eq!(client.round_trip(b"   "), GREETING);
}

/// `use NAME` switches the connection's database; every request is answered
/// with the database then selected.
struct CurrentDb;

impl Stage for CurrentDb {
    fn handle(&self, _me: &StageRef, mut event: Event) {
        let request = String::from_utf8_lossy(event.request()).into_owned();
        let db = event.session().map(|session| {
            if let Some(name) = request.strip_prefix("use ") {
                session.set_current_db(name);
            }
            session.current_db().unwrap_or_else(|| "-".to_string())
        });
        event.set_response(db.unwrap_or_default());
        event.finish();
    }
}

#[test]
fn each_connection_keeps_its_own_session() {
    let registry = running_registry(
        "[SEDA_BASE]\nThreadPools = \"P\"\nSTAGES = [\"SessionStage\", \"Db\"]\n[P]\ncount = 2\n\
         [SessionStage]\nThreadId = \"P\"\nNextStages = \"Db\"\n[Db]\nThreadId = \"P\"\nType = \"CurrentDb\"\n",
        |f| {
            f.register("CurrentDb", |_| Ok(Box::new(CurrentDb)));
        },
    );
    let options = ServerOptions {
        session: Session::new(Some("sys".to_string())),
        ..tcp_options(Backend::Epoll)
    };
    let harness = Harness::start(registry, options);
    let mut a = Client::connect(&harness.addr());
    let mut b = Client::connect(&harness.addr());

    assert_eq!(a.round_trip(b"which"), b"sys");
    assert_eq!(a.round_trip(b"use orders"), b"orders");
    assert_eq!(a.round_trip(b"which"), b"orders");
    assert_eq!(b.round_trip(b"which"), b"sys");
}

#[test]
fn oversized_request_closes_only_that_connection() {
    let harness = Harness::start(
        builtin_registry(),
        ServerOptions {
            max_message_size: 16,
            ..tcp_options(Backend::Epoll)
        },
    );
    let mut bad = Client::connect(&harness.addr());
    bad.send_raw(&[b'x'; 64]);
    let err = bad.recv().unwrap_err();
    assert!(
        matches!(
            err.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
        ),
        "{err:?}"
    );

    let mut good = Client::connect(&harness.addr());
    assert_eq!(good.round_trip(b"PING"), GREETING);
}

#[test]
fn client_disconnect_does_not_disturb_other_clients() {
    let harness = Harness::start(builtin_registry(), tcp_options(Backend::Auto));
    for _ in 0..10 {
        let mut gone = Client::connect(&harness.addr());
        gone.send(b"PING");
    }
    let mut client = Client::connect(&harness.addr());
    assert_eq!(client.round_trip(b"PING"), GREETING);
}

#[test]
fn queued_request_past_its_timeout_gets_error_reply() {
    let registry = running_registry(
        r#"
[SEDA_BASE]
ThreadPools = "P"
STAGES = ["SessionStage", "Slow"]
SweepIntervalMs = 10

[P]
count = 1

[SessionStage]
ThreadId = "P"
NextStages = "Slow"

[Slow]
ThreadId = "P"
"#,
        |f| slow(f, Duration::from_millis(600)),
    );
    let harness = Harness::start(
        registry,
        ServerOptions {
            request_timeout: Some(Duration::from_millis(150)),
            ..tcp_options(Backend::Auto)
        },
    );

    let mut busy = Client::connect(&harness.addr());
    busy.send(b"occupy the only worker");
    thread::sleep(Duration::from_millis(50));

    let mut waiting = Client::connect(&harness.addr());
    assert_eq!(waiting.round_trip(b"hello"), b"ERROR: request timed out");
    assert_eq!(busy.recv().unwrap(), b"slow done");
}

#[test]
fn many_concurrent_clients_are_all_answered() {
    let harness = Harness::start(builtin_registry(), tcp_options(Backend::Auto));
    let addr = harness.addr();
    let clients: Vec<_> = (0..8)
        .map(|_| {
            let addr = addr.clone();
            thread::spawn(move || {
                let mut client = Client::connect(&addr);
                for _ in 0..100 {
                    assert_eq!(client.round_trip(b"PING"), GREETING);
                }
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }
}

#[test]
fn stop_releases_the_listener() {
    let mut harness = Harness::start(builtin_registry(), tcp_options(Backend::Epoll));
    let ListenAddr::Tcp(addr) = harness.addr() else {
        unreachable!("tcp listener");
    };
    let mut client = Client::connect(&harness.addr());
    assert_eq!(client.round_trip(b"PING"), GREETING);

    harness.stop();
    assert!(TcpStream::connect_timeout(&addr, Duration::from_millis(500)).is_err());
}
