use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};

use sedadb::constants::DEFAULT_PORT;
use sedadb::protocol::{read_message, write_message};

#[derive(Parser)]
#[command(about = "Test client for the sedadb server")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Connect to a local socket instead of TCP
    #[arg(short = 's', long = "socket")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Send each stdin line as a request and print the reply (default)
    Repl,
    /// Two PING round trips on one connection
    Smoke,
    /// Throughput with concurrent connections, one request in flight each
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Requests per connection
        #[arg(short, long, default_value_t = 10_000)]
        requests: usize,
    },
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

#[derive(Clone)]
enum Target {
    Tcp(String),
    Unix(PathBuf),
}

impl Target {
    fn connect(&self) -> anyhow::Result<Stream> {
        Ok(match self {
            Target::Tcp(addr) => {
                let s = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
                s.set_nodelay(true)?;
                Stream::Tcp(s)
            }
            Target::Unix(path) => Stream::Unix(
                UnixStream::connect(path)
                    .with_context(|| format!("connecting to {}", path.display()))?,
            ),
        })
    }
}

/// One request, one reply.
struct Session {
    stream: Stream,
    pending: Vec<u8>,
}

impl Session {
    fn open(target: &Target) -> anyhow::Result<Self> {
        Ok(Self {
            stream: target.connect()?,
            pending: Vec::new(),
        })
    }

    fn round_trip(&mut self, request: &[u8]) -> anyhow::Result<Vec<u8>> {
        write_message(&mut self.stream, request).context("sending request")?;
        read_message(&mut self.stream, &mut self.pending).context("reading reply")
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let target = match args.socket {
        Some(path) => Target::Unix(path),
        None => Target::Tcp(format!("{}:{}", args.host, args.port)),
    };

    match args.command.unwrap_or(Command::Repl) {
        Command::Repl => repl(&target),
        Command::Smoke => smoke_test(&target),
        Command::Bench {
            connections,
            requests,
        } => bench_test(&target, connections, requests),
    }
}

fn repl(target: &Target) -> anyhow::Result<()> {
    let mut session = Session::open(target)?;
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "sedadb> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if matches!(line.trim(), "exit" | "bye" | "\\q") {
            break;
        }
        let reply = session.round_trip(line.as_bytes())?;
        writeln!(stdout, "{}", String::from_utf8_lossy(&reply).trim_end())?;
    }
    Ok(())
}

fn smoke_test(target: &Target) -> anyhow::Result<()> {
    eprintln!("smoke test: connecting");
    let mut session = Session::open(target)?;
    for round in 1..=2 {
        let reply = session.round_trip(b"PING")?;
        if reply.is_empty() {
            bail!("round {round}: empty reply");
        }
        eprintln!("  round {round}: {:?}", String::from_utf8_lossy(&reply));
    }
    eprintln!("smoke test: OK");
    Ok(())
}

fn bench_test(target: &Target, connections: usize, requests: usize) -> anyhow::Result<()> {
    eprintln!("bench: {connections} connections x {requests} requests");
    let start = Instant::now();

    let handles: Vec<_> = (0..connections)
        .map(|i| {
            let target = target.clone();
            thread::spawn(move || -> anyhow::Result<Vec<Duration>> {
                let mut session = Session::open(&target)?;
                let mut latencies = Vec::with_capacity(requests);
                let request = format!("bench {i}");
                for _ in 0..requests {
                    let t = Instant::now();
                    session.round_trip(request.as_bytes())?;
                    latencies.push(t.elapsed());
                }
                Ok(latencies)
            })
        })
        .collect();

    let mut all = Vec::with_capacity(connections * requests);
    for h in handles {
        match h.join() {
            Ok(result) => all.extend(result?),
            Err(_) => bail!("bench connection thread panicked"),
        }
    }
    let elapsed = start.elapsed();

    all.sort_unstable();
    let pct = |p: f64| -> Duration {
        if all.is_empty() {
            return Duration::ZERO;
        }
        let idx = ((all.len() as f64 * p) as usize).min(all.len() - 1);
        all[idx]
    };
    eprintln!(
        "  {} requests in {:.2?}: {:.0} req/s",
        all.len(),
        elapsed,
        all.len() as f64 / elapsed.as_secs_f64()
    );
    eprintln!(
        "  latency p50={:?} p99={:?} p99.9={:?} max={:?}",
        pct(0.50),
        pct(0.99),
        pct(0.999),
        all.last().copied().unwrap_or_default()
    );
    Ok(())
}
