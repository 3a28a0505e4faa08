use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, anyhow};
use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing_subscriber::EnvFilter;

use sedadb::config::{Backend, Config, Overrides};
use sedadb::pidfile::PidFile;
use sedadb::pipeline::Registry;
use sedadb::server::Server;
use sedadb::{metrics, stages};

/// Stage that receives client requests.
const ENTRY_STAGE: &str = "SessionStage";

#[derive(Parser)]
#[command(about = "Staged event-driven database server")]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "SEDADB_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port to listen on
    #[arg(short, long, env = "SEDADB_PORT")]
    port: Option<u16>,

    /// Listen on a local socket at this path instead of TCP
    #[arg(short = 's', long = "socket", env = "SEDADB_SOCKET")]
    socket: Option<PathBuf>,

    /// Address to bind for TCP
    #[arg(long, env = "SEDADB_LISTEN")]
    listen: Option<IpAddr>,

    #[arg(long, value_enum, env = "SEDADB_BACKEND")]
    backend: Option<Backend>,

    /// Reply with an error if a request is not answered within this many ms
    #[arg(long, env = "SEDADB_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Database new connections start on
    #[arg(long = "db", env = "SEDADB_DB")]
    default_db: Option<String>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen,
            port: self.port,
            unix_socket: self.socket.clone(),
            backend: self.backend,
            request_timeout_ms: self.request_timeout_ms,
            default_db: self.default_db.clone(),
        }
    }
}

fn init_logging(file_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(file_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

/// A panic anywhere means a stage broke an invariant; stop the whole process.
fn install_abort_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(%info, "fatal panic, aborting");
        eprintln!("sedadb: {info}");
        std::process::abort();
    }));
}

fn process_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|argv0| Path::new(argv0).file_name())
        .and_then(|name| name.to_str())
        .map_or_else(|| "sedadb".to_string(), str::to_string)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config.server.log_filter);
    install_abort_hook();
    metrics::spawn_reporter();

    let mut server_cfg = config.server.clone();
    server_cfg.apply(args.overrides());

    let pid_file = PidFile::create(&server_cfg.pid_dir, &process_name())
        .with_context(|| format!("writing pid file in {}", server_cfg.pid_dir.display()))?;

    let layout = config
        .pipeline_layout()
        .context("parsing pipeline config")?;
    let mut registry = Registry::new(stages::default_factory());
    if let Err(e) = registry.init_with_layout(layout) {
        tracing::error!(status = ?e.status(), error = %e, "pipeline init failed");
        return Err(e).context("starting pipeline");
    }
    let entry = registry
        .get_stage(ENTRY_STAGE)
        .or_else(|| {
            registry
                .stage_names()
                .first()
                .and_then(|name| registry.get_stage(name))
        })
        .ok_or_else(|| anyhow!("pipeline defines no stages"))?;
    tracing::info!(entry = entry.name(), stages = ?registry.stage_names(), "pipeline ready");

    let server = Server::bind(server_cfg.server_options(), entry).context("starting listener")?;
    let running = server.spawn().context("starting reactor")?;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP, SIGQUIT]).context("installing signal handlers")?;
    let signals_handle = signals.handle();
    let shutdown = running.shutdown_handle();
    let signal_thread = thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                tracing::info!(signal = sig, "shutdown requested");
                shutdown.shutdown();
            }
        })
        .context("spawning signal thread")?;

    tracing::info!(addr = %running.local_addr(), pid = std::process::id(), "sedadb ready");

    let result = running.join();
    signals_handle.close();
    let _ = signal_thread.join();

    registry.cleanup();
    drop(pid_file);
    tracing::info!("sedadb stopped");
    result.context("reactor failed")
}
