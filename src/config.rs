//! Server configuration.
//!
//! One TOML file carries both the `[server]` section and the pipeline
//! sections (see [`crate::pipeline::layout`]). Command-line flags and their
//! environment variables override the file.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use toml::Table;

use crate::constants::{DEFAULT_BACKLOG, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT, MIN_MESSAGE_SIZE};
use crate::error::{ConfigError, PipelineError};
use crate::pipeline::PipelineLayout;
use crate::server::{ListenAddr, ServerOptions};
use crate::session::Session;

pub const DEFAULT_LOG_FILTER: &str = "sedadb=info";

/// Reactor implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// io_uring, falling back to epoll if the kernel refuses it.
    #[default]
    Auto,
    Uring,
    Epoll,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: IpAddr,
    pub port: u16,
    /// Listen on this local socket instead of TCP.
    pub unix_socket: Option<PathBuf>,
    pub backlog: i32,
    pub max_message_size: usize,
    pub backend: Backend,
    pub request_timeout_ms: Option<u64>,
    /// Database every new connection starts on.
    pub default_db: Option<String>,
    pub log_filter: String,
    pub pid_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            unix_socket: None,
            backlog: DEFAULT_BACKLOG,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            backend: Backend::Auto,
            request_timeout_ms: None,
            default_db: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            pid_dir: std::env::temp_dir(),
        }
    }
}

/// Values from the command line or environment; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<IpAddr>,
    pub port: Option<u16>,
    pub unix_socket: Option<PathBuf>,
    pub backend: Option<Backend>,
    pub request_timeout_ms: Option<u64>,
    pub default_db: Option<String>,
}

impl ServerConfig {
    /// Reject values the reactor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(ConfigError::Invalid {
                key: "max_message_size",
                reason: format!("must be at least {MIN_MESSAGE_SIZE}, got {}", self.max_message_size),
            });
        }
        Ok(())
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(listen) = overrides.listen {
            self.listen = listen;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if overrides.unix_socket.is_some() {
            self.unix_socket = overrides.unix_socket;
        }
        if let Some(backend) = overrides.backend {
            self.backend = backend;
        }
        if overrides.request_timeout_ms.is_some() {
            self.request_timeout_ms = overrides.request_timeout_ms;
        }
        if overrides.default_db.is_some() {
            self.default_db = overrides.default_db;
        }
    }

    pub fn listen_addr(&self) -> ListenAddr {
        match &self.unix_socket {
            Some(path) => ListenAddr::Unix(path.clone()),
            None => ListenAddr::Tcp(SocketAddr::new(self.listen, self.port)),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            listen: self.listen_addr(),
            backlog: self.backlog,
            max_message_size: self.max_message_size,
            backend: self.backend,
            request_timeout: self
                .request_timeout_ms
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis),
            session: Session::new(self.default_db.clone()),
        }
    }
}

/// A loaded config file: the server section plus the raw document the
/// pipeline sections are read from.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub document: Table,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let document: Table = toml::from_str(text)?;
        let server = match document.get("server") {
            Some(section) => section.clone().try_into()?,
            None => ServerConfig::default(),
        };
        server.validate()?;
        Ok(Self { server, document })
    }

    /// The pipeline the file defines, or the built-in one if it defines none.
    pub fn pipeline_layout(&self) -> Result<PipelineLayout, PipelineError> {
        if PipelineLayout::is_defined_in(&self.document) {
            PipelineLayout::parse(&self.document)
        } else {
            Ok(PipelineLayout::builtin())
        }
    }
}
