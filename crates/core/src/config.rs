//! Service configuration.
//!
//! Everything the original exposed as command-line options lives here as one
//! serde struct, loadable from a TOML file and overridable by the CLI. Every
//! field has a default, so a bare `TotoConfig::default()` runs a usable
//! development server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use toto_lib::wire::{Compression, WireFormat};

use crate::session::SessionTtls;

/// Where the request pipeline may take the method path from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodSelect {
    Url,
    Parameter,
    #[default]
    Both,
}

/// The key used for request and response HMACs.
///
/// `UserId` is the wire-compatible default; `SessionKey` signs with the
/// session's dedicated key instead, which does not depend on a guessable
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HmacSecret {
    #[default]
    UserId,
    SessionKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TotoConfig {
    /// Base port; daemonized sibling servers listen on sequential ports.
    pub port: u16,
    /// URL prefix the service is mounted under.
    pub root: String,
    pub method_select: MethodSelect,
    /// Value for `Access-Control-Allow-Origin`.
    pub allow_origin: String,
    /// Accept `application/msgpack` request bodies.
    pub msgpack_enabled: bool,
    /// Carry the session id in a cookie instead of the session header.
    pub use_cookies: bool,
    pub cookie_domain: Option<String>,
    pub hmac_enabled: bool,
    pub hmac_secret: HmacSecret,

    pub session_ttl: f64,
    pub anon_session_ttl: f64,
    pub session_renew: f64,
    pub anon_session_renew: f64,

    pub database: DatabaseKind,
    /// Database file for the `file` backend.
    pub db_path: Option<PathBuf>,

    pub event_port: u16,
    /// Peer event addresses this process should deliver events to.
    pub remote_event_receivers: Vec<String>,
    pub event_serialization: WireFormat,
    pub event_compression: Compression,

    /// Public address worker clients connect to.
    pub worker_address: String,
    /// Address the balancer forwards to and workers serve on; sibling
    /// workers use sequential ports from here.
    pub worker_socket_address: String,
    /// Address workers listen on for `status`/`shutdown` commands.
    pub control_socket_address: String,
    /// Worker endpoints this server should dispatch invocations to.
    pub worker_connections: Vec<String>,
    /// Per-invocation reply deadline, seconds.
    pub worker_timeout: f64,
    /// Re-sends before a worker invocation times out for good.
    pub worker_retry_count: u32,
    pub worker_serialization: WireFormat,
    pub worker_compression: Compression,

    /// Daemon process count; zero or negative means one per CPU.
    pub processes: i32,
    pub pidfile: PathBuf,
    pub debug: bool,
}

impl Default for TotoConfig {
    fn default() -> Self {
        TotoConfig {
            port: 8888,
            root: "/".to_owned(),
            method_select: MethodSelect::default(),
            allow_origin: "*".to_owned(),
            msgpack_enabled: false,
            use_cookies: false,
            cookie_domain: None,
            hmac_enabled: true,
            hmac_secret: HmacSecret::default(),
            session_ttl: 365.0 * 24.0 * 60.0 * 60.0,
            anon_session_ttl: 24.0 * 60.0 * 60.0,
            session_renew: 0.0,
            anon_session_renew: 0.0,
            database: DatabaseKind::default(),
            db_path: None,
            event_port: 8999,
            remote_event_receivers: Vec::new(),
            event_serialization: WireFormat::Json,
            event_compression: Compression::Zlib,
            worker_address: "127.0.0.1:55555".to_owned(),
            worker_socket_address: "127.0.0.1:55556".to_owned(),
            control_socket_address: "127.0.0.1:55557".to_owned(),
            worker_connections: Vec::new(),
            worker_timeout: 10.0,
            worker_retry_count: 0,
            worker_serialization: WireFormat::Json,
            worker_compression: Compression::Zlib,
            processes: 1,
            pidfile: PathBuf::from("toto.pid"),
            debug: false,
        }
    }
}

impl TotoConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&text)?)
    }

    pub fn session_ttls(&self) -> SessionTtls {
        SessionTtls {
            session_ttl: self.session_ttl,
            anon_session_ttl: self.anon_session_ttl,
            session_renew: self.session_renew,
            anon_session_renew: self.anon_session_renew,
        }
    }

    /// Number of sibling processes to run, resolving the per-CPU sentinel.
    pub fn process_count(&self) -> usize {
        if self.processes > 0 {
            self.processes as usize
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}
