//! Command line surface.
//!
//! Daemon lifecycle flags and common overrides are global; the subcommand
//! picks which service this process runs.

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand};

use toto_core::config::DatabaseKind;
use toto_core::daemon::DaemonCommand;
use toto_core::TotoConfig;

#[derive(Parser)]
#[command(name = "toto", version, about = "Toto backend framework services")]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, value_name = "FILE")]
    pub conf: Option<PathBuf>,

    /// Alias for --daemon=start.
    #[arg(long, global = true)]
    pub start: bool,
    /// Alias for --daemon=stop.
    #[arg(long, global = true)]
    pub stop: bool,
    /// Alias for --daemon=restart.
    #[arg(long, global = true)]
    pub restart: bool,
    /// Run in the foreground, overriding any daemon setting.
    #[arg(long, global = true)]
    pub nodaemon: bool,
    /// Start, stop or restart this service as a daemon.
    #[arg(long, global = true, value_name = "start|stop|restart")]
    pub daemon: Option<String>,

    /// Base port for the HTTP server (sibling processes count up from it).
    #[arg(long, global = true)]
    pub port: Option<u16>,
    /// Service process count; zero or negative means one per CPU.
    #[arg(long, global = true)]
    pub processes: Option<i32>,
    /// Pidfile path; per-process files are named <stem>.<i>.<ext>.
    #[arg(long, global = true)]
    pub pidfile: Option<PathBuf>,
    /// Session/account backend: memory or file.
    #[arg(long, global = true, value_name = "memory|file")]
    pub database: Option<String>,
    /// Database file for the file backend.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,
    /// Verbose logging and unmasked error values.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Internal: the index of a spawned sibling process.
    #[arg(long, global = true, hide = true)]
    pub instance: Option<usize>,

    #[command(subcommand)]
    command: ServiceCommand,
}

#[derive(Subcommand)]
enum ServiceCommand {
    /// Run the HTTP method server.
    Server,
    /// Run worker processes behind a load balancer.
    Worker {
        /// Send a control command to running workers instead of serving.
        #[arg(long, value_name = "status|shutdown")]
        command: Option<String>,
    },
}

/// What this process should run, after CLI resolution.
#[derive(Clone)]
pub enum Service {
    Server,
    Worker,
    WorkerCommand { command: String },
}

impl Service {
    pub fn subcommand(&self) -> &'static str {
        match self {
            Service::Server => "server",
            Service::Worker | Service::WorkerCommand { .. } => "worker",
        }
    }
}

impl Cli {
    pub fn service(&self) -> Service {
        match &self.command {
            ServiceCommand::Server => Service::Server,
            ServiceCommand::Worker { command: Some(c) } => {
                Service::WorkerCommand { command: c.clone() }
            }
            ServiceCommand::Worker { command: None } => Service::Worker,
        }
    }

    pub fn load_config(&self) -> anyhow::Result<TotoConfig> {
        let mut config = match &self.conf {
            Some(path) => TotoConfig::from_toml_file(path)?,
            None => TotoConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(processes) = self.processes {
            config.processes = processes;
        }
        if let Some(pidfile) = &self.pidfile {
            config.pidfile = pidfile.clone();
        }
        if let Some(database) = &self.database {
            config.database = match database.as_str() {
                "memory" => DatabaseKind::Memory,
                "file" => DatabaseKind::File,
                other => bail!("unknown database backend: {other}"),
            };
        }
        if let Some(db_path) = &self.db_path {
            config.db_path = Some(db_path.clone());
        }
        if self.debug {
            config.debug = true;
        }
        Ok(config)
    }

    /// The command-line aliases override the --daemon option, matching the
    /// original precedence.
    pub fn daemon_command(&self) -> anyhow::Result<DaemonCommand> {
        if self.start {
            return Ok(DaemonCommand::Start);
        }
        if self.stop {
            return Ok(DaemonCommand::Stop);
        }
        if self.restart {
            return Ok(DaemonCommand::Restart);
        }
        if self.nodaemon {
            return Ok(DaemonCommand::None);
        }
        match &self.daemon {
            Some(command) => command
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e)),
            None => Ok(DaemonCommand::None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_override_the_daemon_option() {
        let cli = Cli::parse_from(["toto", "server", "--start", "--daemon", "stop"]);
        assert_eq!(cli.daemon_command().unwrap(), DaemonCommand::Start);

        let cli = Cli::parse_from(["toto", "server", "--daemon", "restart"]);
        assert_eq!(cli.daemon_command().unwrap(), DaemonCommand::Restart);

        let cli = Cli::parse_from(["toto", "server"]);
        assert_eq!(cli.daemon_command().unwrap(), DaemonCommand::None);
    }

    #[test]
    fn overrides_apply_to_the_config() {
        let cli = Cli::parse_from([
            "toto",
            "server",
            "--port",
            "9000",
            "--processes",
            "3",
            "--database",
            "file",
            "--db-path",
            "/tmp/db.json",
            "--debug",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.processes, 3);
        assert_eq!(config.database, DatabaseKind::File);
        assert!(config.debug);
    }

    #[test]
    fn worker_command_passthrough() {
        let cli = Cli::parse_from(["toto", "worker", "--command", "shutdown"]);
        match cli.service() {
            Service::WorkerCommand { command } => assert_eq!(command, "shutdown"),
            _ => panic!("expected a worker command passthrough"),
        }
    }
}
