//! The `toto` binary: HTTP server, worker pool, or standalone balancer,
//! with the shared daemon lifecycle (`--start`/`--stop`/`--restart`,
//! pidfiles, `--processes N`).

mod options;

use std::path::PathBuf;
use std::process::Command as ProcessCommand;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use toto_core::config::DatabaseKind;
use toto_core::daemon::{self, DaemonCommand, DaemonRole, PidfileLayout};
use toto_core::methods::builtin::register_builtin_methods;
use toto_core::session::file::FileBackend;
use toto_core::session::memory::MemoryBackend;
use toto_core::session::SessionStore;
use toto_core::worker::balancer::WorkerBalancer;
use toto_core::worker::connection::{InvokeOptions, WorkerConnection};
use toto_core::worker::service::{send_worker_command, WorkerService};
use toto_core::worker::WorkerWire;
use toto_core::{ServiceContext, TotoConfig};

use options::{Cli, Service};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    let service = cli.service();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if config.debug { "debug" } else { "info" }),
    )
    .init();

    // Spawned service children skip all daemon handling, as does a control
    // command passthrough.
    if let Some(index) = cli.instance {
        return run_instance(config, service, index);
    }
    if matches!(service, Service::WorkerCommand { .. }) {
        return run_instance(config, service, 0);
    }

    let layout = PidfileLayout::new(&config.pidfile);
    let command = cli.daemon_command()?;
    if matches!(command, DaemonCommand::Stop | DaemonCommand::Restart) {
        daemon::stop(&layout).context("failed to stop running services")?;
        if command == DaemonCommand::Stop {
            return Ok(());
        }
    }
    if matches!(command, DaemonCommand::Start | DaemonCommand::Restart) {
        if daemon::already_running(&layout)? {
            bail!("not starting: pidfiles exist for a running service");
        }
        match daemon::daemonize(&layout)? {
            DaemonRole::Launcher => return Ok(()),
            DaemonRole::Service => {}
        }
    }
    supervise(config, service, &layout, command != DaemonCommand::None)
}

/// Run `count` sibling service processes (plus, for workers, the balancer
/// in this process) and wait for them.
fn supervise(
    config: TotoConfig,
    service: Service,
    layout: &PidfileLayout,
    daemonized: bool,
) -> anyhow::Result<()> {
    let count = match service {
        // `--processes 0` runs only the balancer in front of an
        // externally-managed pool.
        Service::Worker if config.processes == 0 => 0,
        _ => config.process_count(),
    };

    if count == 1 && !matches!(service, Service::Worker) {
        return run_instance(config, service, 0);
    }

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let config_file = write_child_config(&config)?;
    let mut children = Vec::new();
    for index in 0..count {
        let child = ProcessCommand::new(&exe)
            .arg(service.subcommand())
            .arg("--conf")
            .arg(&config_file)
            .arg("--instance")
            .arg(index.to_string())
            .spawn()
            .with_context(|| format!("failed to spawn service process {index}"))?;
        if daemonized {
            layout.write(&layout.numbered(index), child.id())?;
        }
        children.push(child);
    }
    log::info!("started {count} {} process(es)", service.subcommand());

    if matches!(service, Service::Worker) {
        run_worker_balancer(&config, count)?;
    }

    for (index, mut child) in children.into_iter().enumerate() {
        let _ = child.wait();
        if daemonized {
            let _ = std::fs::remove_file(layout.numbered(index));
        }
    }
    let _ = std::fs::remove_file(config_file);
    Ok(())
}

/// The balancer accepts on the public worker address and forwards to the
/// sibling workers' sequential socket addresses.
fn run_worker_balancer(config: &TotoConfig, count: usize) -> anyhow::Result<()> {
    let backends: Vec<String> = (0..count.max(1) as u16)
        .map(|i| offset_address(&config.worker_socket_address, i))
        .collect::<Result<_, _>>()?;
    let address = config.worker_address.clone();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("cannot bind worker address {address}"))?;
        log::info!("balancer listening on {address}, routing to {backends:?}");
        WorkerBalancer::new(backends).serve(listener).await?;
        Ok(())
    })
}

fn run_instance(config: TotoConfig, service: Service, index: usize) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let ctx = build_context(&config)?;
        match service {
            Service::Server => run_server(ctx, index).await,
            Service::Worker => run_worker(ctx, index).await,
            Service::WorkerCommand { command } => {
                send_worker_command(&config.control_socket_address, &command).await?;
                println!("Sent command: {command}");
                Ok(())
            }
        }
    })
}

fn build_context(config: &TotoConfig) -> anyhow::Result<Arc<ServiceContext>> {
    let ttls = config.session_ttls();
    let store = match config.database {
        DatabaseKind::Memory => SessionStore::new(MemoryBackend::default(), ttls),
        DatabaseKind::File => {
            let path = config
                .db_path
                .clone()
                .unwrap_or_else(|| PathBuf::from("toto-db.json"));
            SessionStore::new(FileBackend::open(&path)?, ttls)
        }
    };
    let ctx = ServiceContext::new(config.clone(), store);
    register_builtin_methods(ctx.registry());
    Ok(ctx)
}

async fn run_server(ctx: Arc<ServiceContext>, index: usize) -> anyhow::Result<()> {
    let config = ctx.config().clone();

    // Event fan-out between sibling servers and configured remote peers.
    let event_port = config.event_port + index as u16;
    let events = ctx.events();
    events
        .start_listening(([0, 0, 0, 0], event_port).into())
        .await
        .context("cannot bind event listener")?;
    events.set_local_route(format!("127.0.0.1:{event_port}"));
    for i in 0..config.process_count() {
        events.register_server(format!("127.0.0.1:{}", config.event_port + i as u16));
    }
    for address in &config.remote_event_receivers {
        events.register_server(address.clone());
    }

    if !config.worker_connections.is_empty() {
        let wire = WorkerWire {
            format: config.worker_serialization,
            compression: config.worker_compression,
        };
        let defaults = InvokeOptions {
            timeout: (config.worker_timeout > 0.0)
                .then(|| std::time::Duration::from_secs_f64(config.worker_timeout)),
            retries: config.worker_retry_count,
        };
        let connection =
            WorkerConnection::connect_mq(config.worker_connections.clone(), wire, defaults);
        ctx.register_worker("default", connection);
    }

    let port = config.port + index as u16;
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("cannot bind port {port}"))?;
    log::info!("starting server on port {port}");
    axum::serve(listener, toto_client_api::router(ctx)).await?;
    Ok(())
}

async fn run_worker(ctx: Arc<ServiceContext>, index: usize) -> anyhow::Result<()> {
    let config = ctx.config().clone();
    let address = offset_address(&config.worker_socket_address, index as u16)?;
    let control_address = offset_address(&config.control_socket_address, index as u16)?;

    let service = Arc::new(WorkerService::new(ctx));
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("cannot bind worker socket {address}"))?;
    let control = tokio::net::TcpListener::bind(&control_address)
        .await
        .with_context(|| format!("cannot bind control socket {control_address}"))?;
    log::info!("worker listening on {address}, control on {control_address}");

    {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            if let Err(e) = service.serve_control(control).await {
                log::error!("control listener failed: {e}");
            }
        });
    }
    service.serve(listener).await?;
    Ok(())
}

/// `host:port` with the port shifted by `offset`.
fn offset_address(address: &str, offset: u16) -> anyhow::Result<String> {
    if offset == 0 {
        return Ok(address.to_owned());
    }
    let (host, port) = address
        .rsplit_once(':')
        .with_context(|| format!("address '{address}' is not host:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("address '{address}' has a bad port"))?;
    Ok(format!("{host}:{}", port + offset))
}

/// Children must see the supervisor's effective config, including CLI
/// overrides, so it is re-serialized for them.
fn write_child_config(config: &TotoConfig) -> anyhow::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("toto-config-{}.toml", std::process::id()));
    std::fs::write(&path, toml::to_string_pretty(config)?)?;
    Ok(path)
}
