//! vipbus: run a VIP router from the command line.
//!
//! With the direct bus the router listens for agent connections itself. With
//! the broker bus an in-process broker is started, a router consumes from it,
//! and a proxy router bridges TCP agents onto it.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use vipbus_router::{
    load_config, Broker, MessageBus, ProxyRouter, RouterConfig, RouterHandle, RouterResult,
    RouterService,
};

#[derive(Parser)]
#[command(name = "vipbus", version, about = "VIP message router")]
struct Cli {
    /// Path to config file (default: ~/.vipbus/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the router and run until Ctrl+C or `quit`.
    Start {
        /// Listen address; repeat to bind several.
        #[arg(long = "bind")]
        bind: Vec<String>,
        #[arg(long)]
        instance_name: Option<String>,
        /// Message bus: direct or broker.
        #[arg(long)]
        message_bus: Option<MessageBus>,
        /// Log filter used when RUST_LOG is unset.
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn init_tracing_stderr(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        None | Some(Commands::Config) => {
            let config = load_config(cli.config.as_deref());
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Start {
            bind,
            instance_name,
            message_bus,
            log_level,
        }) => {
            init_tracing_stderr(&log_level);
            let mut config = load_config(cli.config.as_deref());
            if !bind.is_empty() {
                config.bind_addresses = bind;
            }
            if let Some(name) = instance_name {
                config.instance_name = name;
            }
            if let Some(bus) = message_bus {
                config.message_bus = bus;
            }

            let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            runtime.block_on(start(config))
        }
    }
}

async fn start(config: RouterConfig) -> anyhow::Result<()> {
    match config.message_bus {
        MessageBus::Direct => {
            let service = RouterService::bind_direct(config)
                .await
                .context("binding direct router")?;
            let handle = service.handle();
            let task = tokio::spawn(service.run());
            supervise(vec![handle], vec![task]).await
        }
        MessageBus::Broker => {
            let broker = Broker::new(config.instance_name.as_str());

            // Federation links live on the proxy, which owns the TCP listener.
            let mut upstream_config = config.clone();
            upstream_config.platforms.clear();
            let upstream = RouterService::on_broker(upstream_config, &broker)
                .context("starting broker router")?;
            let proxy: ProxyRouter = RouterService::bind_proxy(config, &broker)
                .await
                .context("binding proxy router")?;

            let handles = vec![proxy.handle(), upstream.handle()];
            let tasks = vec![tokio::spawn(proxy.run()), tokio::spawn(upstream.run())];
            supervise(handles, tasks).await
        }
    }
}

/// Wait for Ctrl+C or any router exiting, then stop the rest.
async fn supervise(
    handles: Vec<RouterHandle>,
    tasks: Vec<tokio::task::JoinHandle<RouterResult<()>>>,
) -> anyhow::Result<()> {
    let mut running = futures::future::select_all(tasks);
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping router"),
        finished = &mut running => {
            let (result, _, rest) = finished;
            stop_all(&handles).await;
            let outcome = flatten(result);
            join_rest(rest).await;
            return outcome;
        }
    }
    stop_all(&handles).await;
    let (result, _, rest) = running.await;
    join_rest(rest).await;
    flatten(result)
}

async fn stop_all(handles: &[RouterHandle]) {
    for handle in handles {
        // A router that already exited reports Stopped.
        let _ = handle.stop().await;
    }
}

async fn join_rest(tasks: Vec<tokio::task::JoinHandle<RouterResult<()>>>) {
    for task in tasks {
        if let Err(e) = flatten(task.await) {
            warn!(error = %e, "Router exited with an error");
        }
    }
}

fn flatten(result: Result<RouterResult<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    result.context("router task panicked")?.context("router failed")
}
