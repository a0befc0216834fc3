//! CLI entry point: `agent`, `collector`, `ifconfig`, `keygen`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use netflux_core::config::{AgentConfig, CollectorConfig};
use netflux_core::{agent, collector, wire};

#[derive(Debug, Parser)]
#[command(name = "netflux", version, about = "A distributed network-flow telemetry pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the agent: capture, aggregate and export flows from one or more interfaces.
    Agent {
        #[arg(long)]
        agent_logger_conf: Option<PathBuf>,
        #[arg(long)]
        agent_conf: PathBuf,
    },
    /// Run the collector: receive, decode and persist flows from whitelisted agents.
    Collector {
        #[arg(long)]
        collector_logger_conf: Option<PathBuf>,
        #[arg(long)]
        collector_conf: PathBuf,
    },
    /// Print the host's network interface names, one per line.
    Ifconfig,
    /// Generate and print a fresh base64 shared key.
    Keygen,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Agent { agent_logger_conf, agent_conf } => {
            bootstrap_logging(agent_logger_conf.as_deref());
            let config = AgentConfig::load(&agent_conf).unwrap_or_else(|e| fatal(&e));
            run_worker(|token| agent::run(config, token));
        }
        Command::Collector { collector_logger_conf, collector_conf } => {
            bootstrap_logging(collector_logger_conf.as_deref());
            let config = CollectorConfig::load(&collector_conf).unwrap_or_else(|e| fatal(&e));
            run_worker(|token| collector::run(config, token));
        }
        Command::Ifconfig => {
            for ifname in agent::sniffer::list_interfaces() {
                println!("{ifname}");
            }
        }
        Command::Keygen => {
            println!("{}", wire::SharedKey::generate());
        }
    }
}

/// Installs the bootstrap `tracing` subscriber before any configuration is
/// loaded, so startup failures are still logged. `logger_conf`, when given,
/// is a file containing a single `tracing_subscriber::EnvFilter` directive
/// (e.g. `netflux=debug,info`); absent, the `RUST_LOG` env var is used,
/// falling back to `info`.
fn bootstrap_logging(logger_conf: Option<&std::path::Path>) {
    let directive = logger_conf
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|s| s.trim().to_string());
    let filter = match directive {
        Some(d) => EnvFilter::try_new(d).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).compact().init();
}

fn fatal(err: &impl std::fmt::Display) -> ! {
    eprintln!("fatal: {err}");
    std::process::exit(1);
}

/// Builds a tokio runtime, wires a `CancellationToken` to Ctrl-C, and runs
/// `build_fut` to completion, exiting nonzero if the worker returns an I/O
/// error.
fn run_worker<F, Fut>(build_fut: F)
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = std::io::Result<()>>,
{
    let runtime = tokio::runtime::Runtime::new().expect("failed to start async runtime");
    let result = runtime.block_on(async move {
        let token = CancellationToken::new();
        let waiter = token.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            waiter.cancel();
        });
        build_fut(token).await
    });
    if let Err(e) = result {
        fatal(&e);
    }
}
