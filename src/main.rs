use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use exert::arith::{Arithmetic, ArithmeticDeployer};
use exert::config::Config;
use exert::core::{DependencyGraph, ExecState, Exertion};
use exert::dispatch::{DispatchEnv, DispatcherFactory, ProvisionCoordinator};
use exert::service::ServiceRegistry;
use exert::space::{FixedQueue, MemoryWorkQueue, SpaceWorker};
use exert::{elog, Result};

/// Exert - dispatch exertion trees across local and queue-backed executors
#[derive(Parser, Debug)]
#[command(name = "exert")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    EXERT_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.exert/exert.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Dispatch an exertion tree read from a JSON file
    Run {
        /// Path to the exertion JSON
        exertion: PathBuf,

        /// Space workers serving pull-access work (defaults to config)
        #[arg(long, short = 'w')]
        workers: Option<usize>,
    },

    /// Print the sorted tree with resolved flows, without dispatching
    Order {
        /// Path to the exertion JSON
        exertion: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    exert::log::init(cli.debug || config.debug);
    if !cli.debug {
        exert::log::set_level(config.effective_log_level());
    }

    match cli.command {
        Command::Run { exertion, workers } => run_exertion(&exertion, workers, config),
        Command::Order { exertion } => run_order(&exertion),
        Command::Config => run_config(&config),
    }
}

fn load_exertion(path: &Path) -> Result<Exertion> {
    let exertion: Exertion = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    Ok(exertion)
}

/// Dispatch the tree against the built-in arithmetic provider.
///
/// Push tasks run in-process; pull work goes through an in-memory queue
/// served by `workers` space workers. Provisionable tasks get an
/// arithmetic instance deployed on demand.
fn run_exertion(path: &Path, workers: Option<usize>, config: Config) -> Result<()> {
    let exertion = load_exertion(path)?;
    elog!("Run command: {} ({} units)", exertion.describe(), exertion.size());

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(Arithmetic::default()));
        let provisioner =
            ProvisionCoordinator::from_config(Arc::new(ArithmeticDeployer), &config.dispatch)
                .with_registry(registry.clone());
        let locator = Arc::new(registry);
        let queue = Arc::new(MemoryWorkQueue::new());

        let env = DispatchEnv::new(locator.clone())
            .with_provider(Arc::new(Arithmetic::default()))
            .with_queue(Arc::new(FixedQueue::new(queue.clone())))
            .with_provisioner(provisioner)
            .with_config(config.dispatch.clone());

        let stop = CancellationToken::new();
        let count = workers.unwrap_or(config.dispatch.space_workers);
        let handles: Vec<_> = (0..count)
            .map(|i| {
                SpaceWorker::new(&format!("worker-{}", i), queue.clone(), locator.clone())
                    .with_env(env.clone())
                    .spawn(stop.clone())
            })
            .collect();

        let outcome = match DispatcherFactory::create(exertion, env) {
            Ok(dispatcher) => {
                dispatcher.exec().await;
                Ok(dispatcher.get_result().await)
            }
            Err(e) => Err(e),
        };

        stop.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        outcome
    })?;

    let (state, exertion) = result;
    println!("{}", serde_json::to_string_pretty(&exertion)?);
    elog!("Run finished: {}", state);
    if state != ExecState::Done {
        eprintln!("exertion ended {}", state);
        std::process::exit(1);
    }
    Ok(())
}

fn run_order(path: &Path) -> Result<()> {
    let mut exertion = load_exertion(path)?;
    exertion.link_parents();
    DependencyGraph::order(&mut exertion)?;
    print_outline(&exertion, 0);
    Ok(())
}

fn print_outline(exertion: &Exertion, depth: usize) {
    let indent = "  ".repeat(depth);
    if exertion.is_composite() {
        println!(
            "{}{} flow={} access={:?}",
            indent,
            exertion.describe(),
            exertion.control.flow,
            exertion.control.access
        );
    } else {
        println!("{}{}", indent, exertion.describe());
    }
    for child in &exertion.children {
        print_outline(child, depth + 1);
    }
}

fn run_config(config: &Config) -> Result<()> {
    println!("# {}", Config::config_path()?.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
