use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use swarmbuild::build_id::BuildId;
use swarmbuild::cache::{NoopUploader, StaticCacheOracle};
use swarmbuild::config::{CoordinatorConfig, MinionConfig, RaceConfig, TlsConfig};
use swarmbuild::coordinator::ExitState;
use swarmbuild::executor::{BuildExecutor, CommandExecutor, NoopExecutor};
use swarmbuild::graph::GraphSpec;
use swarmbuild::grpc::GrpcCoordinatorConnection;
use swarmbuild::minion::{Minion, NoCompletionSignal};
use swarmbuild::node::CoordinatorNode;
use swarmbuild::race::{
    BuildController, LocalBuildMode, LocalBuildRunner, NoopNotifier, RaceSignals,
    RemoteBuildNotifier,
};
use swarmbuild::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "swarmbuild")]
#[command(version)]
#[command(about = "Distributed build coordinator with cache-aware work scheduling")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a coordinator serving one distributed build
    Coordinator(CoordinatorArgs),

    /// Start a minion that polls a coordinator for work units
    Minion(MinionArgs),

    /// Run a whole build in one process: coordinator, local minions,
    /// and optionally a racing local build
    Build(BuildArgs),
}

// =============================================================================
// Coordinator Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Path to the build graph file (JSON)
    #[arg(long)]
    graph: PathBuf,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Percentage of targets at which "most rules finished" fires
    #[arg(long, default_value = "80")]
    most_rules_percent: u32,

    /// Declare a minion dead after this long without contact
    #[arg(long, default_value = "5000")]
    heartbeat_timeout_ms: u64,

    /// Hold finished events this long before publishing them
    #[arg(long, default_value = "500")]
    publish_margin_ms: u64,

    #[command(flatten)]
    tls: TlsArgs,
}

// =============================================================================
// Minion Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct MinionArgs {
    /// Coordinator address (host:port)
    #[arg(long, default_value = "127.0.0.1:50051")]
    coordinator: String,

    /// Build id announced by the coordinator
    #[arg(long)]
    build_id: String,

    /// Minion identifier; generated when omitted
    #[arg(long)]
    minion_id: Option<String>,

    /// How many work units may build concurrently
    #[arg(long, default_value = "10")]
    slots: usize,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "100")]
    poll_interval_ms: u64,

    /// Shell command run per target; `{target}` is substituted.
    /// Omitting it makes every build step a successful no-op.
    #[arg(long)]
    command: Option<String>,

    #[command(flatten)]
    tls: TlsArgs,
}

// =============================================================================
// Build Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct BuildArgs {
    /// Path to the build graph file (JSON)
    #[arg(long)]
    graph: PathBuf,

    /// Number of in-process minions
    #[arg(long, default_value = "1")]
    minions: usize,

    /// Shell command run per target; `{target}` is substituted
    #[arg(long)]
    command: Option<String>,

    /// Also serve the coordinator gRPC surface on this port so
    /// external minions can join
    #[arg(long)]
    port: Option<u16>,

    /// Race a local build against the distributed one
    #[arg(long)]
    racing: bool,

    /// Shell command for the local build; required with --racing
    #[arg(long)]
    local_command: Option<String>,

    /// Do not fall back to the local build when the distributed
    /// build fails
    #[arg(long)]
    no_fallback: bool,

    /// Percentage of targets at which "most rules finished" fires
    #[arg(long, default_value = "80")]
    most_rules_percent: u32,
}

// =============================================================================
// TLS Arguments (shared by coordinator and minion)
// =============================================================================

#[derive(Parser, Debug)]
struct TlsArgs {
    /// Enable mutual TLS for all gRPC communication
    #[arg(long)]
    tls: bool,

    /// Path to CA certificate (PEM format)
    #[arg(long, requires = "tls")]
    ca_cert: Option<PathBuf>,

    /// Path to this process's certificate (PEM format)
    #[arg(long, requires = "tls")]
    cert: Option<PathBuf>,

    /// Path to this process's private key (PEM format)
    #[arg(long, requires = "tls")]
    key: Option<PathBuf>,

    /// Allow running in plaintext when --tls is set but certs are
    /// missing. Useful for development, not for production.
    #[arg(long)]
    allow_insecure: bool,
}

impl TlsArgs {
    fn into_config(self) -> Result<TlsConfig, Box<dyn std::error::Error>> {
        let config = TlsConfig {
            enabled: self.tls,
            ca_cert_path: self.ca_cert,
            cert_path: self.cert,
            key_path: self.key,
            allow_insecure: self.allow_insecure,
        };
        if config.enabled && !config.is_complete() && !config.allow_insecure {
            return Err("TLS enabled but missing required paths (--ca-cert, --cert, --key)".into());
        }
        Ok(config)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls = args.tls.into_config()?;

    let spec = GraphSpec::load(&args.graph)?;
    let graph = spec.build_graph()?;
    let oracle = Arc::new(StaticCacheOracle::new(
        spec.remote_cache_hits.clone(),
        spec.local_cache_hits.clone(),
    ));

    let config = CoordinatorConfig {
        listen_addr: format!("0.0.0.0:{}", args.port).parse()?,
        heartbeat_timeout_ms: args.heartbeat_timeout_ms,
        event_publish_margin_ms: args.publish_margin_ms,
        most_rules_percent: args.most_rules_percent,
        tls,
        ..CoordinatorConfig::default()
    };

    let node = Arc::new(CoordinatorNode::new(config, graph, Arc::new(NoopNotifier)));
    let token = install_shutdown_handler();

    tracing::info!(
        build_id = %node.build_id(),
        listen_addr = %args.port,
        targets = spec.targets.len(),
        "Starting coordinator"
    );
    println!("Build id: {}", node.build_id());

    node.start(oracle, Arc::new(NoopUploader), &token);

    let serve_node = node.clone();
    let serve_token = token.clone();
    let server = tokio::spawn(async move { serve_node.serve(serve_token).await });

    let exit = tokio::select! {
        exit = node.wait_for_exit() => exit,
        _ = token.cancelled() => {
            node.coordinator().cancel("Interrupted by signal");
            node.wait_for_exit().await
        }
    };

    // Minions learn about completion on their next poll; give them one.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    token.cancel();
    server.await??;

    print_summary(&node, &exit);
    std::process::exit(exit.code);
}

// =============================================================================
// Minion
// =============================================================================

async fn run_minion(args: MinionArgs) -> Result<(), Box<dyn std::error::Error>> {
    let tls = args.tls.into_config()?;
    let build_id = BuildId::parse(&args.build_id)?;
    let minion_id = args
        .minion_id
        .unwrap_or_else(|| format!("minion-{}", &BuildId::generate().as_str()[..8]));

    let config = MinionConfig {
        minion_id,
        coordinator_addr: args.coordinator.clone(),
        max_parallel_units: args.slots,
        poll_interval_ms: args.poll_interval_ms,
        build_command: args.command,
        tls: tls.clone(),
        ..MinionConfig::default()
    };

    let connection = Arc::new(GrpcCoordinatorConnection::new(args.coordinator, tls));
    let executor = executor_from_command(config.build_command.clone());
    let minion = Minion::new(
        config,
        build_id,
        connection,
        executor,
        Arc::new(NoCompletionSignal),
    );

    minion.run(install_shutdown_handler()).await?;
    Ok(())
}

// =============================================================================
// Joint Build
// =============================================================================

async fn run_build(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    if args.racing && args.local_command.is_none() {
        return Err("--racing requires --local-command".into());
    }

    let spec = GraphSpec::load(&args.graph)?;
    let graph = spec.build_graph()?;
    let oracle = Arc::new(StaticCacheOracle::new(
        spec.remote_cache_hits.clone(),
        spec.local_cache_hits.clone(),
    ));

    let mut config = CoordinatorConfig {
        most_rules_percent: args.most_rules_percent,
        ..CoordinatorConfig::default()
    };
    if let Some(port) = args.port {
        config.listen_addr = format!("0.0.0.0:{}", port).parse()?;
    }

    let signals = Arc::new(RaceSignals::new());
    let notifier: Arc<dyn RemoteBuildNotifier> = signals.clone();
    let node = Arc::new(CoordinatorNode::new(config, graph, notifier));
    let token = install_shutdown_handler();

    tracing::info!(
        build_id = %node.build_id(),
        minions = args.minions,
        racing = args.racing,
        "Starting joint build"
    );

    node.start(oracle, Arc::new(NoopUploader), &token);

    if args.port.is_some() {
        let serve_node = node.clone();
        let serve_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_node.serve(serve_token).await {
                tracing::error!(error = %e, "gRPC server failed");
            }
        });
    }

    let executor = executor_from_command(args.command.clone());
    for i in 0..args.minions.max(1) {
        let minion = Minion::new(
            MinionConfig {
                minion_id: format!("local-{}", i),
                build_command: args.command.clone(),
                ..MinionConfig::default()
            },
            node.build_id().clone(),
            node.in_process_connection(),
            executor.clone(),
            node.completion_checker(),
        );
        let minion_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = minion.run(minion_token).await {
                tracing::error!(error = %e, "Minion failed");
            }
        });
    }

    let race = RaceConfig {
        racing_enabled: args.racing,
        local_fallback: !args.no_fallback,
    };
    let exit = match args.local_command {
        Some(local_command) => {
            let runner = Arc::new(ShellLocalRunner {
                command: local_command,
            });
            let controller = BuildController::new(
                node.coordinator(),
                signals,
                runner,
                race.racing_enabled,
                race.local_fallback,
            );
            tokio::select! {
                exit = controller.build() => exit,
                _ = token.cancelled() => {
                    node.coordinator().cancel("Interrupted by signal");
                    ExitState::cancelled("Interrupted by signal")
                }
            }
        }
        None => tokio::select! {
            exit = node.wait_for_exit() => exit,
            _ = token.cancelled() => {
                node.coordinator().cancel("Interrupted by signal");
                node.wait_for_exit().await
            }
        },
    };

    // Finish events younger than the publish margin are still pending;
    // drain them before the process goes away.
    node.events().flush_all();
    if args.port.is_some() {
        // External minions and watchers hear about completion on their
        // next poll; give them one.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
    }
    token.cancel();
    print_summary(&node, &exit);
    std::process::exit(exit.code);
}

/// Local build for the racing/synchronized phases: one shell command
/// that builds everything, killed on cancellation.
struct ShellLocalRunner {
    command: String,
}

#[tonic::async_trait]
impl LocalBuildRunner for ShellLocalRunner {
    async fn run_local_build(
        &self,
        mode: LocalBuildMode,
        token: CancellationToken,
    ) -> swarmbuild::Result<i32> {
        tracing::info!(?mode, command = %self.command, "Starting local build");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .spawn()?;

        tokio::select! {
            status = child.wait() => Ok(status?.code().unwrap_or(1)),
            _ = token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                tracing::info!("Local build cancelled");
                Ok(1)
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn executor_from_command(command: Option<String>) -> Arc<dyn BuildExecutor> {
    match command {
        Some(template) => Arc::new(CommandExecutor::new(template)),
        None => {
            tracing::info!("No build command configured, build steps are no-ops");
            Arc::new(NoopExecutor)
        }
    }
}

fn print_summary(node: &CoordinatorNode, exit: &ExitState) {
    let progress = node.coordinator().progress();
    let verdict = if exit.is_success() { "succeeded" } else { "failed" };
    println!("Build {}: {}", verdict, exit.message);
    println!("  scheduled: {}", progress.scheduled);
    println!("  finished:  {}", progress.finished);
    println!("  pruned:    {}", progress.pruned);
    if progress.failed > 0 {
        println!("  failed:    {}", progress.failed);
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Coordinator(coordinator_args) => run_coordinator(coordinator_args).await,
        Commands::Minion(minion_args) => run_minion(minion_args).await,
        Commands::Build(build_args) => run_build(build_args).await,
    }
}
