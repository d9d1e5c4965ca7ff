//! topology-daemon: Headless topology tracker.
//!
//! Opens one or more managed sessions on an in-process fabric, tracks the
//! membership they observe and prints periodic JSON topology reports.

use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use topology_daemon::{Services, TopologyConfig, parse_discover_entry};

use topology_core::InMemoryFabric;
use topology_core::node::NodeRole;
use topology_core::transport::{EndpointConfig, Hello, RoleFilter};

#[derive(Parser, Debug)]
#[command(name = "topology-daemon")]
#[command(about = "Presence-driven topology tracker")]
struct Args {
    /// Presence namespace shared by every participant
    #[arg(short, long, default_value = "topology")]
    namespace: String,

    /// Identity of the primary session (generated if not provided)
    #[arg(long)]
    identity: Option<String>,

    /// Number of managed sessions to open
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    sessions: u16,

    /// Role announced by the managed sessions
    #[arg(long, default_value = "peer")]
    role: NodeRole,

    /// Heartbeat period in milliseconds
    #[arg(long, default_value_t = 2000, value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_ms: u64,

    /// Reconciliation period in milliseconds (0 disables)
    #[arg(long, default_value_t = 10_000)]
    reconcile_ms: u64,

    /// Run a discovery scan after startup
    #[arg(long)]
    scan: bool,

    /// Seed the discovery table with <role>@<address> (repeatable)
    #[arg(long = "discover", value_parser = parse_discover_entry)]
    discover: Vec<Hello>,

    /// Interval between topology reports in milliseconds
    #[arg(long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    report_ms: u64,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,topology_daemon=debug,topology_core=debug"
    } else {
        "info,topology_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting topology-daemon");
    info!("Namespace: {}", args.namespace);

    let identity = args.identity.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Generated identity: {}", id);
        id
    });

    let config = TopologyConfig {
        namespace: args.namespace,
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        reconcile_interval: (args.reconcile_ms > 0)
            .then(|| Duration::from_millis(args.reconcile_ms)),
        ..TopologyConfig::default()
    };
    config.validate()?;

    let fabric = InMemoryFabric::new();
    fabric.set_discovery(args.discover);

    let handle = topology_daemon::start(config, Services::in_memory(&fabric)).await?;
    let _events = handle.events().subscribe(|event| {
        debug!("Topology event: {:?}", event);
    });

    for i in 0..args.sessions {
        let session_identity = if i == 0 {
            identity.clone()
        } else {
            format!("{}-{}", identity, i)
        };
        let endpoint = EndpointConfig::new(session_identity, args.role)
            .listen(format!("tcp/127.0.0.1:{}", 7447 + u32::from(i)));
        let index = handle.open_session(endpoint).await?;
        debug!("Session {} open", index);
    }

    if args.scan {
        let report = handle.scan(RoleFilter::default()).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    let stop = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop);

    let mut reports = tokio::time::interval(Duration::from_millis(args.report_ms));

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = reports.tick() => {
                let view = handle.view().await?;
                println!("{}", serde_json::to_string_pretty(&view)?);
            }

            _ = &mut stop => {
                info!("Run duration elapsed");
                break;
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    handle.shutdown().await?;
    Ok(())
}
