//! PathFast: Split-Tunnel Proxy Router
//!
//! Main entry point. Initializes the global allocator, sets up logging and
//! dispatches the command line.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use pathfast_network::{
    DnsResolver, EchoConfig, EchoServer, HttpClient, LatencyProbe, SubnetScanner, SystemPinger,
};
use pathfast_tunnel::{
    AppConfig, DeviceLease, NodeSource, NodeValidator, ProcessEngineFactory,
    ProcessOutboundRegistry, RemoteNodeSource, RoutePolicyManager, RouteTable, RuleAssets,
    RuleStore, SessionComponents, TunnelSession, system_route_table,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "pathfast", version, about = "Split-tunnel proxy router")]
struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a session through a proxy node and wait for Ctrl-C
    Connect {
        /// Node name, matched exactly
        #[arg(long)]
        proxy: String,
        /// Install split-tunnel routes for a routed device
        #[arg(long)]
        route: bool,
    },
    /// List available proxy nodes
    Nodes,
    /// Measure round-trip latency against an echo server
    Probe {
        /// Echo server address (host:port)
        addr: String,
        #[arg(long, default_value_t = 5)]
        count: usize,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        #[arg(long, default_value = "pathfast-probe")]
        payload: String,
    },
    /// Find an unused address in a subnet
    Scan {
        /// Subnet to scan; defaults to the default network's subnet
        #[arg(long)]
        cidr: Option<Ipv4Net>,
    },
    /// Download the latest rule sets
    RefreshRules,
    /// Run the diagnostic TCP echo server
    EchoServer {
        #[arg(short, long, default_value = "0.0.0.0")]
        address: IpAddr,
        #[arg(short, long, default_value_t = 19999)]
        port: u16,
        /// Read deadline in seconds
        #[arg(long, default_value_t = 30)]
        read_timeout: u64,
        /// Write deadline in seconds
        #[arg(long, default_value_t = 30)]
        write_timeout: u64,
        /// Do not log connection statistics
        #[arg(long)]
        no_stats: bool,
    },
}

fn init_logging(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pathfast=info,pathfast_network=info,pathfast_tunnel=info"));

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .with(file_layer)
        .init();
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let config = AppConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn node_source(config: &AppConfig, client: HttpClient) -> Arc<dyn NodeSource> {
    Arc::new(RemoteNodeSource::new(client, config.nodes_url(), config.nodes.clone()))
}

async fn open_rules(config: &AppConfig) -> Result<Arc<RuleStore>> {
    let store = RuleStore::open(config.rules_dir(), RuleAssets::bundled())
        .await
        .context("opening rule assets")?;
    Ok(Arc::new(store))
}

async fn connect(config: &AppConfig, proxy: &str, route: bool) -> Result<()> {
    let client = HttpClient::with_defaults();
    let rules = open_rules(config).await?;
    let table = system_route_table();

    let validator = NodeValidator::new(
        node_source(config, client),
        Arc::new(ProcessOutboundRegistry::new(
            config.engine.binary.clone(),
            config.data_dir.join("probe"),
        )),
        Arc::new(DnsResolver::with_defaults().context("initializing DNS resolver")?),
        config.validator_config(),
    );
    let session = TunnelSession::new(SessionComponents {
        validator,
        engines: Arc::new(ProcessEngineFactory::default()),
        engine_settings: config.engine_settings(),
        routes: RoutePolicyManager::new(table, rules, config.route_policy()),
    });

    let info = session.start(proxy, route).await?;
    println!(
        "Connected via {} ({}), latency {:?}",
        info.proxy, info.server_ip, info.latency
    );

    if let Some(network) = &info.network {
        let scanner = SubnetScanner::new(config.scan_config(), Arc::new(SystemPinger));
        let cancel = CancellationToken::new();
        match scanner
            .find_unused_address(network.local_subnet.trunc(), &cancel)
            .await
        {
            Ok(address) => println!("Device settings: {}", DeviceLease::for_network(address, network)),
            Err(e) => warn!("No free address for a routed device: {}", e),
        }
    }

    println!("Press Ctrl-C to disconnect");
    shutdown_signal().await;

    session.stop().await?;
    println!("Disconnected");
    Ok(())
}

async fn list_nodes(config: &AppConfig) -> Result<()> {
    let nodes = node_source(config, HttpClient::with_defaults())
        .fetch_nodes()
        .await?;
    if nodes.is_empty() {
        println!("No nodes available");
    }
    for node in nodes {
        println!("{:<24} {:<12} {}:{}", node.name, node.protocol, node.host, node.port);
    }
    Ok(())
}

async fn probe(addr: &str, count: usize, interval: Duration, timeout: Duration, payload: &str) -> Result<()> {
    let probe = LatencyProbe::new(addr).with_timeout(timeout);
    probe.connect().await?;

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.cancel();
    });

    let results = probe.multi_test(payload.as_bytes(), count, interval, &cancel).await;
    for (i, result) in results.iter().enumerate() {
        match &result.error {
            None => println!(
                "#{:<3} {} bytes  {:?}  match={}",
                i + 1,
                result.data_size,
                result.latency,
                result.is_matching
            ),
            Some(err) => println!("#{:<3} failed: {}", i + 1, err),
        }
    }
    probe.close().await;
    println!("{}", probe.summary());
    Ok(())
}

async fn scan(config: &AppConfig, cidr: Option<Ipv4Net>) -> Result<()> {
    let (cidr, network) = match cidr {
        Some(cidr) => (cidr, None),
        None => {
            let network = system_route_table()
                .default_network()
                .await
                .context("reading default network")?;
            (network.local_subnet.trunc(), Some(network))
        }
    };

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stopper.cancel();
    });

    info!("Scanning {}", cidr);
    let scanner = SubnetScanner::new(config.scan_config(), Arc::new(SystemPinger));
    let address = scanner.find_unused_address(cidr, &cancel).await?;
    match network {
        Some(network) => println!("{}", DeviceLease::for_network(address, &network)),
        None => println!("{}", address),
    }
    Ok(())
}

async fn refresh_rules(config: &AppConfig) -> Result<()> {
    let store = open_rules(config).await?;
    let report = store
        .refresh(&HttpClient::with_defaults(), &config.rule_sources())
        .await?;
    println!(
        "Rule assets v{}: {} downloaded, {} bundled",
        report.version,
        report.fetched.len(),
        report.fallback.len()
    );
    if !report.fallback.is_empty() {
        let names: Vec<_> = report.fallback.iter().map(|k| k.tag()).collect();
        println!("Using bundled copy of: {}", names.join(", "));
    }
    Ok(())
}

async fn echo_server(config: EchoConfig) -> Result<()> {
    let server = EchoServer::new(config);
    let token = server.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
    server.run().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_ref())?;

    let config = load_config(cli.config.as_ref())?;
    info!("PathFast {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Connect { proxy, route } => connect(&config, &proxy, route).await,
        Command::Nodes => list_nodes(&config).await,
        Command::Probe {
            addr,
            count,
            interval_ms,
            timeout_ms,
            payload,
        } => {
            if count == 0 {
                bail!("--count must be at least 1");
            }
            probe(
                &addr,
                count,
                Duration::from_millis(interval_ms),
                Duration::from_millis(timeout_ms),
                &payload,
            )
            .await
        }
        Command::Scan { cidr } => scan(&config, cidr).await,
        Command::RefreshRules => refresh_rules(&config).await,
        Command::EchoServer {
            address,
            port,
            read_timeout,
            write_timeout,
            no_stats,
        } => {
            echo_server(EchoConfig {
                listen_addr: SocketAddr::new(address, port),
                read_timeout: Duration::from_secs(read_timeout),
                write_timeout: Duration::from_secs(write_timeout),
                log_stats: !no_stats,
                ..EchoConfig::default()
            })
            .await
        }
    }
}
