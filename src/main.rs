use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shoal::admin::{render_structure, Admin};
use shoal::client::Client;
use shoal::config::Config;
use shoal::index::{FsStorage, JsonlLibrary};
use shoal::master::Master;
use shoal::models::{Hit, NodeId, Query, ShardName};
use shoal::node::rpc::HttpConnector;
use shoal::node::server::NodeServer;
use shoal::node::Node;
use shoal::store::server::StoreServer;
use shoal::store::RemoteStore;
use shoal::utils::{normalize_whitespace, truncate_text};

#[derive(Parser)]
#[command(
    name = "shoal",
    version,
    about = "Sharded search cluster: coordination store, master, nodes and query client",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    /// Configuration file (TOML); environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Coordination store URL, overriding the configuration
    #[arg(long, global = true)]
    store: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination store service
    Store {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run a master (one is active, others stand by)
    Master,

    /// Run a shard-serving node
    Node {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,

        /// host:port other processes reach this node at
        #[arg(long)]
        address: Option<String>,

        /// Working directory for fetched shards
        #[arg(long)]
        shard_dir: Option<PathBuf>,
    },

    /// Register an index and wait until it is deployed
    AddIndex {
        name: String,

        /// Directory (or file:// URL) holding one shard per entry
        location: String,

        /// Analyzer the documents were indexed with
        #[arg(short, long, default_value = "standard")]
        analyzer: String,

        /// Number of nodes serving each shard
        #[arg(short, long)]
        replication: Option<u32>,

        /// Return right after registering
        #[arg(long, default_value = "false")]
        no_wait: bool,
    },

    /// Remove an index and undeploy its shards
    RemoveIndex { name: String },

    /// List registered indexes
    ListIndexes,

    /// List live nodes
    ListNodes,

    /// Count matching documents
    Count {
        query: String,

        /// Indexes to query (comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        indexes: Vec<String>,
    },

    /// Search and print the best hits
    Search {
        query: String,

        /// Indexes to query (comma separated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        indexes: Vec<String>,

        /// Number of results to return
        #[arg(short = 'k', long, default_value = "10")]
        limit: usize,

        /// Also print the stored fields of every hit
        #[arg(long, default_value = "false")]
        details: bool,
    },

    /// Print the stored fields of one document
    Details {
        /// Node that returned the hit
        #[arg(long)]
        node: String,

        /// Shard as index#shard
        #[arg(long)]
        shard: String,

        /// Shard-local document id
        #[arg(long)]
        doc: u32,
    },

    /// Dump the cluster tree
    ShowStructure,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing/logging
    setup_tracing(&cli.log_format, cli.verbose)?;

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(url) = &cli.store {
        config.store.url = url.clone();
    }

    if let Err(e) = shoal::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics initialization failed");
    }

    match cli.command {
        Commands::Store { bind } => {
            if let Some(bind) = bind {
                config.store.bind_address = bind.parse().context("invalid --bind address")?;
            }
            config.validate()?;
            run_store(config).await?;
        }

        Commands::Master => {
            config.validate()?;
            run_master(config).await?;
        }

        Commands::Node {
            bind,
            address,
            shard_dir,
        } => {
            if let Some(bind) = bind {
                config.node.bind_address = bind.parse().context("invalid --bind address")?;
            }
            if address.is_some() {
                config.node.advertised_address = address;
            }
            if let Some(dir) = shard_dir {
                config.node.shard_dir = dir;
            }
            config.validate()?;
            run_node(config).await?;
        }

        Commands::AddIndex {
            name,
            location,
            analyzer,
            replication,
            no_wait,
        } => {
            tracing::info!(
                index = %name,
                location = %location,
                analyzer = %analyzer,
                replication = ?replication,
                "Starting add-index command"
            );
            let admin = Admin::new(connect(&config).await?, &config);
            let record = if no_wait {
                admin
                    .register_index(&name, &location, &analyzer, replication)
                    .await?
            } else {
                admin
                    .add_index(&name, &location, &analyzer, replication)
                    .await?
            };
            println!(
                "Index '{}' {} (replication {})",
                record.name,
                if record.deployed { "deployed" } else { "registered" },
                record.replication
            );
        }

        Commands::RemoveIndex { name } => {
            let admin = Admin::new(connect(&config).await?, &config);
            admin.remove_index(&name).await?;
            println!("Index '{name}' removed");
        }

        Commands::ListIndexes => {
            let admin = Admin::new(connect(&config).await?, &config);
            let indexes = admin.list_indexes().await?;
            println!(
                "{:<24} {:<18} {:<10} {:>6} {:>4}  LOCATION",
                "NAME", "STATE", "ANALYZER", "SHARDS", "REPL"
            );
            for index in indexes {
                println!(
                    "{:<24} {:<18} {:<10} {:>6} {:>4}  {}",
                    index.name,
                    format!("{:?}", index.state),
                    index.analyzer,
                    index.shard_count,
                    index.replication,
                    index.location
                );
            }
        }

        Commands::ListNodes => {
            let admin = Admin::new(connect(&config).await?, &config);
            let nodes = admin.list_nodes().await?;
            println!(
                "{:<28} {:<16} {:<14} {:>7} {:>6}  STARTED",
                "ID", "NAME", "STATUS", "HEALTHY", "SHARDS"
            );
            for node in nodes {
                println!(
                    "{:<28} {:<16} {:<14} {:>7} {:>6}  {}",
                    node.id,
                    node.name,
                    node.status,
                    node.healthy,
                    node.open_shards,
                    node.start_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::Count { query, indexes } => {
            let client = connect_client(&config).await?;
            let count = client.count(&Query::new(query, indexes)).await?;
            println!("{count}");
            client.close().await?;
        }

        Commands::Search {
            query,
            indexes,
            limit,
            details,
        } => {
            let client = connect_client(&config).await?;
            let query = Query::new(query, indexes).with_limit(limit);
            let started = std::time::Instant::now();
            let hits = client.search(&query).await?;
            println!(
                "{} hits, showing {} ({:.1} ms)",
                hits.total,
                hits.len(),
                started.elapsed().as_secs_f64() * 1000.0
            );
            for (rank, hit) in hits.hits.iter().enumerate() {
                println!(
                    "{:>3}. {:.4}  {}  {}  doc {}",
                    rank + 1,
                    hit.score,
                    hit.node,
                    hit.shard,
                    hit.doc_id
                );
                if details {
                    match client.details(hit).await {
                        Ok(fields) => {
                            for (name, value) in fields {
                                let value = normalize_whitespace(&value);
                                println!("       {name}: {}", truncate_text(&value, 120));
                            }
                        }
                        Err(e) => println!("       <{e}>"),
                    }
                }
            }
            client.close().await?;
        }

        Commands::Details { node, shard, doc } => {
            let client = connect_client(&config).await?;
            let hit = Hit {
                node: NodeId::new(node),
                shard: ShardName::parse(&shard)?,
                doc_id: doc,
                score: 0.0,
            };
            let fields = client.details(&hit).await?;
            for (name, value) in fields {
                println!("{name}: {value}");
            }
            client.close().await?;
        }

        Commands::ShowStructure => {
            let admin = Admin::new(connect(&config).await?, &config);
            let entries = admin.show_structure().await?;
            print!("{}", render_structure(&entries));
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("shoal=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("shoal=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
}

async fn connect(config: &Config) -> Result<Arc<RemoteStore>> {
    RemoteStore::connect(
        &config.store.url,
        config.heartbeat_interval(),
        Duration::from_millis(config.store.poll_wait_ms),
    )
    .await
    .with_context(|| format!("cannot reach coordination store at {}", config.store.url))
}

async fn connect_client(config: &Config) -> Result<Arc<Client>> {
    let store = connect(config).await?;
    let connector = Arc::new(HttpConnector::new(config.request_timeout())?);
    Ok(Client::connect(store, connector, config).await?)
}

async fn run_store(config: Config) -> Result<()> {
    tracing::info!(
        bind = %config.store.bind_address,
        session_timeout_ms = config.store.session_timeout_ms,
        "Starting coordination store"
    );
    let server = StoreServer::new(config.store);
    server.start_with_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn run_master(config: Config) -> Result<()> {
    let store = connect(&config).await?;
    let master = Master::new(store, Arc::new(FsStorage::new()), &config);
    master.start().await?;
    tracing::info!(master = %master.id(), root = %config.store.root_path, "Master running");

    shutdown_signal().await;
    master.shutdown().await?;
    Ok(())
}

async fn run_node(config: Config) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.node.bind_address)
        .await
        .with_context(|| format!("cannot bind {}", config.node.bind_address))?;
    let id = NodeId::new(config.advertised_node_address());

    let store = connect(&config).await?;
    let node = Node::new(
        id,
        store,
        Arc::new(JsonlLibrary::new()),
        Arc::new(FsStorage::new()),
        &config,
    );
    node.start().await?;

    let server = NodeServer::new(Arc::clone(&node));
    server.serve(listener, shutdown_signal()).await?;
    node.shutdown().await?;
    Ok(())
}
