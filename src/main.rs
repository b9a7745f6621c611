use clap::{Parser, Subcommand};
use std::sync::Arc;

use meshforge::config::NodeConfig;
use meshforge::core::types::ChainIndex;
use meshforge::network::{self, NodeState};
use meshforge::storage::Stores;

const DEFAULT_DATA_DIR: &str = "meshforge_data";

#[derive(Parser)]
#[command(name = "meshforge", version)]
#[command(about = "MeshForge - a sharded proof-of-work BlockDAG node")]
struct Cli {
    #[arg(long, default_value = DEFAULT_DATA_DIR, global = true)]
    data_dir: String,
    /// Override the configured listen port
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directory and genesis state
    Init,
    /// Run the broker node
    Node {
        /// Peers to dial on startup, in addition to the configured bootstrap
        #[arg(short, long)]
        connect: Vec<String>,
    },
    /// Show chain state
    Info,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshforge=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone();

    match cli.command {
        Commands::Init => {
            std::fs::create_dir_all(&data_dir).unwrap();
            let config = load_config(&data_dir, cli.port);
            let _ = config.save(&data_dir);
            let state = open_node(&data_dir, config);
            let genesis = state.flow.genesis_hash(ChainIndex::new(0, 0));
            println!("🔨 MeshForge initialized");
            println!("  Data:    {}", data_dir);
            println!(
                "  Groups:  {} ({} chains)",
                state.config.broker.groups,
                state.config.consensus.chain_count()
            );
            println!(
                "  Broker:  {}/{}",
                state.config.broker.broker_id, state.config.broker.broker_num
            );
            println!("  Genesis: {}", hex::encode(genesis));
            println!("\n  Run: meshforge node");
        }

        Commands::Node { connect } => {
            let config = load_config(&data_dir, cli.port);
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(run_node(data_dir, config, connect));
        }

        Commands::Info => {
            let config = load_config(&data_dir, cli.port);
            let state = open_node(&data_dir, config);
            println!("📊 MeshForge");
            println!("  Blocks known: {}", state.flow.num_hashes());
            for ci in state.config.broker.owned_chains() {
                let tip = state.flow.best_tip(ci);
                let height = state
                    .flow
                    .multi_chain()
                    .read(ci, |c| c.header_chain().hash_chain().get_height(&tip))
                    .unwrap_or(0);
                println!("  Chain {}: height {} tip {}", ci, height, &hex::encode(tip)[..16]);
            }
        }
    }
}

fn load_config(data_dir: &str, port: Option<u16>) -> NodeConfig {
    let mut config = NodeConfig::load(data_dir);
    if let Some(port) = port {
        config.network.listen_port = port;
    }
    config
}

fn open_node(data_dir: &str, config: NodeConfig) -> Arc<NodeState> {
    let db_path = std::path::Path::new(data_dir).join("db");
    let stores = Arc::new(Stores::open(db_path).unwrap_or_else(|e| {
        eprintln!("Failed to open database: {}", e);
        std::process::exit(1);
    }));
    NodeState::new(config, stores).unwrap_or_else(|e| {
        eprintln!("Failed to initialize node: {}", e);
        std::process::exit(1);
    })
}

async fn run_node(data_dir: String, config: NodeConfig, connect: Vec<String>) {
    std::fs::create_dir_all(&data_dir).unwrap();
    let state = open_node(&data_dir, config);

    ctrlc::set_handler(move || {
        tracing::info!("Shutting down");
        std::process::exit(0);
    })
    .expect("failed to install shutdown handler");

    // Periodic mempool maintenance for every owned group
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                state.config.mempool.clean_frequency_ms,
            ));
            loop {
                interval.tick().await;
                for group in state.config.broker.owned_groups() {
                    if let Some(mempool) = state.mempool_for(group) {
                        let world = state.world_for_group(group);
                        mempool.clean(network::now_ms(), &world);
                    }
                }
            }
        });
    }

    // Dial configured and requested peers
    let peers: Vec<String> = state
        .config
        .discovery
        .bootstrap
        .iter()
        .cloned()
        .chain(connect.into_iter())
        .collect();
    for addr in peers {
        let state = state.clone();
        tokio::spawn(async move {
            network::connect_to_peer(state, addr).await;
        });
    }

    if let Err(e) = network::start_listener(state).await {
        tracing::error!("Listener failed: {}", e);
    }
}
