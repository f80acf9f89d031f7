//! oroute-node: boot overlay nodes on an in-process network.

use clap::{Parser, Subcommand};
use oroute_node::config::{default_config_path, load_config};
use oroute_node::logging::{init_tracing, init_tracing_json};
use oroute_node::{Node, RegistryService};
use oroute_types::config::NodeConfig;
use oroute_types::{Transport, REGISTRY_ADDRESS};
use oroute_wire::memory::MemoryNetwork;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "oroute-node", version, about = "Hierarchical address routing overlay")]
struct Cli {
    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML.
    Config {
        /// Config file (defaults to ~/.oroute/config.toml).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Boot every configured node on one shared in-process network.
    Simulate {
        /// Node config files. The first node issues --call.
        #[arg(long = "config", short, required = true)]
        configs: Vec<PathBuf>,

        /// Also serve a registry at o://registry on this transport.
        #[arg(long)]
        registry: Option<String>,

        /// Call ADDRESS METHOD from the first node, print the response and exit.
        #[arg(long, num_args = 2, value_names = ["ADDRESS", "METHOD"])]
        call: Option<Vec<String>>,

        /// JSON params for --call.
        #[arg(long, default_value = "{}")]
        params: String,
    },
}

fn main() {
    let cli = Cli::parse();
    if cli.json_logs {
        init_tracing_json(&cli.log_level);
    } else {
        init_tracing(&cli.log_level);
    }

    let result = match cli.command {
        Commands::Config { config } => print_config(config),
        Commands::Simulate {
            configs,
            registry,
            call,
            params,
        } => tokio::runtime::Runtime::new()
            .map_err(Into::into)
            .and_then(|rt| rt.block_on(simulate(configs, registry, call, params))),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn print_config(path: Option<PathBuf>) -> CliResult {
    let path = path.unwrap_or_else(default_config_path);
    let config = load_config(Some(&path));
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn simulate(
    configs: Vec<PathBuf>,
    registry: Option<String>,
    call: Option<Vec<String>>,
    params: String,
) -> CliResult {
    let net = MemoryNetwork::new();

    if let Some(transport) = registry {
        Node::builder(NodeConfig {
            address: REGISTRY_ADDRESS.to_string(),
            transports: vec![Transport::physical(transport)],
            ..Default::default()
        })
        .local_handler(Arc::new(RegistryService::new()))
        .boot(net.clone())?;
    }

    let mut nodes = Vec::with_capacity(configs.len());
    for path in &configs {
        nodes.push(Node::builder(load_config(Some(path))).boot(net.clone())?);
    }
    for node in &nodes {
        if let Err(e) = node.announce().await {
            warn!(address = %node.address(), error = %e, "Announce failed");
        }
        if let Err(e) = node.register(Vec::new()).await {
            debug!(address = %node.address(), error = %e, "Not registered");
        }
    }

    match (call, nodes.first()) {
        (Some(call), Some(first)) => {
            let params: serde_json::Value = serde_json::from_str(&params)?;
            let response = first.use_address(&call[0], &call[1], params).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        _ => {
            info!(nodes = nodes.len(), "Simulation running; Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    for node in &nodes {
        node.stop().await;
    }
    Ok(())
}
