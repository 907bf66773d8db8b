//! Spynode
//!
//! A lightweight P2P client that tracks unconfirmed transactions against a
//! trusted full node and a rotating fleet of untrusted peers, without
//! validating blocks or holding keys itself.

use std::{net::SocketAddr, path::PathBuf};

use clap::{Arg, Command};
use spynode_core::{config::SpyConfig, listener::Listener, Network, Node};
use tracing::{info, Level};

struct LoggingListener;

impl Listener for LoggingListener {
    fn handle_tx(&self, tx: &spynode_core::Transaction) -> bool {
        info!(txid = %tx.txid(), "tx accepted");
        true
    }

    fn handle_tx_state(&self, kind: spynode_core::listener::TxStateKind, txid: spynode_core::Txid) {
        info!(?kind, %txid, "tx state changed");
    }

    fn handle_block(&self, kind: spynode_core::listener::BlockStateKind, height: u32, hash: spynode_core::BlockHash) {
        info!(?kind, height, %hash, "block state changed");
    }

    fn handle_in_sync(&self) {
        info!("trusted connection reached in-sync");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("spynode")
        .version(spynode_core::VERSION)
        .about("Spynode - trusted/untrusted P2P transaction tracker")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Path to a TOML config file; overrides network defaults where present"),
        )
        .arg(
            Arg::new("network")
                .long("network")
                .value_name("NETWORK")
                .help("Network to use (mainnet, testnet)")
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("node-address")
                .long("node-address")
                .value_name("HOST:PORT")
                .help("Trusted peer to connect to"),
        )
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .value_name("DIR")
                .help("Storage directory"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("tracing_subscriber filter (e.g. info, debug)"),
        )
        .arg(
            Arg::new("daemon")
                .long("daemon")
                .help("Run detached, without a foreground shutdown prompt")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let network = match matches.get_one::<String>("network").unwrap().as_str() {
        "mainnet" => Network::Mainnet,
        "testnet" => Network::Testnet,
        other => {
            eprintln!("invalid network '{other}', use mainnet or testnet");
            std::process::exit(1);
        }
    };

    let mut config = if let Some(path) = matches.get_one::<String>("config") {
        SpyConfig::load(&PathBuf::from(path))?
    } else {
        match network {
            Network::Mainnet => SpyConfig::mainnet_defaults(),
            Network::Testnet => SpyConfig::testnet_defaults(),
        }
    };

    let node_address = matches
        .get_one::<String>("node-address")
        .map(|s| s.parse::<SocketAddr>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid --node-address: {e}"))?;
    let data_dir = matches.get_one::<String>("data-dir").map(PathBuf::from);
    let log_level = matches.get_one::<String>("log-level").cloned();
    let daemon = matches.get_flag("daemon") || config.daemon;

    config = config
        .with_node_address(node_address)
        .with_data_dir(data_dir)
        .with_log_level(log_level);
    config.daemon = daemon;
    config.validate().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let filter = config.log_level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(Level::INFO.to_string())),
        )
        .init();

    info!(
        network = config.network.as_str(),
        node_address = %config.node_address,
        data_dir = %config.data_dir.display(),
        "starting spynode"
    );

    let node = Node::new(config).await?;
    node.register_listener(Box::new(LoggingListener)).await;

    if daemon {
        node.run().await?;
    } else {
        let stopper = tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        });
        tokio::select! {
            result = node.run() => result?,
            _ = stopper => node.stop(),
        }
    }

    Ok(())
}
