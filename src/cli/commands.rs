use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::signal;

use crate::blockchain::{Blockchain, BlockchainStorage, ProofOfWork, Transaction, UtxoSet};
use crate::config::Config;

#[derive(Parser)]
#[command(name = "utxo-chain")]
#[command(about = "A single-node UTXO ledger with proof of work")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Data directory")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Proof of work difficulty (leading zero bits) for new chains")]
    pub target_bits: Option<u32>,

    #[arg(long, global = true, help = "Enable debug logging")]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a blockchain and send the genesis block reward to ADDRESS
    #[command(name = "createblockchain")]
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Get the balance of ADDRESS
    #[command(name = "getbalance")]
    GetBalance {
        #[arg(long)]
        address: String,

        #[arg(long, help = "Read the UTXO index instead of scanning the chain")]
        indexed: bool,
    },

    /// Send AMOUNT of coins from FROM to TO
    Send {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: u64,
    },

    /// Print all the blocks of the blockchain
    #[command(name = "printchain")]
    PrintChain,

    /// Rebuild the UTXO index
    #[command(name = "reindexutxo")]
    ReindexUtxo,
}

pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(level));

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(target_bits) = cli.target_bits {
        config.target_bits = target_bits;
    }
    config.validate()?;

    match cli.command {
        Commands::CreateBlockchain { address } => create_blockchain(&config, &address),
        Commands::GetBalance { address, indexed } => get_balance(&config, &address, indexed),
        Commands::Send { from, to, amount } => send(&config, &from, &to, amount).await,
        Commands::PrintChain => print_chain(&config),
        Commands::ReindexUtxo => reindex_utxo(&config),
    }
}

fn open_storage(config: &Config) -> anyhow::Result<Arc<BlockchainStorage>> {
    info!("Opening block store at {}", config.data_dir.display());
    Ok(Arc::new(BlockchainStorage::open(&config.data_dir)?))
}

fn load_chain(config: &Config) -> anyhow::Result<Blockchain> {
    Ok(Blockchain::load(open_storage(config)?)?)
}

fn create_blockchain(config: &Config, address: &str) -> anyhow::Result<()> {
    let chain = Blockchain::create(
        open_storage(config)?,
        address,
        &config.genesis_message,
        config.target_bits,
    )?;

    println!("Done! Genesis block {}", hex::encode(chain.tip_hash()));
    Ok(())
}

fn get_balance(config: &Config, address: &str, indexed: bool) -> anyhow::Result<()> {
    let chain = load_chain(config)?;

    let balance = if indexed {
        UtxoSet::new(&chain).balance_of(address)?
    } else {
        chain.balance_of(address)?
    };

    println!("Balance of '{}': {}", address, balance);
    Ok(())
}

async fn send(config: &Config, from: &str, to: &str, amount: u64) -> anyhow::Result<()> {
    let chain = Arc::new(load_chain(config)?);
    let transaction = Transaction::new_utxo(from, to, amount, chain.as_ref())?;

    let cancel = Arc::new(AtomicBool::new(false));
    let mut worker = {
        let chain = Arc::clone(&chain);
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || chain.append_cancellable(vec![transaction], &cancel))
    };

    let block = tokio::select! {
        result = &mut worker => result??,
        _ = signal::ctrl_c() => {
            warn!("Interrupt received, cancelling mining");
            cancel.store(true, Ordering::Relaxed);
            worker.await??
        }
    };

    println!("Success! Block {}", hex::encode(&block.hash));
    Ok(())
}

fn print_chain(config: &Config) -> anyhow::Result<()> {
    let chain = load_chain(config)?;

    for block in chain.iter() {
        let block = block?;

        println!("============ Block {} ============", hex::encode(&block.hash));
        println!("Prev. block: {}", hex::encode(&block.prev_block_hash));
        println!("Nonce: {}", block.nonce);
        println!("PoW: {}", ProofOfWork::new(&block).validate());
        for transaction in &block.transactions {
            println!("{}", transaction);
        }
        println!();
    }

    Ok(())
}

fn reindex_utxo(config: &Config) -> anyhow::Result<()> {
    let chain = load_chain(config)?;
    let count = UtxoSet::new(&chain).reindex()?;

    println!("Done! There are {} transactions in the UTXO set.", count);
    Ok(())
}
