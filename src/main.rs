// This is the command line front end for my ledger.
// I load the settings before anything else, because the log level and the data
// directory both come from there and every command needs them. After that each
// command opens the store, does one thing, and reports back on stdout.

use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info};
use std::path::Path;
use std::process;
use std::sync::Arc;
use utxo_ledger::{
    address_to_pub_key_hash, convert_address, hash_pub_key, Blockchain, Command, LedgerError,
    LedgerStore, Opt, ProofOfWork, Result, Settings, SledStore, Transaction, UTXOSet, Wallets,
};

fn main() {
    let opt = Opt::parse();

    let settings = match Settings::load(opt.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // No settings means no configured level yet, so I fall back to info
            init_logger("info");
            error!("Error: {e}");
            process::exit(1);
        }
    };
    init_logger(&settings.log_level);

    if let Err(e) = run_command(opt.command, &settings) {
        error!("Error: {e}");
        process::exit(1);
    }
}

// RUST_LOG still wins over the configured level.
fn init_logger(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn open_store(data_dir: &Path) -> Result<Arc<dyn LedgerStore>> {
    Ok(Arc::new(SledStore::open(data_dir)?))
}

fn open_ledger(settings: &Settings) -> Result<UTXOSet> {
    let store = open_store(&settings.data_dir)?;
    let blockchain = Blockchain::resume(store, settings.mining_config()?)?;
    Ok(UTXOSet::new(blockchain))
}

fn run_command(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::Createblockchain { address } => {
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let store = open_store(&settings.data_dir)?;
            let blockchain =
                Blockchain::initialize(store, &pub_key_hash, settings.mining_config()?)?;
            // The cache starts from the genesis reward.
            let utxo_set = UTXOSet::new(blockchain);
            utxo_set.reindex()?;
            println!("Done!");
        }
        Command::Createwallet => {
            let mut wallets = Wallets::load(settings.wallet_path())?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}");
        }
        Command::GetBalance { address } => {
            let pub_key_hash = address_to_pub_key_hash(&address)?;
            let utxo_set = open_ledger(settings)?;
            let balance = utxo_set.get_balance(&pub_key_hash)?;
            println!("Balance of {address}: {balance}");
        }
        Command::ListAddresses => {
            let wallets = Wallets::load(settings.wallet_path())?;
            for address in wallets.get_addresses() {
                println!("{address}");
            }
        }
        Command::Send { from, to, amount } => {
            let from_hash = address_to_pub_key_hash(&from)?;
            let to_hash = address_to_pub_key_hash(&to)?;

            let wallets = Wallets::load(settings.wallet_path())?;
            let wallet = wallets
                .get_wallet(&from)
                .ok_or_else(|| LedgerError::Wallet(format!("No local wallet for {from}")))?;

            let utxo_set = open_ledger(settings)?;
            // I build and sign the spend before mining anything
            let transaction = Transaction::new_utxo_transaction(wallet, &to_hash, amount, &utxo_set)?;
            // Whoever sends also mines, so the block rewards the sender.
            let coinbase = Transaction::new_coinbase_tx(&from_hash, "")?;
            // Appending through the UTXO set keeps the cache in step with the chain
            let block = utxo_set.append_block(&[coinbase, transaction])?;
            info!("Send from {from} to {to} included in block {}", block.get_hash_hex());
            println!("Success!");
        }
        Command::Print => {
            let utxo_set = open_ledger(settings)?;
            for block in utxo_set.get_blockchain().iterator() {
                let block = block?;
                println!("Pre block hash: {}", HEXLOWER.encode(block.get_pre_block_hash()));
                println!("Cur block hash: {}", block.get_hash_hex());
                println!("Nonce: {}", block.get_nonce());
                println!("Difficulty: {}", block.get_difficulty());
                println!("Merkle root: {}", HEXLOWER.encode(&block.merkle_root()?));
                println!("PoW: {}", ProofOfWork::validate(&block));

                for tx in block.get_transactions() {
                    println!("- Transaction txid_hex: {}", tx.get_id_hex());
                    if !tx.is_coinbase() {
                        for input in tx.get_vin() {
                            let address = convert_address(&hash_pub_key(input.get_pub_key()));
                            println!(
                                "-- Input txid = {}, vout = {}, from = {address}",
                                HEXLOWER.encode(input.get_txid()),
                                input.get_vout(),
                            );
                        }
                    }
                    for output in tx.get_vout() {
                        let address = convert_address(output.get_pub_key_hash());
                        println!("-- Output value = {}, to = {address}", output.get_value());
                    }
                }
                println!();
            }
        }
        Command::Reindexutxo => {
            // Rebuilds the cache from scratch by walking the whole chain
            let utxo_set = open_ledger(settings)?;
            utxo_set.reindex()?;
            let count = utxo_set.count_transactions()?;
            println!("Done! There are {count} transactions in the UTXO set.");
        }
    }
    Ok(())
}
