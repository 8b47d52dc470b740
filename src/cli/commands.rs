use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "utxo-ledger", about = "Single-node proof-of-work UTXO ledger")]
pub struct Opt {
    /// TOML settings file (falls back to LEDGER_CONFIG)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    #[command(name = "createblockchain", about = "Create a new ledger")]
    Createblockchain {
        #[arg(long, help = "The address to send the genesis reward to")]
        address: String,
    },
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(
        name = "getbalance",
        about = "Get the balance of the target address"
    )]
    GetBalance {
        #[arg(long, help = "The wallet address")]
        address: String,
    },
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(
        name = "send",
        about = "Send an amount between addresses and mine it right away"
    )]
    Send {
        #[arg(long, help = "Source wallet address")]
        from: String,
        #[arg(long, help = "Destination wallet address")]
        to: String,
        #[arg(long, help = "Amount to send")]
        amount: u64,
    },
    #[command(name = "print", alias = "printchain", about = "Print every block from tip to genesis")]
    Print,
    #[command(name = "reindexutxo", about = "Rebuild the UTXO index")]
    Reindexutxo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_flags() {
        let opt = Opt::try_parse_from([
            "utxo-ledger",
            "send",
            "--from",
            "a",
            "--to",
            "b",
            "--amount",
            "7",
        ])
        .unwrap();
        assert_eq!(
            opt.command,
            Command::Send {
                from: "a".to_string(),
                to: "b".to_string(),
                amount: 7
            }
        );
        assert!(opt.config.is_none());
    }

    #[test]
    fn test_global_config_and_alias() {
        let opt =
            Opt::try_parse_from(["utxo-ledger", "printchain", "--config", "ledger.toml"]).unwrap();
        assert_eq!(opt.command, Command::Print);
        assert_eq!(opt.config, Some(PathBuf::from("ledger.toml")));
    }

    #[test]
    fn test_missing_address_rejected() {
        assert!(Opt::try_parse_from(["utxo-ledger", "getbalance"]).is_err());
    }
}
