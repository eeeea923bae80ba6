use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// Genesis allocation given as `PUBLIC_KEY_HEX:BALANCE[:POWER]`
#[derive(Debug, Clone)]
pub struct AllocationArg {
    pub public_key: String,
    pub balance: u64,
    pub power: u64,
}

impl FromStr for AllocationArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        let parse = |value: &str| {
            value
                .parse::<u64>()
                .map_err(|e| format!("Invalid number {value} in allocation {s}: {e}"))
        };
        match parts.as_slice() {
            [public_key, balance] => Ok(AllocationArg {
                public_key: public_key.to_string(),
                balance: parse(*balance)?,
                power: 1,
            }),
            [public_key, balance, power] => Ok(AllocationArg {
                public_key: public_key.to_string(),
                balance: parse(*balance)?,
                power: parse(*power)?,
            }),
            _ => Err(format!(
                "Invalid allocation: {s}. Use PUBLIC_KEY_HEX:BALANCE or PUBLIC_KEY_HEX:BALANCE:POWER"
            )),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "strand-chain")]
pub struct Opt {
    #[arg(long = "config", global = true, help = "TOML configuration file")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "createaccount", about = "Create the local account key")]
    CreateAccount,
    #[command(name = "createchain", about = "Create a new chain and follow it")]
    CreateChain {
        #[arg(help = "Community name the chain id starts with")]
        name: String,
        #[arg(long = "alloc", help = "Genesis allocation PUBLIC_KEY_HEX:BALANCE[:POWER]")]
        allocations: Vec<AllocationArg>,
    },
    #[command(name = "follow", about = "Start replicating a chain")]
    Follow {
        #[arg(help = "Chain id (hex)")]
        chain: String,
    },
    #[command(name = "unfollow", about = "Stop replicating a chain and delete its data")]
    Unfollow {
        #[arg(help = "Chain id (hex)")]
        chain: String,
    },
    #[command(name = "getbalance", about = "Show an account's state on a chain")]
    GetBalance {
        #[arg(help = "Chain id (hex)")]
        chain: String,
        #[arg(help = "Public key (hex), defaults to the local account")]
        account: Option<String>,
    },
    #[command(name = "printchain", about = "Print the main chain from the best block down")]
    Printchain {
        #[arg(help = "Chain id (hex)")]
        chain: String,
        #[arg(long = "json", help = "Print JSON instead of text")]
        json: bool,
        #[arg(long = "limit", help = "Print at most this many blocks")]
        limit: Option<usize>,
    },
    #[command(name = "send", about = "Send a transfer and wait for it to be mined locally")]
    Send {
        #[arg(help = "Chain id (hex)")]
        chain: String,
        #[arg(help = "Receiver public key (hex)")]
        to: String,
        #[arg(help = "Amount to transfer")]
        amount: u64,
        #[arg(long = "fee", default_value_t = 1, help = "Fee paid to the miner")]
        fee: u64,
    },
    #[command(name = "startnode", about = "Run every followed chain")]
    StartNode {
        #[arg(long = "seconds", help = "Stop after this many seconds")]
        seconds: Option<u64>,
    },
    #[command(name = "devnet", about = "Run several in-process nodes on one new chain")]
    Devnet {
        #[arg(long = "nodes", default_value_t = 3)]
        nodes: usize,
        #[arg(long = "seconds", default_value_t = 60)]
        seconds: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_parsing() {
        let alloc: AllocationArg = "abcd:500".parse().unwrap();
        assert_eq!((alloc.balance, alloc.power), (500, 1));
        let alloc: AllocationArg = "abcd:500:3".parse().unwrap();
        assert_eq!(alloc.power, 3);
        assert!("abcd".parse::<AllocationArg>().is_err());
        assert!("abcd:lots".parse::<AllocationArg>().is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let opt = Opt::parse_from(["strand-chain", "send", "00ff", "abcd", "10", "--fee", "2"]);
        assert!(matches!(opt.command, Command::Send { amount: 10, fee: 2, .. }));
    }
}
