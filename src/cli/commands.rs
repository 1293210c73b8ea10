use crate::core::DEFAULT_TRANSACTION_FEE;
use clap::{Parser, Subcommand};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Parser)]
#[command(name = "utxo-ledger")]
pub struct Opt {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "createwallet", about = "Create a new wallet")]
    Createwallet,
    #[command(name = "listaddresses", about = "Print local wallet addresses")]
    ListAddresses,
    #[command(
        name = "getbalance",
        about = "Get the wallet balance of the target address"
    )]
    GetBalance {
        #[arg(help = "The wallet address")]
        address: String,
    },
    #[command(name = "view", about = "Print the tip and the newest blocks")]
    View {
        #[arg(long, default_value_t = 10, help = "How many blocks to show")]
        limit: usize,
    },
    #[command(name = "mine", about = "Mine one block on this node's chain")]
    Mine {
        #[arg(help = "The address receiving the reward and fees")]
        address: String,
    },
    #[command(name = "transfer", about = "Send coins between addresses")]
    Transfer {
        #[arg(help = "Source wallet address")]
        from: String,
        #[arg(help = "Destination wallet address")]
        to: String,
        #[arg(help = "Amount to send (in base units)")]
        amount: u64,
        #[arg(long, default_value_t = DEFAULT_TRANSACTION_FEE, help = "Fee (in base units)")]
        fee: u64,
        #[arg(long, help = "Mine a block with the transaction right away")]
        mine: bool,
        #[arg(long, help = "Also send the transaction to this peer")]
        peer: Option<String>,
    },
    #[command(name = "reindexutxo", about = "Rebuild UTXO index set")]
    Reindexutxo,
    #[command(name = "startnode", about = "Start a ledger node with an interactive console")]
    StartNode {
        #[arg(long, help = "Enable mining mode and send reward to ADDRESS")]
        miner: Option<String>,
        #[arg(long = "peer", help = "Peer to connect to, may be repeated")]
        peers: Vec<String>,
    },
}

/// One line typed into the `startnode` console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Mine { address: Option<String> },
    AddPeer { address: String },
    DelPeer { address: String },
    Sync { peer: Option<String> },
    View { limit: usize },
    Transfer {
        from: String,
        to: String,
        amount: u64,
        fee: u64,
    },
    Balance { address: String },
    BumpFee {
        from: String,
        txid: String,
        fee: u64,
    },
    Peers,
    Mempool,
    Help,
    Quit,
}

impl ConsoleCommand {
    pub const USAGE: &'static str = "\
mine [ADDRESS]                     mine one block
addpeer HOST:PORT                  add a neighbor
delpeer HOST:PORT                  remove a neighbor
sync [HOST:PORT]                   sync with one peer or the heaviest one
view [LIMIT]                       show the tip and newest blocks
transfer FROM TO AMOUNT [FEE]      pay from a local wallet
balance ADDRESS                    show an address balance
bumpfee FROM TXID FEE              raise the fee of a pooled payment
peers                              list neighbors
mempool                            list pending transactions
quit                               stop the node";
}

fn number(arg: Option<&str>, name: &str) -> Result<u64, String> {
    let arg = arg.ok_or_else(|| format!("missing {name}"))?;
    arg.parse::<u64>()
        .map_err(|_| format!("invalid {name}: {arg}"))
}

fn required(arg: Option<&str>, name: &str) -> Result<String, String> {
    arg.map(str::to_string)
        .ok_or_else(|| format!("missing {name}"))
}

impl FromStr for ConsoleCommand {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let name = words.next().ok_or_else(|| "empty command".to_string())?;
        let mut arg = || words.next();

        let command = match name.to_lowercase().as_str() {
            "mine" => ConsoleCommand::Mine {
                address: arg().map(str::to_string),
            },
            "addpeer" => ConsoleCommand::AddPeer {
                address: required(arg(), "peer address")?,
            },
            "delpeer" => ConsoleCommand::DelPeer {
                address: required(arg(), "peer address")?,
            },
            "sync" => ConsoleCommand::Sync {
                peer: arg().map(str::to_string),
            },
            "view" => ConsoleCommand::View {
                limit: match arg() {
                    Some(limit) => number(Some(limit), "limit")? as usize,
                    None => 10,
                },
            },
            "transfer" => {
                let from = required(arg(), "source address")?;
                let to = required(arg(), "destination address")?;
                let amount = number(arg(), "amount")?;
                let fee = match arg() {
                    Some(fee) => number(Some(fee), "fee")?,
                    None => DEFAULT_TRANSACTION_FEE,
                };
                ConsoleCommand::Transfer {
                    from,
                    to,
                    amount,
                    fee,
                }
            }
            "balance" => ConsoleCommand::Balance {
                address: required(arg(), "address")?,
            },
            "bumpfee" => ConsoleCommand::BumpFee {
                from: required(arg(), "source address")?,
                txid: required(arg(), "transaction id")?,
                fee: number(arg(), "fee")?,
            },
            "peers" => ConsoleCommand::Peers,
            "mempool" => ConsoleCommand::Mempool,
            "help" => ConsoleCommand::Help,
            "quit" | "exit" => ConsoleCommand::Quit,
            other => return Err(format!("unknown command: {other} (try help)")),
        };

        if let Some(extra) = arg() {
            return Err(format!("unexpected argument: {extra}"));
        }
        Ok(command)
    }
}

impl fmt::Display for ConsoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleCommand::Mine { .. } => "mine",
            ConsoleCommand::AddPeer { .. } => "addpeer",
            ConsoleCommand::DelPeer { .. } => "delpeer",
            ConsoleCommand::Sync { .. } => "sync",
            ConsoleCommand::View { .. } => "view",
            ConsoleCommand::Transfer { .. } => "transfer",
            ConsoleCommand::Balance { .. } => "balance",
            ConsoleCommand::BumpFee { .. } => "bumpfee",
            ConsoleCommand::Peers => "peers",
            ConsoleCommand::Mempool => "mempool",
            ConsoleCommand::Help => "help",
            ConsoleCommand::Quit => "quit",
        };
        write!(f, "{name}")
    }
}
