// Entry point of the ledger node CLI. Every subcommand opens this node's own
// database under the data directory, so several nodes can share a machine.
use clap::Parser;
use log::{error, info, LevelFilter};
use std::io::{self, BufRead, Write};
use std::process;
use utxo_ledger::cli::{Command, ConsoleCommand, Opt};
use utxo_ledger::core::monetary::conversions::format_units;
use utxo_ledger::{
    validate_address, Node, PeerTransport, TcpTransport, Wallets, GLOBAL_CONFIG,
};

fn main() {
    // Info by default, RUST_LOG still wins
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt.command) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn open_node() -> Result<Node, Box<dyn std::error::Error>> {
    let policy = GLOBAL_CONFIG.load_policy()?;
    let data_dir = GLOBAL_CONFIG.get_data_dir();
    Ok(Node::open(data_dir, &GLOBAL_CONFIG.get_node_addr(), policy)?)
}

fn run_command(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Createwallet => {
            let mut wallets = Wallets::new()?;
            let address = wallets.create_wallet()?;
            println!("Your new address: {address}")
        }
        Command::ListAddresses => {
            let wallets = Wallets::new()?;
            for address in wallets.get_addresses() {
                println!("{address}")
            }
        }
        Command::GetBalance { address } => {
            let node = open_node()?;
            let balance = node.balance(&address)?;
            println!("Balance of {address}: {balance} ({})", format_units(balance));
        }
        Command::View { limit } => {
            let node = open_node()?;
            print!("{}", node.view(limit)?);
        }
        Command::Mine { address } => {
            let node = open_node()?;
            let block = node.mine(&address)?;
            println!("Mined block {} at height {}", block.get_hash(), block.get_height());
        }
        Command::Transfer {
            from,
            to,
            amount,
            fee,
            mine,
            peer,
        } => {
            if !validate_address(&from) {
                return Err(format!("Invalid sender address: {from}").into());
            }
            let wallets = Wallets::new()?;
            let wallet = wallets.require_wallet(&from)?;
            let node = open_node()?;
            let tx = node.transfer(wallet, &to, amount, fee)?;
            println!("Submitted transaction {}", tx.get_id_hex());

            if let Some(peer) = peer {
                let policy = node.policy();
                let transport = TcpTransport::new(policy.network.request_timeout());
                transport.post_tx(&peer, &GLOBAL_CONFIG.get_node_addr(), &tx)?;
                println!("Sent to {peer}");
            }
            if mine {
                let block = node.mine(&from)?;
                println!("Mined block {} at height {}", block.get_hash(), block.get_height());
            }
        }
        Command::Reindexutxo => {
            let node = open_node()?;
            let count = node.reindex_utxo()?;
            println!("Done! There are {count} unspent outputs in the UTXO set.");
        }
        Command::StartNode { miner, peers } => {
            let node = open_node()?;
            if let Some(address) = &miner {
                if !validate_address(address) {
                    return Err(format!("Invalid miner address: {address}").into());
                }
                GLOBAL_CONFIG.set_mining_addr(address.clone());
            }
            for peer in &peers {
                node.add_peer(peer)?;
            }
            node.start()?;
            if let Some(address) = &miner {
                node.start_mining(address)?;
            }
            run_console(&node)?;
        }
    }
    Ok(())
}

fn run_console(node: &Node) -> Result<(), Box<dyn std::error::Error>> {
    info!("Node {} is up, type help for commands", node.address());
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };
        if command == ConsoleCommand::Quit {
            break;
        }
        let name = command.to_string();
        if let Err(e) = run_console_command(node, command) {
            error!("{name} failed: {e}");
        }
    }
    node.stop_mining();
    info!("Shutting down");
    Ok(())
}

fn run_console_command(
    node: &Node,
    command: ConsoleCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ConsoleCommand::Mine { address } => {
            let address = address
                .or_else(|| GLOBAL_CONFIG.get_mining_addr())
                .ok_or("No address given and MINING_ADDRESS is not set")?;
            let block = node.mine(&address)?;
            println!("Mined block {} at height {}", block.get_hash(), block.get_height());
        }
        ConsoleCommand::AddPeer { address } => {
            if node.add_peer(&address)? {
                println!("Added {address}");
            } else {
                println!("{address} is already a peer");
            }
        }
        ConsoleCommand::DelPeer { address } => {
            if node.remove_peer(&address)? {
                println!("Removed {address}");
            } else {
                println!("{address} is not a peer");
            }
        }
        ConsoleCommand::Sync { peer } => match node.sync(peer.as_deref())? {
            Some(outcome) => println!("{outcome:?}"),
            None => println!("No peer is ahead of us"),
        },
        ConsoleCommand::View { limit } => print!("{}", node.view(limit)?),
        ConsoleCommand::Transfer {
            from,
            to,
            amount,
            fee,
        } => {
            let wallets = Wallets::new()?;
            let tx = node.transfer(wallets.require_wallet(&from)?, &to, amount, fee)?;
            println!("Submitted transaction {}", tx.get_id_hex());
        }
        ConsoleCommand::Balance { address } => {
            let balance = node.balance(&address)?;
            println!("Balance of {address}: {balance} ({})", format_units(balance));
        }
        ConsoleCommand::BumpFee { from, txid, fee } => {
            let wallets = Wallets::new()?;
            let tx = node.bump_fee(wallets.require_wallet(&from)?, &txid, fee)?;
            println!("Replaced {txid} with {}", tx.get_id_hex());
        }
        ConsoleCommand::Peers => {
            for peer in node.peers()? {
                println!(
                    "{} {} height {} difficulty {} failed syncs {}",
                    peer.address,
                    peer.status,
                    peer.height,
                    peer.cumulative_difficulty,
                    peer.failed_syncs
                );
            }
        }
        ConsoleCommand::Mempool => {
            for entry in node.mempool_entries() {
                println!(
                    "{} fee-rate {} size {} sequence {}",
                    entry.get_transaction().get_id_hex(),
                    entry.get_fee_rate(),
                    entry.get_size(),
                    entry.get_sequence()
                );
            }
        }
        ConsoleCommand::Help => println!("{}", ConsoleCommand::USAGE),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}
