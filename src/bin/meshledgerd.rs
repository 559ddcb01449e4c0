use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use colored::*;
use tokio::sync::mpsc;

use meshledger::config::{NodeConfig, NETWORK_STARTUP_DELAY_SEC};
use meshledger::miner;
use meshledger::net::node::{P2PNode, P2pCommand};
use meshledger::net::spv;
use meshledger::node::context::{NodeContext, NodeRole};
use meshledger::rpc::server::start_gateway_server;

fn banner() {
    println!("{}", " __  __ ___ ___ _  _ _    ___ ___   ___ ___ ___ ".bright_cyan());
    println!("{}", "|  \\/  | __/ __| || | |  | __|   \\ / __| __| _ \\".bright_cyan());
    println!("{}", "| |\\/| | _|\\__ \\ __ | |__| _|| |) | (_ | _||   /".bright_cyan().bold());
    println!("{}", "|_|  |_|___|___/_||_|____|___|___/ \\___|___|_|_\\".blue());
    println!();
    println!(
        "{}",
        "      proof-of-work ledger for sensor networks      ".bright_green().bold()
    );
    println!();
}

fn usage() -> ! {
    eprintln!("usage: meshledgerd <FULL|MINER|GATEWAY|WALLET|SPV> <port> [seed_ip] [seed_port]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    banner();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        usage();
    }
    let Some(role) = NodeRole::parse(&args[1]) else { usage() };
    let Ok(port) = args[2].parse::<u16>() else { usage() };
    let seed: Option<SocketAddr> = match (args.get(3), args.get(4)) {
        (Some(ip), Some(p)) => match format!("{ip}:{p}").parse() {
            Ok(addr) => Some(addr),
            Err(_) => usage(),
        },
        (Some(_), None) | (None, Some(_)) => usage(),
        (None, None) => None,
    };

    // SPV composes nothing but the header-sync session
    if role == NodeRole::Spv {
        let Some(seed) = seed else {
            eprintln!("{} SPV role needs a seed peer", "[init]".bright_red().bold());
            std::process::exit(1);
        };
        match spv::run_spv_session(seed).await {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("{} spv session failed: {e}", "[init]".bright_red().bold());
                std::process::exit(1);
            }
        }
    }

    let config = NodeConfig::with_port(port);
    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        eprintln!("{} cannot create data dir {}: {e}", "[init]".bright_red().bold(), config.data_dir);
        std::process::exit(1);
    }

    let (p2p_tx, p2p_rx) = mpsc::unbounded_channel();
    let ctx = match NodeContext::bootstrap(config.clone(), role, p2p_tx.clone()) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("{} identity unavailable: {e}", "[init]".bright_red().bold());
            std::process::exit(1);
        }
    };

    println!("{} role:     {}", "[init]".bright_blue().bold(), role.as_str());
    println!("{} address:  {}", "[init]".bright_blue().bold(), ctx.wallet.address());
    println!("{} data dir: {}", "[init]".bright_blue().bold(), config.data_dir);
    println!("{} height:   {}", "[init]".bright_blue().bold(), ctx.height().await);
    println!();

    // fatal init failures inside background tasks end the process non-zero
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(1);

    let p2p_ctx = ctx.clone();
    let p2p_fatal = fatal_tx.clone();
    tokio::spawn(async move {
        let node = P2PNode::new(p2p_ctx);
        if let Err(e) = node.start(port, p2p_rx).await {
            let _ = p2p_fatal.send(format!("p2p listener: {e}")).await;
        }
    });

    if let Some(seed) = seed {
        let tx = p2p_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(NETWORK_STARTUP_DELAY_SEC)).await;
            eprintln!("[p2p] dialing seed {seed}");
            let _ = tx.send(P2pCommand::Connect(seed));
        });
    }

    // mempool housekeeping
    let sweep_ctx = ctx.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(600));
        loop {
            tick.tick().await;
            sweep_ctx.mempool.lock().await.prune_expired();
        }
    });

    let miner_handle = if role.can_mine() {
        Some(miner::spawn_worker(ctx.clone(), tokio::runtime::Handle::current()))
    } else {
        None
    };

    if role.serves_http() {
        let gateway_ctx = ctx.clone();
        let gateway_port = config.gateway_port;
        let gateway_fatal = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = start_gateway_server(gateway_ctx, gateway_port).await {
                let _ = gateway_fatal.send(format!("gateway: {e}")).await;
            }
        });
    }

    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("{} signal received", "[shutdown]".bright_red().bold());
            0
        }
        err = fatal_rx.recv() => {
            eprintln!(
                "{} {}",
                "[fatal]".bright_red().bold(),
                err.unwrap_or_else(|| "background task lost".to_string())
            );
            1
        }
    };

    // ordered teardown: ingress stops with the process, then mining, then
    // the final chain snapshot
    ctx.shutdown.store(true, Ordering::SeqCst);
    if let Some(handle) = miner_handle {
        let _ = handle.join();
    }
    ctx.persist().await;
    println!("{} done", "[shutdown]".bright_red().bold());
    std::process::exit(exit_code);
}
