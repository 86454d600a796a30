//! duel: run one side of a timed scoring round against a peer.
//!
//! The host listens, the guest connects. Commands are read line by line
//! from stdin; state is kept in `--data-dir` so a restarted peer can pick
//! up the round it was in.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use duel_core::{Action, Input, Orientation, Peer, PeerConfig, Role, RoundId};
use duel_peer::{FileStore, HostListener, ReconnectConfig, Runner, report};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "duel")]
#[command(about = "Two-peer timed scoring rounds")]
#[command(group(ArgGroup::new("link").required(true).args(["listen", "connect"])))]
struct Args {
    /// Host a duel: address to listen on (e.g. 0.0.0.0:7878)
    #[arg(short, long)]
    listen: Option<String>,

    /// Join a duel: host WebSocket URL (e.g. ws://192.168.1.20:7878)
    #[arg(short, long)]
    connect: Option<String>,

    /// Lock a role (a or b) on startup
    #[arg(short, long)]
    role: Option<Role>,

    /// Directory for round snapshots and history
    #[arg(long, default_value = ".duel")]
    data_dir: PathBuf,

    /// Resume this round instead of the last one
    #[arg(long)]
    resume: Option<RoundId>,

    /// Print every event as a JSON line instead of text
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,duel_core=debug,duel_peer=debug"
    } else {
        "info,duel_core=info,duel_peer=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let orientation = if args.listen.is_some() {
        Orientation::Initiator
    } else {
        Orientation::Answerer
    };
    info!("Starting duel as {:?}", orientation);
    info!("Data directory: {:?}", args.data_dir);

    let store = FileStore::open(&args.data_dir)
        .with_context(|| format!("Cannot use data directory {:?}", args.data_dir))?;
    let config = PeerConfig::default();
    let tick = config.tick_interval;
    let mut peer = Peer::new(orientation, store, config);

    // Print what the user should see; everything else goes to the log
    let json = args.json;
    let _events = peer.events().subscribe(move |event| {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Cannot serialize event: {}", e),
            }
        } else if let Some(line) = report::describe(&event) {
            println!("{line}");
        }
    });

    let now = duel_core::clock::now_ms();
    match peer.resume(args.resume.as_ref(), now) {
        Some(round_id) => println!("resumed round {round_id}"),
        None => {
            if let Some(round_id) = &args.resume {
                println!("round {round_id} cannot be resumed");
            }
        }
    }
    if let Some(role) = args.role {
        // A conflicting resumed role is reported as a notice
        let _ = peer.dispatch(Input::Action(Action::LockRole(role)), now);
    }

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if command_tx.send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });

    println!("{}", duel_peer::command::help());
    let mut runner = Runner::new(peer, command_rx, tick);

    let run = async {
        match &args.listen {
            Some(addr) => {
                let listener = HostListener::bind(addr).await?;
                runner.run_host(&listener).await
            }
            None => {
                let url = args.connect.as_deref().context("--connect is required")?;
                runner.run_guest(url, &ReconnectConfig::default()).await
            }
        }
    };

    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}
