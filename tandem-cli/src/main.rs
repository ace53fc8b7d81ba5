//! `tandem` command line.
//!
//! # Usage
//!
//! ```bash
//! # Run the rendezvous server (default 127.0.0.1:9000)
//! tandem serve --bind 0.0.0.0:9000
//!
//! # Two participants agree on a channel name out of band
//! tandem join HelloTwin --server ws://relay.example:9000
//! ```
//!
//! Settings come from `tandem.toml`, then `TANDEM_*` variables, then flags.

mod config;
mod repl;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use tandem_link::{
    ConnectionManager, PeerEvent, RendezvousServer, SyncedStore, WsRendezvous,
};
use tandem_store::ReplicatedStore;

use crate::repl::Command;

/// Two-party session with a shared, replicated store
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the rendezvous server
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,
    },
    /// Join a channel as host or guest
    Join {
        /// Channel name shared with the other participant
        channel: String,
        /// Rendezvous server URL
        #[arg(long)]
        server: Option<String>,
        /// Directory for the local store
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Store name inside the data directory
        #[arg(long)]
        store: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = config::load();

    match cli.command {
        Mode::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            serve(config).await
        }
        Mode::Join {
            channel,
            server,
            data_dir,
            store,
        } => {
            if let Some(server) = server {
                config.server_url = server;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(store) = store {
                config.store_name = store;
            }
            join(config, channel).await
        }
    }
}

async fn serve(config: config::Config) -> anyhow::Result<()> {
    let server = RendezvousServer::new(config.server_config());

    tokio::select! {
        result = server.run() => result.map_err(|e| anyhow::anyhow!(e))?,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            log::info!(
                "Shutting down: {} sessions served, {} claims granted, {} refused, {} frames routed",
                stats.total_sessions,
                stats.claims_granted,
                stats.claims_refused,
                stats.frames_routed,
            );
        }
    }
    Ok(())
}

async fn join(config: config::Config, channel: String) -> anyhow::Result<()> {
    let store_config = config.store_config();
    std::fs::create_dir_all(&store_config.root)
        .with_context(|| format!("creating {}", store_config.root.display()))?;
    let store = ReplicatedStore::open(store_config).context("opening local store")?;

    let rendezvous = Arc::new(WsRendezvous::new(config.server_url.clone()));
    let conn = ConnectionManager::new(channel, rendezvous, config.link_config());
    let synced = SyncedStore::new(store, conn.clone());

    let watchers = spawn_watchers(&conn, &synced);
    conn.start();
    println!("{}", repl::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        let command = match repl::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        match command {
            Command::Set { key, value } => match synced.set(&key, value, None).await {
                Ok(Some(version)) => println!("stored {key} @ {version}"),
                Ok(None) => println!("{key} unchanged"),
                Err(e) => println!("set failed: {e}"),
            },
            Command::Get { key } => match synced.get(&key).await {
                Ok(Some(entry)) => println!("{key} = {} @ {}", entry.value, entry.version),
                Ok(None) => println!("{key} is not set"),
                Err(e) => println!("get failed: {e}"),
            },
            Command::Keys => match synced.keys().await {
                Ok(keys) if keys.is_empty() => println!("(empty)"),
                Ok(keys) => keys.iter().for_each(|k| println!("{k}")),
                Err(e) => println!("keys failed: {e}"),
            },
            Command::Tone => play_tone(&conn),
            Command::Status => println!("{}", conn.status()),
            Command::Help => println!("{}", repl::HELP),
            Command::Quit => break,
        }
    }

    conn.shutdown();
    for watcher in watchers {
        watcher.abort();
    }
    synced.store().map().flush().context("flushing local store")?;
    Ok(())
}

/// Print status changes, store changes and stream events as they happen.
fn spawn_watchers(conn: &ConnectionManager, synced: &SyncedStore) -> Vec<tokio::task::JoinHandle<()>> {
    let mut status = conn.watch_status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().to_string();
            println!("[status] {current}");
        }
    });

    let mut changes = synced.subscribe();
    let changes_task = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => println!(
                    "[changed] {} = {} @ {}",
                    change.key, change.value, change.version
                ),
                Err(RecvError::Lagged(n)) => log::warn!("Missed {n} change notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut events = conn.subscribe();
    let mut media = conn.incoming_media();
    let events_task = tokio::spawn(async move {
        let mut heard = 0.0f64;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PeerEvent::PeerStreamEstablished { remote, .. }) => {
                        println!("[media] stream established with {remote}");
                    }
                    Ok(PeerEvent::RemoteData(_)) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                frame = media.recv() => match frame {
                    Ok(frame) => {
                        let before = heard.floor();
                        heard += frame.duration_secs();
                        if heard.floor() > before {
                            println!("[media] {heard:.0}s of audio received");
                        }
                    }
                    Err(RecvError::Lagged(n)) => log::debug!("Dropped {n} audio frames"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    vec![status_task, changes_task, events_task]
}

/// Pace a one-second 440 Hz tone onto the outgoing media leg.
fn play_tone(conn: &ConnectionManager) {
    const FRAME_MS: u32 = 20;
    let frames = repl::tone_frames(440.0, 1.0, 48_000, FRAME_MS);
    let sink = conn.media_sender();

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(FRAME_MS as u64));
        for frame in frames {
            tick.tick().await;
            if sink.send(frame).is_err() {
                log::debug!("No live call; tone not sent");
                return;
            }
        }
        log::info!("Test tone sent");
    });
}
