use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanroom_net::config::RoomFile;
use lanroom_net::driver::{CaptureDriver, NetConfigurator, TunnelDriver};
use lanroom_net::test_util::packets;
use lanroom_net::test_util::{MemoryCapture, MemoryNetConfigurator, MemoryTunnelDriver};
use lanroom_net::{BroadcastRelay, RoomRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long `simulate` waits for each relayed copy.
const SEND_WAIT: Duration = Duration::from_millis(500);

/// Offline tooling for room files.
///
/// Rooms are built against in-memory drivers; nothing on the host network
/// is touched.
#[derive(Parser, Debug)]
#[command(name = "lanroom", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a room file and print a summary
    Check {
        /// Path to the room file (JSON)
        file: PathBuf,
    },
    /// Build every room against an in-memory driver and print its configuration
    Render {
        /// Path to the room file (JSON)
        file: PathBuf,
    },
    /// Relay one broadcast packet through the configured peers and print the copies
    Simulate {
        /// Path to the room file (JSON)
        file: PathBuf,

        /// UDP destination port of the simulated broadcast
        #[arg(long, default_value = "4445")]
        port: u16,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Check { file } => check(&file),
        Command::Render { file } => render(&file),
        Command::Simulate { file, port } => simulate(&file, port),
    }
}

fn load(file: &Path) -> Result<RoomFile> {
    RoomFile::load(file).with_context(|| format!("Failed to load {}", file.display()))
}

fn check(file: &Path) -> Result<()> {
    let rooms = load(file)?;
    for room in &rooms.rooms {
        println!(
            "{}: port {}, address {}, {} peer(s)",
            room.name,
            room.listen_port,
            room.adapter_address,
            room.peers.len()
        );
    }
    println!("{} room(s) OK", rooms.rooms.len());
    Ok(())
}

/// Registry and relay wired to in-memory drivers, populated from `rooms`.
fn build(rooms: &RoomFile, capture: Arc<MemoryCapture>) -> Result<RoomRegistry> {
    let relay = Arc::new(BroadcastRelay::new(
        capture as Arc<dyn CaptureDriver>,
        rooms.relay.clone(),
    ));
    let registry = RoomRegistry::new(
        Arc::new(MemoryTunnelDriver::new()) as Arc<dyn TunnelDriver>,
        Arc::new(MemoryNetConfigurator::new()) as Arc<dyn NetConfigurator>,
        relay,
    );

    for room in &rooms.rooms {
        registry
            .create_room(room.settings())
            .with_context(|| format!("Failed to create room {}", room.name))?;
        for entry in &room.peers {
            let peer = entry.to_peer()?;
            registry
                .add_peer(&room.name, peer)
                .with_context(|| format!("Failed to add peer {} to {}", entry.name, room.name))?;
        }
    }
    Ok(registry)
}

fn render(file: &Path) -> Result<()> {
    let rooms = load(file)?;
    let registry = build(&rooms, Arc::new(MemoryCapture::new()))?;
    for name in registry.room_names() {
        println!("# {name}");
        println!("{}", registry.adapter_config(&name)?);
    }
    registry.shutdown();
    Ok(())
}

fn simulate(file: &Path, port: u16) -> Result<()> {
    let rooms = load(file)?;
    let capture = Arc::new(MemoryCapture::new());
    let registry = build(&rooms, Arc::clone(&capture))?;
    let relay = Arc::clone(registry.relay());

    let expected = relay.len();
    let source = rooms
        .rooms
        .first()
        .map(|r| r.adapter_address)
        .context("Room file has no rooms")?;

    relay.run().context("Failed to start broadcast relay")?;
    info!(source = %source, targets = expected, "Injecting broadcast");
    capture.inject(packets::broadcast_udp(source, port, port, b"lanroom"));

    for _ in 0..expected {
        match capture.recv_sent(SEND_WAIT) {
            Some(copy) => match packets::dst_addr(&copy) {
                Some(dst) => println!("{source} -> {dst}"),
                None => warn!("Relayed copy is not IPv4"),
            },
            None => {
                warn!("Timed out waiting for relayed copy");
                break;
            }
        }
    }

    relay.shutdown();
    registry.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_marked_offline() {
        let cmd = Args::command();
        cmd.clone().debug_assert();
        let about = cmd.get_about().map(|a| a.to_string()).unwrap_or_default();
        assert!(about.contains("Offline"));
        let long = cmd.get_long_about().map(|a| a.to_string()).unwrap_or_default();
        assert!(long.contains("in-memory drivers"));
    }
}
