//! Voice Client Application
//!
//! Connects to a relay and streams microphone audio, playing back what
//! other clients send. Driven by line commands on stdin.
//!
//! Usage: `client [--config <path>] [--headless]`
//!
//! `--headless` runs without audio hardware (nothing is captured or played).

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_voice_relay::{
    audio::device::NullDevice,
    client::ConnectionSupervisor,
    codec::create_codec,
    config::AppConfig,
};

const HELP: &str = "\
Commands:
  devices              list audio devices
  connect <host:port>  connect to a relay
  talk                 start streaming audio
  stop                 stop streaming audio
  mute                 toggle microphone mute
  disconnect           close the connection
  status               show session statistics
  quit                 exit";

fn print_devices(client: &ConnectionSupervisor) {
    println!("\n=== Available Audio Devices ===");
    for device in client.list_audio_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn print_status(client: &ConnectionSupervisor) {
    let stats = client.stats();
    println!(
        "connected: {}, talking: {}, muted: {}",
        stats.connected, stats.talking, stats.muted
    );
    println!(
        "  audio: {} frames captured, {} chunks encoded, {} frames decoded, {} silence",
        stats.bridge.frames_captured,
        stats.bridge.chunks_encoded,
        stats.bridge.frames_decoded,
        stats.bridge.silence_frames
    );
    println!(
        "  queues: outgoing {} ({} dropped), incoming {} ({} dropped), playback {} ({} dropped)",
        stats.bridge.outgoing_depth,
        stats.bridge.outgoing_dropped,
        stats.bridge.incoming_depth,
        stats.bridge.incoming_dropped,
        stats.bridge.playback_depth,
        stats.bridge.playback_dropped
    );
    if let Some(link) = stats.link {
        println!(
            "  link: {} chunks sent ({:.1} KB), {} chunks received ({:.1} KB)",
            link.chunks_sent,
            link.bytes_sent as f64 / 1024.0,
            link.chunks_received,
            link.bytes_received as f64 / 1024.0
        );
    }
}

/// Run one command line; returns `false` on `quit`
fn handle_command(client: &mut ConnectionSupervisor, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };

    match command {
        "devices" => print_devices(client),
        "connect" => {
            let default_port = client.config().relay.port;
            let target = parts.next().unwrap_or("127.0.0.1");
            let (host, port) = match target.rsplit_once(':') {
                Some((host, port)) => match port.parse() {
                    Ok(port) => (host, port),
                    Err(_) => {
                        println!("Invalid port: {}", port);
                        return true;
                    }
                },
                None => (target, default_port),
            };
            if client.connect(host, port) {
                println!("Connected to {}:{}", host, port);
            } else {
                println!("Could not connect to {}:{}", host, port);
            }
        }
        "talk" => {
            if !client.start_talking() {
                println!("Not talking (connect first)");
            }
        }
        "stop" => client.stop_talking(),
        "mute" => {
            let muted = client.toggle_mute();
            println!("{}", if muted { "Muted" } else { "Unmuted" });
        }
        "disconnect" => client.disconnect(),
        "status" => print_status(client),
        "quit" | "exit" => return false,
        "help" => println!("{}", HELP),
        other => println!("Unknown command: {} (try 'help')", other),
    }

    while let Some(e) = client.bridge().check_errors() {
        tracing::warn!("Codec error: {}", e);
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Voice Client");

    let mut config_path = None;
    let mut headless = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--headless" => headless = true,
            "--config" => config_path = Some(args.next().context("--config needs a path")?),
            other => anyhow::bail!("Unknown argument: {}", other),
        }
    }

    let config = match config_path {
        Some(path) => AppConfig::load(&path).with_context(|| format!("Loading {}", path))?,
        None => AppConfig::load_or_default()?,
    };
    config.validate()?;

    let mut client = if headless {
        let (encoder, decoder) = create_codec(&config.audio)?;
        ConnectionSupervisor::new(config, Box::new(NullDevice::new()), encoder, decoder)
    } else {
        ConnectionSupervisor::with_defaults(config)?
    };

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        if !handle_command(&mut client, line.trim()) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.stop_talking();
    client.disconnect();
    tracing::info!("Client stopped");
    Ok(())
}
