use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keycombo_core::config;
use keycombo_core::ipc::{self, ClientMsg, ComboStatus, DaemonMsg};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

#[derive(Parser)]
#[command(name = "keycomboctl", about = "Control the keycombod daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show detector state and lease counts
    Status,
    /// Ask the daemon to shut down
    Stop,
}

fn print_status(status: &ComboStatus, version: &str) {
    println!("keycombod v{}", version);
    println!("  phase:     {}", status.phase);
    println!("  down keys: {}/{}", status.down_pressed, status.down_target);
    println!("  up keys:   {}", status.up_pressed);
    println!("  leases:    held={} up={}", status.held_leases, status.up_leases);
    println!("  fired:     held={} released={}", status.held_fired, status.released_fired);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let socket_path = config::socket_path();
    let stream = UnixStream::connect(&socket_path).with_context(|| {
        format!(
            "connecting to keycombod at {}\nIs the daemon running?",
            socket_path.display()
        )
    })?;

    let mut writer = stream.try_clone().context("cloning stream")?;
    let reader = BufReader::new(stream);

    let msg = match cli.command {
        Command::Status => ClientMsg::GetStatus,
        Command::Stop => ClientMsg::Shutdown,
    };

    writer
        .write_all(ipc::encode(&msg).as_bytes())
        .context("sending command")?;

    for line in reader.lines() {
        let line = line.context("reading response")?;
        let Some(resp) = ipc::decode_daemon(&line) else {
            continue;
        };
        match resp {
            DaemonMsg::Status { status, version } => print_status(&status, &version),
            DaemonMsg::Ack { ok, message } => {
                if ok {
                    println!("{}", message);
                } else {
                    eprintln!("error: {}", message);
                    std::process::exit(1);
                }
            }
        }
        return Ok(());
    }

    bail!("daemon closed the connection without replying")
}
