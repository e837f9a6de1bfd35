use std::process::exit;
use std::time::Duration;

use _core::{
    init_stderr_logging, list_ports, Channel, DiagSession, ProtocolConfig, DEFAULT_BAUD_RATE,
};
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "motor-diag", about = "Motor controller diagnostics over a serial link")]
struct Args {
    /// Serial port (e.g., /dev/ttyUSB0, COM3)
    #[arg(short, long, global = true)]
    port: Option<String>,
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE, global = true)]
    baud: u32,
    /// Attempts per command
    #[arg(long, global = true)]
    retries: Option<u32>,
    /// Command acknowledgement timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Read the 200 samples of one channel (0-4)
    Read { channel: u8 },
    /// Enable or disable the AC stage
    Ac { state: Switch },
    /// Trigger the auxiliary FS action
    Fs,
    /// Send a raw command, e.g. "<CA:1>"
    Send {
        command: String,
        /// Acceptable response; repeat for alternatives (defaults to the echo)
        #[arg(short, long)]
        expect: Vec<String>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_stderr_logging(args.verbose);

    if let Command::Ports = args.command {
        let ports = list_ports().context("listing serial ports")?;
        if ports.is_empty() {
            println!("No serial ports found.");
        }
        for port in ports {
            println!("{}\t{}", port.name, port.description);
        }
        return Ok(());
    }

    let mut config = ProtocolConfig::default().with_baud_rate(args.baud);
    if let Some(retries) = args.retries {
        config = config.with_command_retries(retries);
    }
    if let Some(ms) = args.timeout_ms {
        config = config.with_command_timeout(Duration::from_millis(ms));
    }

    let Some(port) = args.port.as_deref() else {
        bail!("--port is required for this command");
    };
    let mut session = DiagSession::new(config).context("starting session")?;
    session
        .open(port, args.baud)
        .with_context(|| format!("opening {port}"))?;

    let outcome = execute(&mut session, args.command);
    if let Err(e) = session.close() {
        log::warn!("close failed: {e}");
    }
    outcome
}

fn execute(session: &mut DiagSession, command: Command) -> Result<()> {
    match command {
        Command::Ports => {}
        Command::Read { channel } => {
            let channel = Channel::new(channel)?;
            let samples = session
                .read_channel(channel)
                .with_context(|| format!("reading channel {channel}"))?;
            for (i, value) in samples.iter().enumerate() {
                println!("{i}\t{value}");
            }
        }
        Command::Ac { state } => {
            let enabled = matches!(state, Switch::On);
            session.set_ac(enabled)?;
            println!("AC {}", if enabled { "enabled" } else { "disabled" });
        }
        Command::Fs => {
            session.trigger_fs()?;
            println!("FS acknowledged");
        }
        Command::Send { command, expect } => {
            let expected: Vec<&str> = if expect.is_empty() {
                vec![command.as_str()]
            } else {
                expect.iter().map(String::as_str).collect()
            };
            let retries = session.config().command_retries;
            match session.send_command_expecting_any(&command, &expected, retries)? {
                Some(response) => println!("{response}"),
                None => bail!("{command} not acknowledged after {retries} attempt(s)"),
            }
        }
    }
    Ok(())
}
