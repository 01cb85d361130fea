use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use das_poller::logging;
use das_poller::{
    BoardProfile, DeviceSession, FailurePolicy, Poller, PollerConfig, PollingScheduler,
    SimulatedBoard,
};

#[derive(Parser, Debug)]
#[command(
    name = "das-poller",
    about = "Poll an Arduino measurement board and log its readings"
)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Serial device (e.g., /dev/ttyUSB0)
    #[arg(short, long)]
    port: Option<String>,
    /// Baud rate of the board firmware
    #[arg(short, long)]
    baud: Option<u32>,
    /// Board firmware: charging-evaluation, four-channel-voltage or temperature
    #[arg(long)]
    profile: Option<BoardProfile>,
    /// Timer period in seconds
    #[arg(long)]
    period: Option<f64>,
    /// Record failed measurements as zero samples instead of skipping them
    #[arg(long)]
    record_failures: bool,
    /// Talk to a simulated board instead of a serial port
    #[arg(long)]
    simulate: bool,
    /// Stop after this many ticks instead of reading commands from stdin
    #[arg(long)]
    ticks: Option<u64>,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn load_config(args: &Args) -> Result<PollerConfig> {
    let mut config = match &args.config {
        Some(path) => PollerConfig::load(path)?,
        None => PollerConfig::default(),
    };
    if let Some(port) = &args.port {
        config.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(profile) = args.profile {
        config.profile = profile;
    }
    if let Some(period) = args.period {
        config.period_sec = period;
    }
    if args.record_failures {
        config.failure_policy = FailurePolicy::RecordZero;
    }
    config.validate()?;
    Ok(config)
}

fn open_session(config: &PollerConfig, simulate: bool) -> Result<DeviceSession> {
    let session = if simulate {
        info!("using simulated {} board", config.profile);
        DeviceSession::from_transport(SimulatedBoard::new(config.profile), config.profile)
    } else {
        DeviceSession::open_serial(&config.port, config.baud_rate, config.profile)
            .context("Could not open serial port")?
    };
    Ok(session
        .with_settle(config.settle())
        .with_response_timeout(config.response_timeout()))
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    logging::init_logging(config.log_level.as_deref());

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;

    let session = open_session(&config, args.simulate)?;
    match session.ping() {
        Ok(text) => info!("board ready: {text}"),
        Err(e) => warn!("board did not answer the readiness check: {e}"),
    }

    let poller = Poller::new(Arc::new(session), config.period(), config.buffer_capacity)
        .with_policy(config.failure_policy);
    let mut scheduler = PollingScheduler::new(poller, runtime.handle().clone());
    scheduler.start();

    match args.ticks {
        Some(limit) => {
            let poll = (config.period() / 4).max(Duration::from_millis(10));
            while scheduler.poller().ticks() < limit {
                thread::sleep(poll);
            }
        }
        None => command_loop(&mut scheduler)?,
    }

    let poller = scheduler.shutdown();
    for channel in poller.channels() {
        let readout = channel.readout();
        info!(
            "{}: last {}, mean {} over {} sample(s)",
            readout.label,
            readout.latest_text(),
            readout.mean_text(),
            channel.buffer().valid_count()
        );
    }
    Ok(())
}

fn command_loop(scheduler: &mut PollingScheduler) -> Result<()> {
    println!("Commands: on | off | toggle | reset | status | quit");
    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        match line.trim() {
            "" => {}
            "on" => scheduler.measurements_on(),
            "off" => scheduler.measurements_off(),
            "toggle" => scheduler.toggle(),
            "reset" => scheduler.reset(),
            "status" => println!(
                "{} ({} ticks)",
                scheduler.run_state().status_text(),
                scheduler.poller().ticks()
            ),
            "quit" | "exit" => break,
            other => println!("Unknown command: {other}"),
        }
    }
    Ok(())
}
