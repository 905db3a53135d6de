//! PAN coordinator role binary, spec.md §1/§6.

mod role;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use structopt::StructOpt;

use zag_proto::prelude::*;

use role::Coordinator;

#[derive(Debug, StructOpt)]
#[structopt(name = "zag-coordinator")]
struct Options {
    /// Serial device the radio is attached to, e.g. /dev/ttyUSB0
    port: String,

    #[structopt(long, default_value = "115200")]
    baud: u32,

    #[structopt(long, default_value = "coordinator.ini", parse(from_os_str))]
    config: PathBuf,

    #[structopt(long, default_value = "info")]
    log_level: simplelog::LevelFilter,
}

/// The longest the event loop will wait with nothing scheduled, spec.md §5.
const IDLE_POLL_MS: u64 = 1_000;

fn main() -> anyhow::Result<()> {
    let opts = Options::from_args();
    let _ = simplelog::SimpleLogger::init(opts.log_level, simplelog::Config::default());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    let config = CoordinatorConfig::load(&opts.config)?;

    info!("opening {} at {} baud", opts.port, opts.baud);
    let port = serialport::new(&opts.port, opts.baud)
        .timeout(Duration::from_millis(100))
        .open()?;
    let transport = Transport::new(Box::new(port))?;
    let radio = Radio::new(&transport);

    let mut coordinator = Coordinator::boot(radio, config)?;
    let timer = SystemTimer::new();

    info!("coordinator running, ctrl-c to stop");
    while running.load(Ordering::SeqCst) {
        let now_ms = timer.ticks_ms();
        let wait_ms = coordinator.next_deadline_ms().map_or(IDLE_POLL_MS, |d| d.saturating_sub(now_ms));
        let timeout = Duration::from_millis(wait_ms.min(IDLE_POLL_MS).max(1));

        match transport.recv_event(timeout) {
            Some(Event::Packet { frame, .. }) => coordinator.on_packet(&frame, timer.ticks_ms())?,
            Some(Event::Button(button)) => coordinator.on_button(button, timer.ticks_ms())?,
            None => {}
        }

        if let Err(e) = coordinator.on_tick(timer.ticks_ms()) {
            error!("fatal transport error: {e}");
            return Err(e.into());
        }
    }

    transport.request_shutdown();
    info!("shutting down");
    Ok(())
}
