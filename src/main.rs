use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{ArgAction, Parser};
use log::{error, info, warn};

// 引入模块
mod bridge;
mod config;
mod connection;
mod error;
mod filter;
mod five_tuple;
mod io;
mod logger;
mod monitor;
mod packet;
mod seq;
mod throttler;
mod timer;

use crate::{
    bridge::Bridge,
    config::Config,
    error::BridgeError,
    io::{Direction, Interfaces},
    monitor::Monitor,
};

const BATCH_LIMIT: usize = 10000;
const SNAPLEN: usize = 65536;
// 没有定时器时最多睡这么久，好及时处理信号和报表
const MAX_POLL_WAIT: Duration = Duration::from_secs(1);

static RELOAD: AtomicBool = AtomicBool::new(false);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(sig: libc::c_int) {
    if sig == libc::SIGHUP {
        RELOAD.store(true, Ordering::Relaxed);
    } else {
        SHUTDOWN.store(true, Ordering::Relaxed);
    }
}

/// Transparent TCP impairment bridge between two interfaces.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Interface facing the clients.
    #[arg(long, value_name = "IFACE")]
    downlink_iface: String,

    /// Interface facing the servers.
    #[arg(long, value_name = "IFACE")]
    uplink_iface: String,

    /// JSON profile file; reloaded on SIGHUP.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write every tracked packet to this pcap file.
    #[arg(long, value_name = "FILE")]
    dump: Option<PathBuf>,

    /// Print a statistics panel periodically.
    #[arg(long)]
    stats: bool,

    /// Seconds between statistics panels.
    #[arg(long, value_name = "SECS", default_value_t = 1.0)]
    stats_interval: f64,

    /// More logging (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long)]
    quiet: bool,
}

fn install_signal_handlers() -> Result<(), BridgeError> {
    for signal in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        let prev = unsafe { libc::signal(signal, on_signal as *const () as libc::sighandler_t) };
        if prev == libc::SIG_ERR {
            return Err(BridgeError::Signal {
                signal,
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), BridgeError> {
    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded {} profile(s) from {}", config.profiles().len(), path.display());
            config
        }
        None => {
            warn!("No configuration given; every connection passes through untouched");
            Config::default()
        }
    };

    let interval = cli
        .stats
        .then(|| Duration::from_secs_f64(cli.stats_interval.max(0.1)));
    let mut bridge = Bridge::new(config, Monitor::new(interval));
    let mut ifaces = Interfaces::open(&cli.downlink_iface, &cli.uplink_iface, cli.dump.as_deref())?;
    install_signal_handlers()?;

    let mut buf = vec![0u8; SNAPLEN];

    while !SHUTDOWN.load(Ordering::Relaxed) {
        if RELOAD.swap(false, Ordering::Relaxed) {
            match &cli.config {
                Some(path) => {
                    if let Err(e) = bridge.reload(path) {
                        warn!("Reload failed, keeping previous profiles: {}", e);
                    }
                }
                None => warn!("SIGHUP ignored: no configuration file"),
            }
        }

        let timeout = bridge
            .time_until_next()
            .map_or(MAX_POLL_WAIT, |t| t.min(MAX_POLL_WAIT));
        let mut ready = ifaces.poll(Some(timeout))?;
        bridge.update_clock();

        // 批量收包：两条腿轮流收，直到都收空或者到上限
        let mut packet_count = 0;
        loop {
            if packet_count >= BATCH_LIMIT {
                break;
            }
            let mut no_packet = true;
            for d in [Direction::Downlink, Direction::Uplink] {
                if !ready[d.index()] {
                    continue;
                }
                match ifaces.receive(d, &mut buf) {
                    Ok(Some(n)) => {
                        packet_count += 1;
                        no_packet = false;
                        bridge.handle_frame(d, &buf[..n], &mut ifaces);
                    }
                    Ok(None) => ready[d.index()] = false,
                    Err(e) => {
                        warn!("{}", e);
                        ready[d.index()] = false;
                    }
                }
            }
            if no_packet {
                break;
            }
        }

        bridge.update_clock();
        bridge.run_timers(&mut ifaces);
        bridge.report();
    }

    bridge.shutdown();
    ifaces.flush();
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.verbose, cli.quiet);

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}
