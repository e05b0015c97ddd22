// Remapd CLI
// Daemon entry point: run, list-devices, read-events, check-config

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use remapd_core::{Config, Multiplexer};

/// Re-bind keys and buttons on evdev input devices
#[derive(Parser, Debug)]
#[command(name = "remapd")]
#[command(version)]
#[command(about = "Re-bind keys and buttons on evdev input devices", long_about = None)]
struct Args {
    /// Config file that overrides the default location
    #[arg(short = 'f', long, value_name = "CONFIG")]
    config_file: Option<PathBuf>,

    /// List input devices by path, physical address and name
    #[arg(short, long)]
    list_devices: bool,

    /// Read events from one device, by name, physical address, path or
    /// event number
    #[arg(short = 'e', long, value_name = "DEVICE")]
    read_events: Option<String>,

    /// Validate the config and exit
    #[arg(long)]
    check_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

/// Install a signal handler thread that clears the running flag. The
/// poll loop observes it between readiness waits.
fn install_signal_handler(running: Arc<AtomicBool>) {
    std::thread::spawn(move || {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        if let Ok(mut signals) = Signals::new([SIGINT, SIGTERM]) {
            if signals.forever().next().is_some() {
                log::info!("received signal, shutting down");
                running.store(false, Ordering::SeqCst);
            }
        }
    });
}

fn list_devices() {
    println!("input_fn:         \t\"input_phys\" | \"input_name\"");
    for device in remapd_core::discovery::list_devices() {
        println!(
            "{}:\t\"{}\" | \"{}\"",
            device.path,
            device.phys.as_deref().unwrap_or(""),
            device.name,
        );
    }
}

/// Print key presses from one device until interrupted. Aids config
/// authoring; the device is not grabbed.
fn read_events(query: &str, running: &Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    use evdev::{EventType, Key};
    use std::os::unix::io::AsRawFd;

    let Some((path, mut device)) = remapd_core::discovery::resolve(query) else {
        return Err(format!(
            "Device '{query}' not found. Use --list-devices to view available devices."
        )
        .into());
    };

    println!(
        "Reading from {} ({}). To stop, press Ctrl-C",
        path.display(),
        device.name().unwrap_or("Unknown"),
    );

    let mut fds = [libc::pollfd {
        fd: device.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    }];
    while running.load(Ordering::SeqCst) {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, 500) };
        if rc <= 0 {
            continue;
        }
        let events: Vec<evdev::InputEvent> = match device.fetch_events() {
            Ok(iter) => iter.collect(),
            Err(_) => break,
        };
        for event in events {
            if event.event_type() == EventType::KEY && event.value() == 1 {
                println!(
                    "Key pressed: {:?} ({})",
                    Key::new(event.code()),
                    event.code()
                );
            }
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    match &args.config_file {
        Some(path) => Ok(Config::from_toml_path(path)?),
        None => Ok(Config::load_default()?),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.list_devices {
        list_devices();
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    install_signal_handler(running.clone());

    if let Some(query) = &args.read_events {
        return read_events(query, &running);
    }

    // Configuration errors are the only fatal startup errors; everything
    // device-side is recoverable and retried on rediscovery.
    let config = load_config(&args)?;
    let table = config.build_table()?;

    if args.check_config {
        println!("Configuration is valid: {} device group(s)", table.len());
        return Ok(());
    }

    log::info!("remapd starting with {} device group(s)", table.len());
    let mut multiplexer = Multiplexer::new(Arc::new(table), running)?;
    multiplexer.run()?;

    log::info!("remapd stopped");
    // Give the signal thread a moment to flush its log line.
    std::thread::sleep(Duration::from_millis(10));
    Ok(())
}
