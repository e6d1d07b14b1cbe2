//! gandalf: usbmuxd TCP relay daemon
//!
//! This is the command-line entry point. It parses arguments, handles the
//! control verbs that act on an already-running daemon, and otherwise
//! boots the supervisor.
//!
//! # Usage
//!
//! ```bash
//! # Relay 127.0.0.1:2222 to port 22 on the device in the mapping file
//! gandalf -m /etc/gandalf/mappings
//!
//! # Run detached with the status endpoint enabled
//! sudo gandalf -m /etc/gandalf/mappings -d --status-server
//!
//! # Ask a running daemon for its tunnels / reload it / stop it
//! gandalf --status
//! gandalf --reload
//! gandalf --shutdown
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use gandalf::control::{self, exit_code, ControlVerb};
use gandalf::error::GandalfError;
use gandalf::supervisor::{self, report_unhandled};
use gandalf::Settings;

/// Command-line arguments
struct Args {
    /// Mapping file path
    mappings: Option<PathBuf>,
    /// Detach from the terminal and write the pidfile
    daemonize: bool,
    /// Tunnel idle timeout in seconds
    timeout_secs: Option<u64>,
    /// usbmuxd socket path override
    socket: Option<PathBuf>,
    /// Serve the status endpoint
    status_server: bool,
    /// Status endpoint port
    status_port: Option<u16>,
    /// Retry budget for supervised tasks
    retries: Option<u32>,
    /// Wait between retries in seconds
    wait_secs: Option<f64>,
    /// Pidfile path override
    pidfile: Option<PathBuf>,
    /// Control verb for a running daemon
    verb: Option<ControlVerb>,
    /// Query the status endpoint of a running daemon
    query_status: bool,
    /// Verbose logging
    verbose: bool,
}

impl Args {
    fn parse() -> Self {
        let mut parsed = Self {
            mappings: None,
            daemonize: false,
            timeout_secs: None,
            socket: None,
            status_server: false,
            status_port: None,
            retries: None,
            wait_secs: None,
            pidfile: None,
            verb: None,
            query_status: false,
            verbose: false,
        };

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-m" | "--mappings" => parsed.mappings = args.next().map(PathBuf::from),
                "-d" | "--daemonize" => parsed.daemonize = true,
                "-t" | "--timeout" => {
                    parsed.timeout_secs = args.next().and_then(|v| v.parse().ok());
                }
                "--socket" => parsed.socket = args.next().map(PathBuf::from),
                "--status-server" => parsed.status_server = true,
                "--status-port" => {
                    parsed.status_port = args.next().and_then(|v| v.parse().ok());
                }
                "--retries" => parsed.retries = args.next().and_then(|v| v.parse().ok()),
                "--wait" => parsed.wait_secs = args.next().and_then(|v| v.parse().ok()),
                "--pidfile" => parsed.pidfile = args.next().map(PathBuf::from),
                "--reload" => parsed.verb = Some(ControlVerb::Reload),
                "--shutdown" => parsed.verb = Some(ControlVerb::Shutdown),
                "--status" => parsed.query_status = true,
                "--verbose" => parsed.verbose = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("gandalf v{}", gandalf::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings {
            mapping_path: self.mappings.clone().unwrap_or_default(),
            daemonize: self.daemonize,
            status_enabled: self.status_server,
            ..Settings::default()
        };
        if let Some(secs) = self.timeout_secs {
            settings.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(socket) = &self.socket {
            settings.usbmuxd_socket = socket.clone();
        }
        if let Some(port) = self.status_port {
            settings.status_port = port;
        }
        if let Some(retries) = self.retries {
            settings.max_retries = retries;
        }
        if let Some(wait) = self.wait_secs {
            settings.retry_wait = Duration::from_secs_f64(wait);
        }
        if let Some(pidfile) = &self.pidfile {
            settings.pidfile_path = pidfile.clone();
        }
        settings
    }
}

fn print_help() {
    println!(
        r"gandalf v{}

Relay TCP connections from loopback ports to USB-attached iOS devices
via usbmuxd.

USAGE:
    gandalf -m <PATH> [OPTIONS]
    gandalf --status | --reload | --shutdown

OPTIONS:
    -m, --mappings <PATH>    Mapping file: UDID:LOCAL_PORT[:DEVICE_PORT] per line
    -d, --daemonize          Detach from the terminal and write the pidfile
    -t, --timeout <SECS>     Tunnel idle timeout [default: 1800]
    --socket <PATH>          usbmuxd socket path [default: /var/run/usbmuxd]
    --status-server          Serve the status endpoint on loopback
    --status-port <PORT>     Status endpoint port [default: 5000]
    --retries <N>            Retry budget for supervised tasks, 1..20 [default: 3]
    --wait <SECS>            Wait between retries, (0.0, 10.0) [default: 2.0]
    --pidfile <PATH>         Pidfile path [default: /var/run/gandalf.pid]
    --verbose                Debug logging
    -h, --help               Print help information
    -v, --version            Print version information

CONTROL (acts on a running daemon via its pidfile):
    --status                 Print the current tunnels as one JSON line
    --reload                 Re-read the mapping and restart tunnels (SIGUSR1)
    --shutdown               Graceful shutdown (SIGUSR2)

SIGNALS:
    SIGUSR1 reload, SIGUSR2 / SIGTERM graceful shutdown

EXAMPLE:
    echo '00008120-000A1D0E3A88401E:2222' > mappings
    gandalf -m mappings &
    ssh -p 2222 mobile@127.0.0.1
",
        gandalf::VERSION
    );
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence; `--verbose` raises the default to debug.
fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Handle `--status`, `--reload`, `--shutdown`
fn run_control_verb(args: &Args) -> i32 {
    let pidfile = args
        .pidfile
        .clone()
        .unwrap_or_else(|| gandalf::config::DEFAULT_PIDFILE_PATH.into());

    if args.query_status {
        if let Err(e) = control::check_daemon(&pidfile) {
            return report_unhandled(&GandalfError::Control(e));
        }
        let port = args.status_port.unwrap_or(gandalf::config::DEFAULT_STATUS_PORT);
        return match control::query_status(port) {
            Ok(line) => {
                print!("{line}");
                exit_code::OK
            }
            Err(e) => report_unhandled(&GandalfError::Io(e)),
        };
    }

    match args.verb {
        Some(verb) => match control::signal_daemon(&pidfile, verb) {
            Ok(pid) => {
                info!("Delivered {:?} to pid {}", verb, pid);
                exit_code::OK
            }
            Err(e) => report_unhandled(&GandalfError::Control(e)),
        },
        None => exit_code::OK,
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.query_status || args.verb.is_some() {
        std::process::exit(run_control_verb(&args));
    }

    if args.mappings.is_none() {
        eprintln!("A mapping file is required; see --help");
        std::process::exit(1);
    }

    let settings = args.settings();

    // Detach before the runtime exists; forking a multi-threaded process
    // does not survive.
    if settings.daemonize {
        if let Err(e) = control::daemonize() {
            std::process::exit(report_unhandled(&GandalfError::Control(e)));
        }
    }

    let code = match run_daemon(settings) {
        Ok(()) => exit_code::OK,
        Err(e) => match e.downcast::<GandalfError>() {
            Ok(err) => report_unhandled(&err),
            Err(other) => {
                eprintln!("gandalf: please report, unhandled async exception: {other}");
                exit_code::UNHANDLED
            }
        },
    };
    std::process::exit(code);
}

fn run_daemon(settings: Settings) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(supervisor::run(settings))?;
    Ok(())
}
