// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Service program to switch the display refresh rate of AMLogic based
//! set-top boxes to the frame rate of the movie being played.
//!
//! The kernel announces decoder starts and frame rate hints over netlink
//! uevents; the engine debounces them, estimates the movie frame rate from
//! several decoder statistics, picks the closest supported display mode and
//! switches the HDMI output, restoring the original mode when playback
//! ends.

mod apisock;
mod colorspace;
mod config;
mod display;
mod hdcp;
mod netlink;
mod service;
mod shmem;
mod sysfs;

use {
    clap::Parser,
    nix::{
        sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
        unistd::{fork, ForkResult, Pid},
    },
    service::{Outcome, Service},
    std::{
        ffi::CString,
        fs,
        io::Write,
        path::{Path, PathBuf},
        sync::atomic::{AtomicBool, AtomicPtr, Ordering},
        thread,
        time::Duration,
    },
    tracing::{error, info, Level},
};

const DEFAULT_CONFIG: &str = "/etc/afr.ini";
const DEFAULT_PIDFILE: &str = "/var/run/afr.pid";

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

static EMERG_PIDFILE: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());
static EMERG_IPC: AtomicPtr<libc::c_char> = AtomicPtr::new(std::ptr::null_mut());

#[derive(Parser)]
#[clap(name = "amlogic-afr-service", version, about)]
struct Arguments {
    /// Detach from the terminal and run as a daemon.
    #[clap(short = 'D', long)]
    daemonize: bool,

    /// Write the PID to FILE when running as a daemon.
    #[clap(short = 'p', long, value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// Kill the running daemon (can be combined with -D).
    #[clap(short = 'k', long)]
    kill: bool,

    /// Write the log to FILE.
    #[clap(short = 'l', long, value_name = "FILE")]
    logfile: Option<PathBuf>,

    /// Display the status of the running daemon.
    #[clap(short = 's', long)]
    status: bool,

    /// Verbose info about what's cooking; repeat for more.
    #[clap(short = 'v', long, parse(from_occurrences))]
    verbose: u64,

    /// Configuration file candidates; the first loadable one is used.
    #[clap(value_name = "CONFIG")]
    configs: Vec<PathBuf>,
}

extern "C" fn handle_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

// Remove the run files before dying from a fatal signal; only
// async-signal-safe calls are allowed here.
extern "C" fn handle_emergency(signum: libc::c_int) {
    unsafe {
        let pidfile = EMERG_PIDFILE.load(Ordering::Relaxed);
        if !pidfile.is_null() {
            libc::unlink(pidfile);
        }
        let ipc = EMERG_IPC.load(Ordering::Relaxed);
        if !ipc.is_null() {
            libc::truncate(ipc, 0);
        }

        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

fn install_signal_handlers() {
    let term = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    let emergency = SigAction::new(
        SigHandler::Handler(handle_emergency),
        SaFlags::empty(),
        SigSet::empty(),
    );

    unsafe {
        let _ = sigaction(Signal::SIGHUP, &ignore);
        let _ = sigaction(Signal::SIGINT, &term);
        let _ = sigaction(Signal::SIGQUIT, &term);
        let _ = sigaction(Signal::SIGTERM, &term);
        let _ = sigaction(Signal::SIGFPE, &emergency);
        let _ = sigaction(Signal::SIGILL, &emergency);
        let _ = sigaction(Signal::SIGSEGV, &emergency);
    }
}

fn set_emergency_paths(pidfile: &Path, ipc_dir: &Path) {
    if let Ok(path) = CString::new(pidfile.display().to_string()) {
        EMERG_PIDFILE.store(path.into_raw(), Ordering::Relaxed);
    }
    let ipc = ipc_dir.join(shmem::IPC_FILE_NAME);
    if let Ok(path) = CString::new(ipc.display().to_string()) {
        EMERG_IPC.store(path.into_raw(), Ordering::Relaxed);
    }
}

fn init_logging(verbose: u64, logfile: Option<&Path>) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    match logfile {
        Some(path) => {
            // a log file records at least the debug detail
            let level = level.max(Level::DEBUG);
            match fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => {
                    tracing_subscriber::fmt()
                        .with_max_level(level)
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file))
                        .init();
                }
                Err(err) => {
                    eprintln!("failed to open log file {}: {}", path.display(), err);
                    tracing_subscriber::fmt().with_max_level(level).init();
                }
            }
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
}

// The PID recorded in the pidfile, when that process is still alive.
fn daemon_pid(pidfile: &Path) -> Option<Pid> {
    let text = fs::read_to_string(pidfile).ok()?;
    let pid = text.trim().parse::<i32>().ok()?;
    if pid < 1 {
        return None;
    }

    let pid = Pid::from_raw(pid);
    kill(pid, None).ok()?;
    Some(pid)
}

fn kill_daemon(pidfile: &Path) -> i32 {
    let pid = match daemon_pid(pidfile) {
        Some(pid) => pid,
        None => {
            eprintln!(
                "no running daemon behind pid file '{}'",
                pidfile.display()
            );
            let _ = fs::remove_file(pidfile);
            return libc::EXIT_FAILURE;
        }
    };

    if kill(pid, Signal::SIGINT).is_err() {
        eprintln!("failed to kill daemon PID {}", pid);
        return libc::EXIT_FAILURE;
    }

    for _ in 0..80 {
        thread::sleep(Duration::from_millis(25));
        if kill(pid, None).is_err() {
            break;
        }
    }

    let _ = fs::remove_file(pidfile);
    libc::EXIT_SUCCESS
}

fn daemonize(pidfile: &Path) {
    if let Some(pid) = daemon_pid(pidfile) {
        eprintln!("daemon is already running with PID {}", pid);
        std::process::exit(libc::EXIT_FAILURE);
    }

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            if let Some(dir) = pidfile.parent() {
                let _ = fs::create_dir_all(dir);
            }
            let written = fs::File::create(pidfile)
                .and_then(|mut file| write!(file, "{}", child.as_raw()));
            if written.is_err() {
                eprintln!("failed to write pid file '{}'", pidfile.display());
            }
            std::process::exit(libc::EXIT_SUCCESS);
        }
        Ok(ForkResult::Child) => unsafe {
            // detach from the console and run a bit above normal priority,
            // mode switching is latency sensitive
            let null = libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDWR);
            if null >= 0 {
                libc::dup2(null, 0);
                libc::dup2(null, 1);
                libc::dup2(null, 2);
                if null > 2 {
                    libc::close(null);
                }
            }
            libc::setpriority(libc::PRIO_PROCESS as _, 0, -16);
        },
        Err(_) => {
            eprintln!("can't daemonize, aborting");
            std::process::exit(libc::EXIT_FAILURE);
        }
    }
}

fn print_status(ipc_dir: &Path) -> i32 {
    match shmem::read(ipc_dir) {
        Ok(record) => {
            let (major, minor, micro) = record.version;
            println!(
                "service version: {}.{}.{} built {}",
                major, minor, micro, record.build_date
            );
            println!(
                "service is enabled: {}",
                if record.status.enabled { "yes" } else { "no" }
            );
            println!(
                "display refresh rate is switched: {}",
                if record.status.switched { "yes" } else { "no" }
            );
            println!(
                "display is blackened: {}",
                if record.status.blackened { "yes" } else { "no" }
            );
            println!(
                "current display refresh rate: {}Hz",
                amlogic_afr_protocols::Hz(record.status.current_hz)
            );
            println!(
                "original display refresh rate: {}Hz",
                amlogic_afr_protocols::Hz(record.status.original_hz)
            );
            libc::EXIT_SUCCESS
        }
        Err(err) => {
            eprintln!("failed to read service status: {}", err);
            libc::EXIT_FAILURE
        }
    }
}

fn pick_config(candidates: &[PathBuf]) -> PathBuf {
    for candidate in candidates {
        match config::Config::load(candidate) {
            Ok(_) => return candidate.clone(),
            Err(err) => eprintln!("{}", err),
        }
    }

    PathBuf::from(DEFAULT_CONFIG)
}

fn main() {
    let args = Arguments::parse();

    let pidfile = args
        .pidfile
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE));
    let ipc_dir = pidfile
        .parent()
        .map(|dir| dir.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    if args.status {
        std::process::exit(print_status(&ipc_dir));
    }

    if args.kill {
        let code = kill_daemon(&pidfile);
        if !args.daemonize {
            std::process::exit(code);
        }
    }

    if args.daemonize {
        daemonize(&pidfile);
    }

    let config_path = pick_config(&args.configs);

    // the log destination may also come from the configuration; the global
    // subscriber can only be installed once, so this is decided at startup
    let config_logfile = config::Config::load(&config_path)
        .ok()
        .filter(|cfg| cfg.log_enable)
        .and_then(|cfg| cfg.log_file.map(PathBuf::from));
    let logfile = args.logfile.clone().or(config_logfile);
    init_logging(args.verbose, logfile.as_deref());

    install_signal_handlers();
    set_emergency_paths(&pidfile, &ipc_dir);

    let code = loop {
        let mut service = match Service::new(&config_path, &ipc_dir) {
            Ok(service) => service,
            Err(err) => {
                error!("{}", err);
                eprintln!("{}", err);
                break libc::EXIT_FAILURE;
            }
        };

        match service.run(&SHUTDOWN) {
            Ok(Outcome::Reconfigure) => continue,
            Ok(Outcome::Shutdown) => break libc::EXIT_SUCCESS,
            Err(err) => {
                error!("{}", err);
                break libc::EXIT_FAILURE;
            }
        }
    };

    if args.daemonize {
        let _ = fs::remove_file(&pidfile);
    }

    info!("bye");
    std::process::exit(code)
}
