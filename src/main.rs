/* SPDX-License-Identifier: GPL-3.0-or-later */
/*! The `hmdpipe` binary: render server (`serve`) and diagnostic client
 * (`query`) ends of the bridge. */
use clap::{value_parser, Arg, ArgAction, Command};
use hmdpipe::client::NetClient;
use hmdpipe::headless::HeadlessFactory;
use hmdpipe::pipe::{endpoint_path, ENDPOINT_PRIMARY};
use hmdpipe::session::run_server;
use hmdpipe::tag;
use log::{debug, Log, Record};
use nix::sys::signal;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/** Logger configuration data */
struct Logger {
    max_level: log::LevelFilter,
    pid: u32,
    color_output: bool,
}

impl Log for Logger {
    fn enabled(&self, meta: &log::Metadata<'_>) -> bool {
        meta.level() <= self.max_level
    }
    fn log(&self, record: &Record<'_>) {
        if record.level() > self.max_level {
            return;
        }

        /* Microseconds within the last 100 seconds; enough to correlate the
         * two processes without eating the line with a full date */
        let time = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH);
        let t = time.map(|t| (t.as_nanos() % 100000000000u128) / 1000u128).unwrap_or(0);

        let (esc1, esc2) = if self.color_output {
            if record.level() <= log::Level::Error {
                ("\x1b[0;33;1m", "\x1b[0m")
            } else {
                ("\x1b[0;33m", "\x1b[0m")
            }
        } else {
            ("", "")
        };
        let lvl_str: &str = match record.level() {
            log::Level::Error => "ERR",
            log::Level::Warn => "Wrn",
            log::Level::Info => "inf",
            log::Level::Debug => "dbg",
            log::Level::Trace => "trc",
        };

        let line = format!(
            "{}[{:02}.{:06} {} hmdpipe({}) {}:{}]{} {}\n",
            esc1,
            t / 1000000u128,
            t % 1000000u128,
            lvl_str,
            self.pid,
            record
                .file()
                .unwrap_or("src/unknown")
                .strip_prefix("src/")
                .unwrap_or("unknown"),
            record.line().unwrap_or(0),
            esc2,
            record.args(),
        );
        let handle = &mut std::io::stderr().lock();
        let _ = handle.write_all(line.as_bytes());
        let _ = handle.flush();
    }
    fn flush(&self) {
        /* not needed */
    }
}

/** For the shutdown handler; set to true after SIGINT was received */
static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_handler(_signo: i32) {
    SIGINT_RECEIVED.store(true, Ordering::Release);
}

/** Install a SIGINT handler and return a poll mask in which SIGINT is not
 * blocked. SIGINT is blocked everywhere else, so the flag can only trip a
 * poll, never race in between the flag check and the blocking call. */
fn setup_sigint_handler() -> Result<(signal::SigSet, &'static AtomicBool), String> {
    let mut mask = signal::SigSet::empty();
    mask.add(signal::SIGINT);
    let mut pollmask = mask
        .thread_swap_mask(signal::SigmaskHow::SIG_BLOCK)
        .map_err(|x| tag!("Failed to set sigmask: {}", x))?;
    pollmask.remove(signal::SIGINT);

    let sigaction = signal::SigAction::new(
        signal::SigHandler::Handler(sigint_handler),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        // SAFETY: only called once, and sigint_handler is async signal safe
        signal::sigaction(signal::Signal::SIGINT, &sigaction)
            .map_err(|x| tag!("Failed to set sigaction: {}", x))?;
    }

    Ok((pollmask, &SIGINT_RECEIVED))
}

fn main() -> Result<(), String> {
    let command = Command::new(env!("CARGO_PKG_NAME"))
        .about(
            "Bridge forwarding VR render buffers from client applications to the display server\n\
            Example: hmdpipe serve",
        )
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .subcommand_value_name("MODE")
        .subcommand_help_heading("Modes")
        .subcommand(Command::new("serve").about("Run the render-server end of the bridge"))
        .subcommand(
            Command::new("query")
                .about("Connect as a client and print the per-view render info")
                .arg(
                    Arg::new("secondary")
                        .long("secondary")
                        .help("Use the secondary endpoint")
                        .action(ArgAction::SetTrue),
                ),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Print debug messages")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .hide(true)
                .help("Test option: print per-frame messages")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("socket")
                .short('s')
                .long("socket")
                .value_name("path")
                .help("Override the endpoint socket path")
                .value_parser(value_parser!(PathBuf)),
        );
    let matches = command.get_matches();

    let debug_flag = *matches.get_one::<bool>("debug").unwrap();
    let trace = *matches.get_one::<bool>("trace").unwrap();
    let max_level = if trace {
        log::LevelFilter::Trace
    } else if debug_flag {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Error
    };
    let logger = Logger {
        max_level,
        pid: std::process::id(),
        color_output: nix::unistd::isatty(2).unwrap_or(false),
    };
    log::set_max_level(max_level);
    log::set_boxed_logger(Box::new(logger)).unwrap();

    let socket_arg = matches.get_one::<PathBuf>("socket");

    match matches.subcommand() {
        Some(("serve", _)) => {
            let (pollmask, stop) = setup_sigint_handler()?;
            let path = socket_arg
                .cloned()
                .unwrap_or_else(|| endpoint_path(ENDPOINT_PRIMARY));
            debug!("Serving render clients at {:?}", path);
            let factory = HeadlessFactory::default();
            run_server(&path, &factory, Some(&pollmask), stop)?;
            debug!("Exiting");
            Ok(())
        }
        Some(("query", submatch)) => {
            let secondary = *submatch.get_one::<bool>("secondary").unwrap();
            let mut client = NetClient::new();
            match socket_arg {
                Some(path) => client.connect_at(path)?,
                None => client.connect(!secondary)?,
            }
            for i in 0..client.render_info_count() {
                let info = client.render_info(i).unwrap();
                println!(
                    "view {}: viewport {}x{} at ({}, {})",
                    i,
                    info.viewport.width,
                    info.viewport.height,
                    info.viewport.left,
                    info.viewport.lower
                );
                let q = &info.pose.rotation;
                println!(
                    "    pose: translation [{}, {}, {}], rotation [{}, {}, {}, {}]",
                    info.pose.translation[0],
                    info.pose.translation[1],
                    info.pose.translation[2],
                    q.w,
                    q.x,
                    q.y,
                    q.z
                );
                let p = &info.projection;
                println!(
                    "    projection: l {} r {} t {} b {}, clip {}..{}",
                    p.left, p.right, p.top, p.bottom, p.near_clip, p.far_clip
                );
            }
            client.disconnect();
            Ok(())
        }
        _ => unreachable!(),
    }
}
