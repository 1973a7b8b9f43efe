//! QDMA administration tool
//!
//! Talks to `qdmad` over its control socket; register commands map the
//! BAR directly through sysfs.

use std::io;
use std::process;

use anyhow::Context;
use qdmactl::client::{Channel, SocketChannel};
use qdmactl::cmd::{self, Command, ParseError};
use qdmactl::{bar, Session};

fn main() {
    let mut args = pico_args::Arguments::from_env();
    let verbosity = (0..).find(|_| !args.contains("-v")).unwrap_or(0);
    common::setup_logging("qdmactl", common::verbosity_level(verbosity));

    let command = if args.contains(["-h", "--help"]) {
        Ok(Command::Help)
    } else if args.contains("--version") {
        Ok(Command::Version)
    } else {
        let words: Vec<String> = args
            .finish()
            .into_iter()
            .map(|s| s.to_string_lossy().into_owned())
            .collect();
        cmd::parse(&words)
    };

    let command = match command {
        Ok(command) => command,
        Err(ParseError::Empty) => {
            eprint!("{}", cmd::USAGE);
            process::exit(1);
        }
        Err(e) => {
            eprintln!("qdmactl: {}", e);
            eprintln!("Try 'qdmactl help' for usage.");
            process::exit(1);
        }
    };

    if let Err(e) = run(&command) {
        eprintln!("qdmactl: {:#}", e);
        process::exit(1);
    }
}

fn run(command: &Command) -> anyhow::Result<()> {
    let run_dir = SocketChannel::run_dir();
    let mut session = Session::new(
        |vf| Ok(Box::new(SocketChannel::connect(&run_dir, vf)?) as Box<dyn Channel>),
        bar::sysfs_root(),
    );
    let stdout = io::stdout();
    let mut out = stdout.lock();
    session.execute(command, &mut out).context("command failed")
}
