//! Entry point for `taskmaster-server`.
use std::net::TcpListener;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use taskmaster::cli::ServerArgs;
use taskmaster::error::TaskmasterError;
use taskmaster::logging::{self, LogLevel};
use taskmaster::{control, rpc, task_master};

fn main() -> ExitCode {
    let args = ServerArgs::parse();

    if !args.allow_root && nix::unistd::Uid::effective().is_root() {
        eprintln!("refusing to run as root without --allow-root");
        return ExitCode::FAILURE;
    }

    let level = match LogLevel::from_str(&args.log_level) {
        Ok(level) => level,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match logging::try_init(level, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("could not initialize logging: {err}");
            return ExitCode::FAILURE;
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run(args: ServerArgs) -> Result<(), TaskmasterError> {
    let task_master = Arc::new(task_master::spawn_task_master(args.config_file));

    control::install(task_master.clone())?;

    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    info!(port = args.port, "taskmaster-server ready");

    let rpc_task_master = task_master.clone();
    std::thread::spawn(move || rpc::server::serve(listener, rpc_task_master));

    task_master.join();
    Ok(())
}
