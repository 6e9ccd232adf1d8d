//! Entry point for `taskmaster-ctl`: a one-shot or interactive client.
use std::io::{self, BufRead, Write};

use clap::Parser;

use taskmaster::cli::{ClientArgs, ClientCommand};
use taskmaster::rpc::client::Connection;
use taskmaster::rpc::protocol::{Request, Response, Target};

const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

const COMMANDS: &[&str] = &["start", "stop", "restart", "status", "list", "reload", "shutdown"];

fn main() {
    let args = ClientArgs::parse();

    let mut connection = match Connection::connect(&args.address) {
        Ok(connection) => connection,
        Err(err) => {
            eprintln!("{RED}could not connect to {}: {err}{RESET}", args.address);
            std::process::exit(1);
        }
    };

    match args.command {
        Some(command) => print_response(dispatch(&mut connection, to_request(command))),
        None => interactive(&mut connection),
    }
}

fn to_request(command: ClientCommand) -> Request {
    match command {
        ClientCommand::Start { name, ids } => Request::Start(Target::new(name, ids)),
        ClientCommand::Stop { name, ids } => Request::Stop(Target::new(name, ids)),
        ClientCommand::Restart { name, ids } => Request::Restart(Target::new(name, ids)),
        ClientCommand::Status { name } => Request::Status(Target::new(name.unwrap_or_default(), Vec::new())),
        ClientCommand::List => Request::List,
        ClientCommand::Reload => Request::Reload,
        ClientCommand::Shutdown => Request::Shutdown,
    }
}

fn dispatch(connection: &mut Connection, request: Request) -> Response {
    match connection.call(request) {
        Ok(response) => response,
        Err(err) => Response::Error {
            message: err.to_string(),
        },
    }
}

fn print_response(response: Response) {
    match response {
        Response::Ok { message } => println!("{GREEN}{message}{RESET}"),
        Response::Names { names } => println!("{}", names.join("\n")),
        Response::Error { message } => eprintln!("{RED}{message}{RESET}"),
    }
}

/// Parses one line of interactive input the same way the one-shot subcommands are
/// parsed: first word selects the command, the rest are `name [ids...]`.
fn parse_line(line: &str) -> Option<Request> {
    let mut words = line.split_whitespace();
    let cmd = words.next()?;
    let rest: Vec<&str> = words.collect();

    let target = |rest: &[&str]| -> Target {
        let name = rest.first().copied().unwrap_or_default().to_string();
        let instances = rest[1..]
            .iter()
            .filter_map(|s| s.parse::<u32>().ok())
            .collect();
        Target::new(name, instances)
    };

    match cmd {
        "start" => Some(Request::Start(target(&rest))),
        "stop" => Some(Request::Stop(target(&rest))),
        "restart" => Some(Request::Restart(target(&rest))),
        "status" => Some(Request::Status(target(&rest))),
        "list" => Some(Request::List),
        "reload" => Some(Request::Reload),
        "shutdown" => Some(Request::Shutdown),
        _ => None,
    }
}

fn interactive(connection: &mut Connection) {
    let stdin = io::stdin();
    loop {
        print!("{YELLOW}taskmaster\n  > {RESET}");
        let _ = io::stdout().flush();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            println!("\nexiting taskmaster");
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Some(request) => print_response(dispatch(connection, request)),
            None => {
                println!("unknown command.\navailable commands: {}", COMMANDS.join(", "));
            }
        }
    }
}
