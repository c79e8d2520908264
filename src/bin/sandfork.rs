// src/bin/sandfork.rs
use std::fs::File;
use std::os::fd::AsFd;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use comms::SpawnRequest;
use forkserver::{GlobalForkClient, StartModeSet};
use logging::SubscriberConfig;

#[derive(Parser)]
#[command(
    name = "sandfork",
    version,
    about = "Spawn processes through the global fork server"
)]
struct Cli {
    /// Start-mode configuration, e.g. "ondemand" or "never". Overrides the
    /// environment for this invocation.
    #[arg(long, value_name = "MODES")]
    start_mode: Option<String>,

    /// More log output (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn a program through the fork server and print its pid.
    Spawn {
        /// Also request and print the intermediate process id.
        #[arg(long)]
        init: bool,
        /// Program path, then its arguments.
        #[arg(required = true, trailing_var_arg = true)]
        argv: Vec<String>,
    },
    /// Print the helper's pid, starting it if permitted.
    Pid,
    /// Validate a start-mode string and print its canonical form.
    CheckConfig {
        #[arg(value_name = "MODES")]
        modes: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => None,
        1 => Some(LevelFilter::INFO),
        _ => Some(LevelFilter::DEBUG),
    };
    logging::init(SubscriberConfig {
        level,
        quiet: false,
    });

    if let Command::CheckConfig { modes } = &cli.command {
        return match modes.parse::<StartModeSet>() {
            Ok(set) => {
                println!("{set}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("sandfork: {err}");
                ExitCode::from(2)
            }
        };
    }

    // An explicit --start-mode gets its own supervisor; otherwise the
    // process-wide one configured from the environment is used.
    let local;
    let sup: &GlobalForkClient = match &cli.start_mode {
        Some(text) => match text.parse::<StartModeSet>() {
            Ok(modes) => {
                local = GlobalForkClient::with_start_modes(modes);
                &local
            }
            Err(err) => {
                eprintln!("sandfork: {err}");
                return ExitCode::from(2);
            }
        },
        None => forkserver::global(),
    };

    match &cli.command {
        Command::Spawn { init, argv } => {
            let exec = match File::open(&argv[0]) {
                Ok(file) => file,
                Err(err) => {
                    eprintln!("sandfork: {}: {err}", argv[0]);
                    return ExitCode::FAILURE;
                }
            };
            let request = SpawnRequest::new(argv.iter());
            let mut init_pid = -1;
            let pid = match sup.send_request(
                &request,
                Some(exec.as_fd()),
                None,
                None,
                init.then_some(&mut init_pid),
            ) {
                Ok(pid) => pid,
                Err(err) => {
                    eprintln!("sandfork: {err}");
                    return ExitCode::FAILURE;
                }
            };
            if pid < 0 {
                eprintln!("sandfork: helper failed to spawn {}", argv[0]);
                return ExitCode::FAILURE;
            }
            if *init {
                println!("{pid} {init_pid}");
            } else {
                println!("{pid}");
            }
            ExitCode::SUCCESS
        }
        Command::Pid => match sup.pid() {
            Ok(pid) => {
                println!("{pid}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("sandfork: {err}");
                ExitCode::FAILURE
            }
        },
        Command::CheckConfig { .. } => unreachable!("handled above"),
    }
}
