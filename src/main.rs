//! tether - a continuation-based command scripting runtime
//!
//! Usage:
//!   tether              Start interactive REPL
//!   tether -c "cmd"     Execute a single command line
//!   tether script.tr    Execute a script file

mod cli;
mod rcfile;
mod repl;

use std::env;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Log filter for the binary: `--debug` wins, then `TETHER_LOG`, then warn
fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("TETHER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let cli = match cli::parse_args(&args) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("tether: {}", message);
            eprintln!("Try 'tether --help' for usage.");
            return cli::usage_error();
        }
    };

    if cli.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }

    if cli.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    init_logging(cli.debug);

    if let Some(cmd) = cli.command {
        return cli::execute_command(&cmd);
    }

    if let Some(script) = cli.script {
        return cli::execute_script(&script);
    }

    match repl::run_repl() {
        Ok(status) => cli::exit_code(status),
        Err(e) => {
            eprintln!("REPL error: {}", e);
            ExitCode::FAILURE
        }
    }
}
