use std::fs;
use std::process::ExitCode;
use tether::{Executor, RunOutcome};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit status for usage mistakes and unreadable scripts
pub(crate) fn usage_error() -> ExitCode {
    ExitCode::from(2)
}

/// Parsed command-line arguments
#[derive(Debug, Default, PartialEq)]
pub(crate) struct CliArgs {
    pub(crate) command: Option<String>,
    pub(crate) script: Option<String>,
    pub(crate) debug: bool,
    pub(crate) help: bool,
    pub(crate) version: bool,
}

/// Parse command-line arguments
pub(crate) fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();

    let mut i = 1; // Skip program name
    while i < args.len() {
        match args[i].as_str() {
            "-c" => {
                // Everything after -c is the command
                if i + 1 >= args.len() {
                    return Err("-c needs a command".to_string());
                }
                cli.command = Some(args[i + 1..].join(" "));
                break;
            }
            "--debug" | "-d" => cli.debug = true,
            "--help" | "-h" => cli.help = true,
            "--version" | "-V" => cli.version = true,
            flag if flag.starts_with('-') => {
                return Err(format!("unknown option '{}'", flag));
            }
            path => {
                if cli.script.is_some() {
                    return Err(format!("unexpected argument '{}'", path));
                }
                cli.script = Some(path.to_string());
            }
        }
        i += 1;
    }

    Ok(cli)
}

pub(crate) fn print_help() {
    println!(
        r#"tether {} - a continuation-based command scripting runtime

USAGE:
    tether                  Start interactive REPL
    tether -c <command>     Execute a single command line
    tether <script>         Execute a script file
    tether --debug          Log debug output to stderr
    tether --help           Show this help message
    tether --version        Show version

STARTUP:
    ~/.tetherrc             Executed on REPL startup (if it exists)
    ~/.tether_history       REPL history

ENVIRONMENT:
    TETHER_LOG                    Log filter (default: warn)
    TETHER_TOKEN_TIMEOUT_MS       Completion token timeout (default: 300000)
    TETHER_GENERATOR_TIMEOUT_MS   Generator token timeout (default: 1800000)
    TETHER_MAX_ITERATIONS         Loop iteration cap, 0 = none (default: 100000)
    TETHER_PARSE_CACHE            Cached parsed scripts (default: 256)
    TETHER_WAIT_TIMEOUT_MS        Synchronous wait cap (default: 600000)

SYNTAX:
    cmd a, b, key: v        Command with positional and named arguments
    a; b                    Run a, then b
    a & b                   Run b only if a succeeded (also: then)
    a | b                   Run b only if a failed (also: else)
    !cmd                    Invert the status of cmd
    {{cmd}}                   Substitute the result of cmd
    name: value             Assign a variable, read it with ~name
    a ~> b                  b {{get_result}}
    a => name               name: {{get_result}}

EXIT STATUS:
    0 when the last command succeeded, 1 when it failed, 2 on usage errors"#,
        VERSION
    );
}

pub(crate) fn print_version() {
    println!("tether {}", VERSION);
}

pub(crate) fn exit_code(status: bool) -> ExitCode {
    if status {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run text to completion and map the final status to an exit code
fn run_to_exit(executor: &Executor, text: &str) -> ExitCode {
    match executor.run_script(text) {
        Ok(RunOutcome { status, .. }) => exit_code(status),
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Execute a single command line
pub(crate) fn execute_command(cmd: &str) -> ExitCode {
    let executor = Executor::with_stdlib();
    run_to_exit(&executor, cmd)
}

/// Execute a script file
pub(crate) fn execute_script(path: &str) -> ExitCode {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading {}: {}", path, e);
            return usage_error();
        }
    };

    let executor = Executor::with_stdlib();
    run_to_exit(&executor, &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tether")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parse_command_joins_rest() {
        let cli = parse_args(&args(&["--debug", "-c", "echo", "hi"])).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.command.as_deref(), Some("echo hi"));
    }

    #[test]
    fn parse_script_path() {
        let cli = parse_args(&args(&["run.tr"])).unwrap();
        assert_eq!(cli.script.as_deref(), Some("run.tr"));
    }

    #[test]
    fn parse_rejects_unknown_flag() {
        assert!(parse_args(&args(&["--bogus"])).is_err());
        assert!(parse_args(&args(&["-c"])).is_err());
    }
}
