use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context as LineContext, Editor, Helper, Result as RlResult};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tether::lexer::is_incomplete;
use tether::{ExecutionState, Executor};
use tracing::debug;

use crate::rcfile::{dirs_home, load_tetherrc};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================
// Line editor helper: completion of command and macro names
// ============================================

struct TetherHelper {
    state: Arc<ExecutionState>,
}

impl Helper for TetherHelper {}

impl Completer for TetherHelper {
    type Candidate = Pair;

    fn complete(&self, line: &str, pos: usize, _ctx: &LineContext<'_>) -> RlResult<(usize, Vec<Pair>)> {
        let before = &line[..pos];
        let start = before
            .rfind(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '{' | '('))
            .map_or(0, |i| i + 1);
        let word = &before[start..];
        if word.is_empty() {
            return Ok((start, Vec::new()));
        }
        Ok((start, self.candidates(word)))
    }
}

impl TetherHelper {
    /// Names visible in the REPL scope that start with `prefix`
    fn candidates(&self, prefix: &str) -> Vec<Pair> {
        let env = self.state.env();
        let names: BTreeSet<String> = env
            .command_names()
            .into_iter()
            .chain(env.macro_names())
            .chain(Executor::module_command_names().iter().map(|s| s.to_string()))
            .filter(|name| name.starts_with(prefix))
            .collect();
        debug!(target: "tether::system", "{} completion(s) for '{}'", names.len(), prefix);
        names
            .into_iter()
            .map(|name| Pair {
                display: name.clone(),
                replacement: name,
            })
            .collect()
    }
}

impl Hinter for TetherHelper {
    type Hint = String;
}

impl Highlighter for TetherHelper {}

impl Validator for TetherHelper {}

// ============================================
// Ctrl-C while a line runs: cancel the tokens it created
// ============================================

/// Tokens alive before the running line started; `None` while idle
type Running = Arc<Mutex<Option<BTreeSet<String>>>>;

fn install_interrupt(executor: &Executor, running: &Running) {
    let executor = executor.clone();
    let running = Arc::clone(running);
    let installed = ctrlc::set_handler(move || {
        let guard = running.lock().unwrap_or_else(|e| e.into_inner());
        let Some(before) = guard.as_ref() else {
            return;
        };
        for id in executor.active_tokens() {
            if !before.contains(&id) {
                executor.cancel_token(&id);
            }
        }
        eprintln!("^C");
    });
    if let Err(e) = installed {
        eprintln!("Warning: Ctrl-C handler not installed: {}", e);
    }
}

fn run_line(executor: &Executor, state: &Arc<ExecutionState>, running: &Running, line: &str) -> bool {
    if let Err(e) = executor.parse_cached(line) {
        eprintln!("{}", e.render());
        return false;
    }
    *running.lock().unwrap_or_else(|e| e.into_inner()) = Some(executor.active_tokens().into_iter().collect());
    let outcome = executor.run_in(line, state);
    *running.lock().unwrap_or_else(|e| e.into_inner()) = None;

    if let Some(display) = &outcome.display {
        println!("{}", display);
    }
    if !outcome.status {
        eprintln!("(false)");
    }
    state.clear_result(executor.store());
    outcome.status
}

// ============================================
// REPL main loop
// ============================================

/// Run the REPL; returns the status of the last line run
pub(crate) fn run_repl() -> RlResult<bool> {
    let executor = Executor::with_stdlib();
    let state = executor.new_state();

    let mut rl: Editor<TetherHelper, rustyline::history::DefaultHistory> = Editor::new()?;
    rl.set_helper(Some(TetherHelper {
        state: Arc::clone(&state),
    }));

    let running: Running = Arc::new(Mutex::new(None));
    install_interrupt(&executor, &running);

    load_tetherrc(&executor, &state);

    let history_path = dirs_home().map(|h| h.join(".tether_history"));
    if let Some(ref path) = history_path {
        let _ = rl.load_history(path);
    }

    if std::env::var_os("TETHER_BANNER").is_some() {
        println!("tether {} - Ctrl-D to exit", VERSION);
    }

    let mut buffer = String::new();
    let mut last_status = true;
    loop {
        let prompt = if buffer.is_empty() { "tether> " } else { "   ...> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(&line);

                // Unclosed quote, paren or brace: keep reading
                if is_incomplete(&buffer) {
                    continue;
                }

                let input = std::mem::take(&mut buffer);
                if input.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(input.as_str());
                last_status = run_line(&executor, &state, &running, &input);
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl-C at the prompt drops the pending input
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl-D - exit
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    if let Some(ref path) = history_path {
        let _ = rl.save_history(path);
    }

    Ok(last_status)
}
