use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tether::{ExecutionState, Executor};
use tracing::debug;

/// Get home directory
pub(crate) fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}

/// Load and execute ~/.tetherrc in the REPL's state, if it exists
pub(crate) fn load_tetherrc(executor: &Executor, state: &Arc<ExecutionState>) {
    let rc_path = match dirs_home() {
        Some(home) => home.join(".tetherrc"),
        None => return,
    };

    let content = match fs::read_to_string(&rc_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    load_rc_content(executor, state, &content, "~/.tetherrc");
}

/// Run startup content; a parse error skips the file with a warning, a
/// failing command only reports its status
fn load_rc_content(executor: &Executor, state: &Arc<ExecutionState>, content: &str, source: &str) {
    if let Err(e) = executor.parse_cached(content) {
        eprintln!("Warning: {}: {}", source, e.render());
        return;
    }
    let outcome = executor.run_in(content, state);
    debug!(target: "tether::system", "loaded {} (status {})", source, outcome.status);
    if !outcome.status {
        eprintln!("Warning: {} finished with status false", source);
    }
    state.clear_result(executor.store());
}
