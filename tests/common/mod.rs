//! Common test utilities for tether integration tests

#![allow(dead_code, unused_imports)]

pub use tether::{Completion, Config, Executor, RunOutcome};
use std::sync::{Arc, Mutex};

/// Executor with the command library and captured output
pub fn executor() -> (Executor, Arc<Mutex<String>>) {
    let executor = Executor::new(Config::default());
    executor.register_stdlib();
    let output = executor.capture_output();
    (executor, output)
}

/// Run a script and return what it printed
pub fn eval(input: &str) -> Result<String, String> {
    let (executor, output) = executor();
    executor.run_script(input).map_err(|e| e.to_string())?;
    let text = output.lock().unwrap().clone();
    Ok(text)
}

/// Run a script and return its final status
pub fn eval_status(input: &str) -> bool {
    let (executor, _) = executor();
    executor.run_script(input).unwrap().status
}

/// Run a script and return the display text of its final result
pub fn eval_result(input: &str) -> Option<String> {
    let (executor, _) = executor();
    executor.run_script(input).unwrap().display
}
