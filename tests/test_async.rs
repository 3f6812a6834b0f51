//! Integration tests for tokens and asynchronous commands

#[path = "common/mod.rs"]
mod common;
use common::{eval, eval_result, eval_status, executor, Completion};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tether::{CommandResult, Context, TokenRequest};

/// Register `later`: completes from another thread after `ms` milliseconds
/// with the status given as its second argument
fn register_later(executor: &tether::Executor) {
    executor.register_command(
        "later",
        Arc::new(|ctx: &mut Context<'_>| {
            let ms = ctx.int_arg(0).unwrap_or(0) as u64;
            let status = ctx.arg(1).map_or(true, |v| v.is_truthy());
            let id = ctx.request_token(TokenRequest::new());
            let executor = ctx.executor.clone();
            let resume = id.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(ms));
                executor.resume_token(&resume, status);
            });
            CommandResult::Token(id)
        }),
    );
}

#[test]
fn test_msleep_then_continue() {
    assert_eq!(eval("echo a; msleep 5; echo b").unwrap(), "a\nb\n");
}

#[test]
fn test_async_inside_brace() {
    assert_eq!(eval("echo \"got {msleep 5; add 1, 1}\"").unwrap(), "got 2\n");
}

#[test]
fn test_async_in_loop_body() {
    assert_eq!(eval("for 1, 3, i, (msleep 1; echo ~i)").unwrap(), "1\n2\n3\n");
}

#[test]
fn test_async_in_macro() {
    let script = "macro slow, (msleep 5; ret {add $1, 1}); slow 4 => r; echo ~r";
    assert_eq!(eval(script).unwrap(), "5\n");
}

#[test]
fn test_inversion_across_async() {
    assert!(!eval_status("!msleep 5"));
    assert_eq!(eval("!msleep 5 & echo no | echo yes").unwrap(), "yes\n");
}

#[test]
fn test_result_survives_async_tail() {
    assert_eq!(eval_result("msleep 1; list a, b").as_deref(), Some("(a, b)"));
}

#[test]
fn test_host_command_resumed_from_thread() {
    let (executor, output) = executor();
    register_later(&executor);
    let outcome = executor.run_script("later 10; echo ok; later 5, false | echo failed").unwrap();
    assert!(outcome.status);
    assert_eq!(*output.lock().unwrap(), "ok\nfailed\n");
}

#[test]
fn test_pending_completion_and_cancel() {
    let (executor, output) = executor();
    register_later(&executor);
    let Completion::Pending(id) = executor.execute("later 10000; echo never") else {
        panic!("expected pending");
    };
    assert!(executor.active_tokens().contains(&id));
    assert!(executor.cancel_token(&id));
    assert!(!executor.token_valid(&id));
    thread::sleep(Duration::from_millis(20));
    assert_eq!(*output.lock().unwrap(), "");
}

#[test]
fn test_resume_settled_token_is_ignored() {
    let (executor, _) = executor();
    let id = executor.request_token(TokenRequest::new());
    assert!(executor.resume_token(&id, true));
    assert!(!executor.resume_token(&id, true));
}

#[test]
fn test_wait_reports_status() {
    let (executor, _) = executor();
    let id = executor.request_token(TokenRequest::new());
    let remote = executor.clone();
    let resume = id.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        remote.resume_token(&resume, false);
    });
    assert_eq!(executor.wait_token(&id, Duration::from_secs(5)).unwrap(), false);
}

#[test]
fn test_wait_timeout_is_an_error() {
    let (executor, _) = executor();
    let id = executor.request_token(TokenRequest::new());
    assert!(executor.wait_token(&id, Duration::from_millis(10)).is_err());
}
