//! Integration tests for object lifetimes in the store

#[path = "common/mod.rs"]
mod common;
use common::executor;

#[test]
fn test_store_empty_after_script() {
    let (executor, _) = executor();
    let outcome = executor
        .run_script("x: {list a, b}; y: {append ~x, c}; echo {len ~y}")
        .unwrap();
    assert!(outcome.status);
    assert!(executor.store().is_empty());
}

#[test]
fn test_result_rendered_before_release() {
    let (executor, _) = executor();
    let outcome = executor.run_script("list a, b").unwrap();
    assert_eq!(outcome.display.as_deref(), Some("(a, b)"));
    assert!(executor.store().is_empty());
}

#[test]
fn test_macro_scope_releases_its_lists() {
    let (executor, _) = executor();
    executor
        .run_script("macro tmp, (l: {list 1, 2, 3}; len ~l); tmp; tmp")
        .unwrap();
    assert!(executor.store().is_empty());
}

#[test]
fn test_state_keeps_variables_between_runs() {
    let (executor, output) = executor();
    let state = executor.new_state();
    executor.run_in("x: {list a, b}", &state);
    assert_eq!(executor.store().len(), 1);
    executor.run_in("echo {len ~x}", &state);
    assert_eq!(*output.lock().unwrap(), "2\n");
    state.release(executor.store());
    assert!(executor.store().is_empty());
}
