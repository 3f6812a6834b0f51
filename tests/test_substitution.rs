//! Integration tests for brace, macro argument and variable substitution

#[path = "common/mod.rs"]
mod common;
use common::{eval, eval_result};

#[test]
fn test_brace_in_quotes() {
    assert_eq!(eval("echo \"n={add 1, 1}\"").unwrap(), "n=2\n");
}

#[test]
fn test_several_braces_in_one_command() {
    assert_eq!(eval("echo {add 1, 1}, {add 2, 2}").unwrap(), "2 4\n");
}

#[test]
fn test_unwrapping_brace_spreads_items() {
    assert_eq!(eval("echo ${list a, b}").unwrap(), "a b\n");
    assert_eq!(eval_result("len {list a, b}").as_deref(), Some("2"));
}

#[test]
fn test_braces_inside_blocks_wait_for_the_block() {
    // The brace runs on each iteration, not once up front
    assert_eq!(eval("for 1, 2, i, (echo {add ~i, 10})").unwrap(), "11\n12\n");
}

#[test]
fn test_all_arguments() {
    assert_eq!(eval("macro show, (echo $*); show a, b, c").unwrap(), "a b c\n");
    assert_eq!(eval("macro show, (echo \"[$*]\"); show a, b").unwrap(), "[a, b]\n");
}

#[test]
fn test_argument_list_marker() {
    assert_eq!(eval_result("macro n, (len $@); n a, b, c").as_deref(), Some("3"));
    assert_eq!(eval_result("macro n, (len $@); n").as_deref(), Some("0"));
}

#[test]
fn test_argument_count_and_positions() {
    assert_eq!(eval("macro m, (echo $#, $2); m x, y").unwrap(), "2 y\n");
    // Missing positions expand to nothing
    assert_eq!(eval("macro m, (echo \"<$3>\"); m x").unwrap(), "<>\n");
}

#[test]
fn test_tilde_interpolation_in_double_quotes() {
    assert_eq!(eval("x: 5; echo \"x is ~x\"").unwrap(), "x is 5\n");
    assert_eq!(eval("x: 5; echo \"~x;px\"").unwrap(), "5px\n");
}

#[test]
fn test_tilde_left_alone_outside_double_quotes() {
    assert_eq!(eval("x: 5; echo '~x'").unwrap(), "~x\n");
    assert_eq!(eval("echo \"~missing\"").unwrap(), "~missing\n");
}

#[test]
fn test_nested_list_display() {
    let script = "inner: {list b, \"c\"}; list a, ~inner";
    assert_eq!(eval_result(script).as_deref(), Some("(a, (b, \"c\"))"));
}
