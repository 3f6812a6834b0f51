//! Integration tests for sequences, loops, generators and bubbles

#[path = "common/mod.rs"]
mod common;
use common::{eval, eval_result, eval_status};

#[test]
fn test_newline_separates_commands() {
    assert_eq!(eval("echo one\necho two").unwrap(), "one\ntwo\n");
}

#[test]
fn test_status_of_last_command() {
    assert!(eval_status("false; true"));
    assert!(!eval_status("true; false"));
    assert!(eval_status("false | true"));
}

#[test]
fn test_comparisons() {
    assert!(eval_status("eq 10, 10.0"));
    assert!(!eval_status("eq 2, 3"));
    assert!(eval_status("lt 2, 10"));
    assert!(eval_status("gt b, a"));
    assert_eq!(eval_result("not 0").as_deref(), Some("true"));
}

#[test]
fn test_nested_loops_with_variables() {
    let script = "total: 0\n\
                  for 1, 3, i, (for 1, 2, j, (total: {add ~total, 1}))\n\
                  echo ~total";
    assert_eq!(eval(script).unwrap(), "6\n");
}

#[test]
fn test_while_stops_on_false_condition() {
    assert_eq!(eval("while (false), (echo never); echo done").unwrap(), "done\n");
}

#[test]
fn test_continue_outer_loop() {
    let script = "for 1, 2, i, (for 1, 3, j, (eq ~j, 2 & continue 2; echo ~i, ~j))";
    assert_eq!(eval(script).unwrap(), "1 1\n2 1\n");
}

#[test]
fn test_early_return_from_loop_in_macro() {
    let script = "macro first_big, (for $@, x, (gt ~x, 5 & ret ~x); ret none)\n\
                  first_big 1, 7, 9";
    assert_eq!(eval_result(script).as_deref(), Some("7"));
}

#[test]
fn test_generator_with_arguments() {
    let script = "macro upto, (for 1, $1, i, (yield ~i))\n\
                  g: {generator upto, 2}\n\
                  echo {resume ~g}; echo {resume ~g}";
    assert_eq!(eval(script).unwrap(), "1\n2\n");
}

#[test]
fn test_generator_final_result() {
    let script = "g: {generator (yield 1; set_result done)}; resume ~g; resume ~g";
    assert_eq!(eval_result(script).as_deref(), Some("done"));
}

#[test]
fn test_for_over_iterator() {
    let script = "it: {each (x, y, z)}; for ~it, v, (echo ~v)";
    assert_eq!(eval(script).unwrap(), "x\ny\nz\n");
}

#[test]
fn test_bubbles_collected_by_flavor() {
    let script = "macro work, (bubble (log, audit), started; bubble log, finished)\n\
                  work\n\
                  fizz log, m, (echo log, ~m)\n\
                  fizz audit, m, (echo audit, ~m)";
    assert_eq!(
        eval(script).unwrap(),
        "log started\nlog finished\naudit started\n"
    );
}

#[test]
fn test_list_commands() {
    assert_eq!(eval_result("item (a, b, c), -1").as_deref(), Some("c"));
    assert_eq!(eval_result("slice (a, b, c, d), 1, 3").as_deref(), Some("(b, c)"));
    assert_eq!(eval_result("append (a), b, c").as_deref(), Some("(a, b, c)"));
    assert_eq!(eval_result("keys (1, z: 2, a: 3)").as_deref(), Some("(\"a\", \"z\")"));
    assert_eq!(eval_result("json {list a, 1}").as_deref(), Some("[\"a\",1]"));
}
