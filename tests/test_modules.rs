//! Integration tests for MODULE, LIBRARY, IMPORT, REMOVE and EXPORT

#[path = "common/mod.rs"]
mod common;
use common::{eval, eval_result, eval_status};

#[test]
fn test_import_whole_module() {
    assert!(!eval_status("mul 6, 7"));
    assert_eq!(eval_result("IMPORT math; mul 6, 7").as_deref(), Some("42"));
}

#[test]
fn test_import_single_item() {
    assert_eq!(eval_result("IMPORT \"math::sub\"; sub 10, 4").as_deref(), Some("6"));
    assert!(!eval_status("IMPORT \"math::sub\"; mul 2, 2"));
}

#[test]
fn test_import_with_alias() {
    assert_eq!(eval_result("IMPORT times: \"math::mul\"; times 3, 5").as_deref(), Some("15"));
    // Only the alias is bound
    assert!(!eval_status("IMPORT times: \"math::mul\"; mul 3, 5"));
}

#[test]
fn test_import_unknown_module_fails() {
    assert!(!eval_status("IMPORT nosuch"));
    assert!(!eval_status("IMPORT \"math::nosuch\""));
}

#[test]
fn test_library_restrict_hides_module() {
    assert!(!eval_status("LIBRARY \"restrict math\"; IMPORT math"));
}

#[test]
fn test_export_from_macro_scope() {
    let script = "macro mk, (MODULE util; macro hello, (echo hello from util); EXPORT hello)\n\
                  mk\n\
                  IMPORT util\n\
                  hello";
    assert_eq!(eval(script).unwrap(), "hello from util\n");
}

#[test]
fn test_macro_definitions_stay_private() {
    let script = "macro mk, (macro helper, (echo helper)); mk; helper";
    assert!(!eval_status(script));
}

#[test]
fn test_remove_my_then_restore_from_stdlib() {
    assert!(!eval_status("REMOVE MY echo; echo hi"));
    assert_eq!(
        eval("REMOVE MY echo; IMPORT \"stdlib::echo\"; echo back").unwrap(),
        "back\n"
    );
}

#[test]
fn test_remove_module_imports() {
    assert!(!eval_status("IMPORT math; REMOVE math; mul 2, 3"));
    // Removing what was never imported is an error
    assert!(!eval_status("REMOVE math"));
}

#[test]
fn test_removal_inside_macro_is_local() {
    let script = "macro quiet, (REMOVE MY echo; echo inside); quiet | echo outside";
    assert_eq!(eval(script).unwrap(), "outside\n");
}

#[test]
fn test_macro_delete() {
    assert!(!eval_status("macro f, (true); macro_delete f; f"));
    assert!(!eval_status("macro_delete nosuch"));
}

#[test]
fn test_sys_module() {
    assert!(eval_status("IMPORT sys; now"));
    assert!(!eval_status("now"));
}

#[test]
fn test_remove_all_falls_back_to_inherited() {
    // The local override goes, the inherited command comes back
    assert!(eval_status("macro echo, (false); REMOVE ALL; echo hi"));
    assert_eq!(eval("macro echo, (false); REMOVE ALL; echo hi").unwrap(), "hi\n");
    // Imports were local too
    assert!(!eval_status("IMPORT math; REMOVE ALL; mul 2, 3"));
}

#[test]
fn test_remove_all_inside_macro_leaves_caller_alone() {
    let script = "IMPORT math\n\
                  macro echo, (false)\n\
                  macro reset, (REMOVE ALL; mul 2, 3)\n\
                  reset => inner\n\
                  echo visible\n\
                  eq ~inner, 6 & mul 4, 5";
    let (executor, output) = common::executor();
    let outcome = executor.run_script(script).unwrap();
    // Inside the macro the caller's import is inherited, so it survives
    assert!(outcome.status);
    // The caller keeps both its import and its echo override
    assert_eq!(outcome.display.as_deref(), Some("20"));
    assert_eq!(*output.lock().unwrap(), "");
}
