#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::executor::*;
    use std::time::Duration;

    fn executor_with(config: Config) -> (Executor, Arc<Mutex<String>>) {
        let executor = Executor::new(config);
        executor.register_stdlib();
        let output = executor.capture_output();
        (executor, output)
    }

    fn run(source: &str) -> (RunOutcome, String) {
        let (executor, output) = executor_with(Config::default());
        let outcome = executor.run_script(source).expect("parse failed");
        let text = output.lock().unwrap().clone();
        (outcome, text)
    }

    fn output_of(source: &str) -> String {
        run(source).1
    }

    // === Sequences ===

    #[test]
    fn sequence_and_then_or_else() {
        assert_eq!(output_of("false & echo no | echo yes"), "yes\n");
        assert_eq!(output_of("true & echo yes | echo no"), "yes\n");
    }

    #[test]
    fn sequence_keyword_separators() {
        assert_eq!(output_of("false then echo no else echo yes"), "yes\n");
    }

    #[test]
    fn sequence_unknown_command_is_false() {
        let (outcome, text) = run("nosuch_command | echo fallback");
        assert_eq!(text, "fallback\n");
        assert!(outcome.status);
    }

    #[test]
    fn sequence_inversion() {
        assert_eq!(output_of("!false & echo yes"), "yes\n");
        assert_eq!(output_of("!msleep 5 | echo inverted"), "inverted\n");
    }

    #[test]
    fn sequence_assign_and_read() {
        assert_eq!(output_of("x: 5; echo ~x"), "5\n");
        let (outcome, _) = run("x: 5; x: undefined; echo ~x");
        assert!(!outcome.status);
    }

    #[test]
    fn sequence_chain_operators() {
        let (outcome, _) = run("list 1, 2, 3 ~> len");
        assert_eq!(outcome.display.as_deref(), Some("3"));
        assert_eq!(output_of("add 2, 3 => x; echo ~x"), "5\n");
    }

    // === Braces ===

    #[test]
    fn brace_substitutes_result() {
        assert_eq!(output_of("echo {add 1, 2}"), "3\n");
    }

    #[test]
    fn brace_nested_inside_quotes() {
        assert_eq!(output_of("echo \"sum: {add 1, {add 2, 3}}\""), "sum: 6\n");
    }

    #[test]
    fn brace_status_without_result() {
        assert_eq!(output_of("echo {true}"), "true\n");
    }

    #[test]
    fn brace_failure_aborts_command() {
        let (outcome, text) = run("echo {nosuch_command}");
        assert_eq!(text, "");
        assert!(!outcome.status);
    }

    #[test]
    fn brace_waits_for_async_content() {
        assert_eq!(output_of("echo {msleep 5; set_result 7}"), "7\n");
    }

    #[test]
    fn brace_siblings_splice_by_position() {
        // Whichever sibling finishes first, each lands in its own place
        assert_eq!(
            output_of("echo {msleep 60; set_result a}, {msleep 5; set_result b}"),
            "a b\n"
        );
        assert_eq!(
            output_of("echo {msleep 5; set_result a}, {msleep 60; set_result b}"),
            "a b\n"
        );
    }

    #[test]
    fn brace_siblings_inside_macro() {
        let (outcome, text) =
            run("macro m, (echo {msleep 30; set_result x}, {msleep 10; set_result y}); m; echo done");
        assert!(outcome.status);
        assert_eq!(text, "x y\ndone\n");
    }

    #[test]
    fn brace_sync_and_async_siblings() {
        assert_eq!(output_of("echo {add 1, 1}, {msleep 10; add 2, 2}, {add 3, 3}"), "2 4 6\n");
    }

    #[test]
    fn brace_list_reference_stays_usable() {
        assert_eq!(output_of("x: {list a, b}; echo {len ~x}"), "2\n");
    }

    // === Macros ===

    #[test]
    fn macro_positional_arguments() {
        assert_eq!(output_of("macro greet, (echo \"hi $1\"); greet bob"), "hi bob\n");
        assert_eq!(output_of("macro count, (echo $#); count a, b, c"), "3\n");
    }

    #[test]
    fn macro_early_return_sets_result() {
        let (outcome, text) = run("macro f, (ret 5; echo unreachable); f");
        assert_eq!(text, "");
        assert_eq!(outcome.display.as_deref(), Some("5"));
    }

    #[test]
    fn macro_scope_is_private() {
        let (outcome, _) = run("macro f, (inner: 1); f; echo ~inner");
        assert!(!outcome.status);
    }

    #[test]
    fn macro_anonymous_by_reference() {
        assert_eq!(output_of("m: {macro (echo got $1)}; call ~m, x"), "got x\n");
    }

    #[test]
    fn macro_bubbles_reach_caller() {
        assert_eq!(
            output_of("macro b, (bubble note, hi); b; fizz note, v, (echo ~v)"),
            "hi\n"
        );
    }

    // === Loops ===

    #[test]
    fn loop_while() {
        assert_eq!(
            output_of("i: 0; while (lt ~i, 3), (echo ~i; i: {add ~i, 1})"),
            "0\n1\n2\n"
        );
    }

    #[test]
    fn loop_for_range_both_directions() {
        assert_eq!(output_of("for 1, 3, i, (echo ~i)"), "1\n2\n3\n");
        assert_eq!(output_of("for 3, 1, i, (echo ~i)"), "3\n2\n1\n");
        assert_eq!(output_of("for 0, 4, i, (echo ~i), by: 2"), "0\n2\n4\n");
    }

    #[test]
    fn loop_for_zero_step_fails() {
        let (outcome, text) = run("for 0, 4, i, (echo ~i), by: 0");
        assert!(!outcome.status);
        assert_eq!(text, "");
    }

    #[test]
    fn loop_for_over_list() {
        assert_eq!(output_of("for (a, b), x, (echo ~x)"), "a\nb\n");
    }

    #[test]
    fn loop_break_and_continue() {
        assert_eq!(output_of("for 1, 10, i, (gt ~i, 2 & break; echo ~i)"), "1\n2\n");
        assert_eq!(output_of("for 1, 3, i, (eq ~i, 2 & continue; echo ~i)"), "1\n3\n");
    }

    #[test]
    fn loop_break_two_levels() {
        assert_eq!(
            output_of("for 1, 3, i, (for 1, 3, j, (eq ~j, 2 & break 2; echo ~i, ~j)); echo after"),
            "1 1\nafter\n"
        );
    }

    #[test]
    fn loop_repeat_collects_results() {
        let (outcome, _) = run("repeat (add 1, 1), 3");
        assert_eq!(outcome.display.as_deref(), Some("(2, 2, 2)"));
        assert_eq!(output_of("r: {repeat (add ~n, 10), 3, n}; echo {item ~r, 2}"), "12\n");
    }

    #[test]
    fn loop_iteration_cap() {
        let (executor, _) = executor_with(Config::default().with_max_iterations(5));
        let outcome = executor.run_script("while (true), (true)").unwrap();
        assert!(!outcome.status);
    }

    #[test]
    fn loop_break_outside_loop_fails() {
        let (outcome, _) = run("break");
        assert!(!outcome.status);
    }

    // === Generators ===

    #[test]
    fn generator_from_macro() {
        assert_eq!(
            output_of("macro count, (yield 1; yield 2); g: {generator count}; echo {resume ~g}; echo {resume ~g}"),
            "1\n2\n"
        );
    }

    #[test]
    fn generator_yield_inside_loop() {
        assert_eq!(
            output_of("g: {generator (for 1, 3, i, (yield ~i))}; echo {resume ~g}; echo {resume ~g}; echo {resume ~g}"),
            "1\n2\n3\n"
        );
    }

    #[test]
    fn generator_resumes_mid_while_body() {
        let text = output_of(
            "g: {generator (i: 0; while (lt ~i, 10), (i: {add ~i, 1}; eq ~i, 3 & yield ~i; echo after, ~i))}\n\
             echo got {resume ~g}\n\
             resume ~g",
        );
        let mut expected = String::from("after 1\nafter 2\ngot 3\n");
        for i in 3..=10 {
            expected.push_str(&format!("after {}\n", i));
        }
        assert_eq!(text, expected);
    }

    #[test]
    fn generator_drives_for_loop() {
        assert_eq!(
            output_of("g: {generator (yield a; yield b)}; for ~g, v, (echo ~v)"),
            "a\nb\n"
        );
    }

    #[test]
    fn generator_retires_at_end() {
        let (outcome, _) = run("g: {generator (yield 1)}; resume ~g; resume ~g; token_valid ~g");
        assert!(!outcome.status);
    }

    #[test]
    fn iterator_each_and_exhaustion() {
        let (outcome, text) = run("it: {each (x, y)}; echo {resume ~it}; echo {resume ~it}; resume ~it");
        assert_eq!(text, "x\ny\n");
        assert!(!outcome.status);
    }

    #[test]
    fn iterator_pair_yields_index_then_key() {
        assert_eq!(
            output_of("it: {pair (a, k: b)}; echo {resume ~it}; echo {resume ~it}"),
            "(0, a)\n(\"k\", b)\n"
        );
    }

    #[test]
    fn suspend_at_top_level_resumes_later() {
        let (executor, output) = executor_with(Config::default());
        let state = executor.new_state();
        let first = executor.run_in("echo a; suspend; echo b", &state);
        assert!(first.status);
        assert_eq!(*output.lock().unwrap(), "a\n");
        let second = executor.run_in("resume ~#token", &state);
        assert!(second.status);
        assert_eq!(*output.lock().unwrap(), "a\nb\n");
    }

    // === Tokens ===

    #[test]
    fn async_sequence_completes() {
        assert_eq!(output_of("msleep 5; echo done"), "done\n");
    }

    #[test]
    fn execute_returns_pending_token() {
        let (executor, output) = executor_with(Config::default());
        let Completion::Pending(id) = executor.execute("msleep 20; echo later") else {
            panic!("expected a pending completion");
        };
        assert!(executor.token_valid(&id));
        assert_eq!(executor.wait_token(&id, Duration::from_secs(5)).unwrap(), true);
        assert_eq!(*output.lock().unwrap(), "later\n");
    }

    #[test]
    fn cancel_drops_continuation() {
        let (executor, output) = executor_with(Config::default());
        let Completion::Pending(id) = executor.execute("msleep 10000; echo never") else {
            panic!("expected a pending completion");
        };
        assert!(executor.cancel_token(&id));
        assert!(!executor.token_valid(&id));
        assert_eq!(*output.lock().unwrap(), "");
    }

    #[test]
    fn token_timeout_cancels() {
        let config = Config::default().with_token_timeout(Duration::from_millis(20));
        let (executor, _) = executor_with(config);
        let id = executor.request_token(TokenRequest::new());
        std::thread::sleep(Duration::from_millis(200));
        assert!(!executor.token_valid(&id));
    }

    #[test]
    fn host_resume_runs_chained_token() {
        let (executor, _) = executor_with(Config::default());
        let first = executor.request_token(TokenRequest::new());
        let second = executor.request_token(TokenRequest::new());
        assert!(executor.chain_tokens(&first, &second));
        assert!(executor.resume_token(&first, false));
        assert_eq!(executor.wait_token(&second, Duration::from_secs(1)).unwrap(), false);
    }

    // === Modules ===

    #[test]
    fn library_module_needs_import() {
        let (outcome, _) = run("mul 6, 7");
        assert!(!outcome.status);
        let (outcome, _) = run("IMPORT math; mul 6, 7");
        assert_eq!(outcome.display.as_deref(), Some("42"));
    }

    #[test]
    fn parse_error_is_returned_by_run_script() {
        let (executor, _) = executor_with(Config::default());
        assert!(executor.run_script("echo (unclosed").is_err());
    }

    #[test]
    fn unclosed_block_comment_is_a_parse_error() {
        let (executor, output) = executor_with(Config::default());
        assert!(executor.run_script("echo a #( never closed\necho b").is_err());
        assert_eq!(*output.lock().unwrap(), "");
        assert_eq!(output_of("echo a #( closed )# ; echo b"), "a\nb\n");
    }

    // === Output ===

    struct BrokenPipe;

    impl std::io::Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn emit_reports_write_failure() {
        assert!(!emit(&mut BrokenPipe, "lost"));
        let mut sink = Vec::new();
        assert!(emit(&mut sink, "kept"));
        assert_eq!(sink, b"kept");
    }
}
