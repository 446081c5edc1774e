//! Statement execution in a halted frame, for `executeStatement`.

use script::{compile_block, Interrupt, ScriptError, TraceContext};

/// What running controller-supplied statements produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Everything the statements printed, even when they then failed.
    pub output: String,
    pub error: Option<String>,
    /// The statements called `exit()`.
    pub exit: Option<i64>,
}

/// Compile and run statements in the numbered halted frame. Never
/// re-enters the debugger: trace hooks stay silent for the duration.
pub fn run_statement(ctx: &mut TraceContext<'_>, frame_number: usize, source: &str) -> ExecOutcome {
    let block = match compile_block(source) {
        Ok(block) => block,
        Err(error) => {
            return ExecOutcome {
                output: String::new(),
                error: Some(error.to_string()),
                exit: None,
            }
        }
    };
    let (output, result) = ctx.run_in_frame(&block, frame_number);
    match result {
        Ok(()) => ExecOutcome {
            output,
            error: None,
            exit: None,
        },
        Err(ScriptError::Interrupt(Interrupt::Exit(code))) => ExecOutcome {
            output,
            error: None,
            exit: Some(code),
        },
        Err(ScriptError::Runtime(error)) => ExecOutcome {
            output,
            error: Some(error.render()),
            exit: None,
        },
        Err(error) => ExecOutcome {
            output,
            error: Some(error.to_string()),
            exit: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use script::{compile, CollectingHost, Host, Interpreter};

    /// Run a program that halts at its last line, then hand the halted
    /// context to `probe`.
    fn with_halted_context<R>(
        source: &str,
        probe: impl FnOnce(&mut TraceContext<'_>) -> R,
    ) -> R {
        struct HaltAtEnd<F, R> {
            last_line: u32,
            probe: Option<F>,
            result: Option<R>,
        }

        impl<F, R> Host for HaltAtEnd<F, R>
        where
            F: FnOnce(&mut TraceContext<'_>) -> R,
        {
            fn stdout(&mut self, _text: &str) {}
            fn stderr(&mut self, _text: &str) {}
            fn input(&mut self, _prompt: &str) -> Result<String, script::HostError> {
                Err(script::HostError("no input".to_owned()))
            }
            fn fork(&mut self, _context: script::ForkContext) -> Result<i64, script::HostError> {
                Err(script::HostError("no fork".to_owned()))
            }
            fn wait_child(&mut self, _pid: i64) -> Result<i64, script::HostError> {
                Err(script::HostError("no fork".to_owned()))
            }
            fn on_line(&mut self, ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
                if ctx.current().line == self.last_line {
                    if let Some(probe) = self.probe.take() {
                        self.result = Some(probe(ctx));
                    }
                }
                Ok(())
            }
        }

        let program = compile(source, "probe.scr").expect("test program should compile");
        let last_line = source.lines().count() as u32;
        let mut host = HaltAtEnd {
            last_line,
            probe: Some(probe),
            result: None,
        };
        let mut interp = Interpreter::new();
        interp
            .run(&program, &mut host)
            .expect("test program should finish");
        host.result.expect("probe should have run")
    }

    #[test]
    fn statements_run_in_the_halted_frame() {
        let outcome = with_halted_context("x = 1\nprint(x)", |ctx| {
            run_statement(ctx, 0, "x = x + 41\nprint(x)")
        });
        assert_eq!(outcome.error, None);
        assert_eq!(outcome.output, "42\n");
        assert_eq!(outcome.exit, None);
    }

    #[test]
    fn syntax_errors_come_back_as_text() {
        let outcome = with_halted_context("x = 1\nprint(x)", |ctx| run_statement(ctx, 0, "x ="));
        assert!(outcome.error.is_some());
        assert_eq!(outcome.output, "");
    }

    #[test]
    fn failures_keep_partial_output() {
        let outcome = with_halted_context("x = 1\nprint(x)", |ctx| {
            run_statement(ctx, 0, "print(\"before\")\nmissing()")
        });
        assert_eq!(outcome.output, "before\n");
        let error = outcome.error.expect("should fail");
        assert!(error.contains("missing"), "unexpected error: {error}");
    }

    #[test]
    fn exit_is_reported_separately() {
        let outcome = with_halted_context("x = 1\nprint(x)", |ctx| {
            run_statement(ctx, 0, "exit(3)")
        });
        assert_eq!(outcome.exit, Some(3));
        assert_eq!(outcome.error, None);
    }

    #[test]
    fn collecting_host_refuses_interaction() {
        // The in-frame runner uses a host like this one; make sure the
        // blocking operations fail instead of wedging.
        let mut host = CollectingHost::default();
        assert!(host.input("? ").is_err());
        assert!(host.fork(script::ForkContext::User).is_err());
    }
}
