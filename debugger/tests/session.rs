//! Controller sessions against an in-process debuggee stub.
//!
//! Each test drives a real [`SessionManager`] while a background thread plays
//! the debuggee over a loopback socket: announcing itself, holding at
//! startup, and answering commands the way the client runtime does.

use std::io::IsTerminal;
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use eyre::{Context, Result};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use debugger::{
    DebugEvent, LaunchOptions, ManagerConfig, SessionError, SessionManager, SessionState,
    StatementOutcome,
};
use transport::params::{ForkTarget, VarScope};
use transport::{Message, MessageWriter, Method, Poll, SocketReader};

/// Correlation id stamped on every stub session.
const PROC: &str = "stub-proc";

#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    // error traces
    let _ = color_eyre::install();
}

/// The debuggee end of a stub session.
struct FakeDebuggee {
    reader: SocketReader,
    writer: MessageWriter<TcpStream>,
}

impl FakeDebuggee {
    /// Dial the controller and announce a debuggee.
    fn announce(port: u16) -> Result<Self> {
        let stream =
            TcpStream::connect(("127.0.0.1", port)).context("dialing the controller")?;
        // The client runtime dials with Nagle off (`transport::connect`);
        // the stub has to match or back-to-back reports arrive 40ms apart.
        stream.set_nodelay(true).context("configuring the stub socket")?;
        let reader = SocketReader::new(stream.try_clone().context("splitting the socket")?)
            .context("wrapping the stub reader")?;
        let writer = MessageWriter::new(stream);
        let mut stub = Self { reader, writer };
        stub.send(
            Method::ProcIdInfo,
            json!({
                "pid": 4242,
                "filename": "/tmp/job.scr",
                "module": "job",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        )?;
        Ok(stub)
    }

    fn send(&mut self, method: Method, params: serde_json::Value) -> Result<()> {
        self.writer
            .send_command(method, PROC, params)
            .context("sending from the stub debuggee")?;
        Ok(())
    }

    /// Read messages until `pred` accepts one, with a bounded total wait.
    fn wait_until(
        &mut self,
        what: &str,
        mut pred: impl FnMut(&Message) -> bool,
    ) -> Result<Message> {
        for _ in 0..300 {
            match self
                .reader
                .try_poll_message(Duration::from_millis(100))
                .context("polling the controller")?
            {
                Poll::Message(message) => {
                    if pred(&message) {
                        return Ok(message);
                    }
                    tracing::debug!(method = %message.method, "stub skipping message");
                }
                Poll::Timeout => {}
                Poll::Closed => eyre::bail!("controller closed the connection before {what}"),
            }
        }
        eyre::bail!("gave up waiting for {what}")
    }

    fn wait_for(&mut self, method: &Method) -> Result<Message> {
        let what = method.to_string();
        self.wait_until(&what, |message| &message.method == method)
    }

    /// Ride the bring-up: wait for the prologue release, report the startup
    /// hold, and wait for the controller's automatic continue.
    fn startup(&mut self) -> Result<()> {
        self.wait_for(&Method::PrologueContinue)?;
        self.send(
            Method::DebugStartup,
            json!({"filename": "/tmp/job.scr", "args": []}),
        )?;
        self.wait_for(&Method::Continue)?;
        Ok(())
    }

    /// Report a halt the way the runtime does: line, then stack.
    fn halt_at(&mut self, line: u32) -> Result<()> {
        self.send(
            Method::Line,
            json!({"filename": "/tmp/job.scr", "line": line}),
        )?;
        self.send(
            Method::Stack,
            json!({"stack": [
                {"filename": "/tmp/job.scr", "line": line, "function": "<module>"},
            ]}),
        )?;
        Ok(())
    }

    /// Report the exit and wait for the acknowledgment.
    fn report_exit(&mut self, code: i64) -> Result<()> {
        self.send(
            Method::EpilogueExitCode,
            json!({"exitCode": code, "message": ""}),
        )?;
        self.wait_for(&Method::EpilogueExit)?;
        Ok(())
    }
}

fn test_manager() -> Result<SessionManager> {
    let config = ManagerConfig {
        listen_port: 0,
        ..ManagerConfig::default()
    };
    SessionManager::new(config).context("binding the session manager")
}

/// The accept thread registers announcements asynchronously; poll until the
/// stub shows up.
fn wait_for_announcement(manager: &SessionManager) -> Result<()> {
    for _ in 0..100 {
        if !manager.scan().is_empty() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(20));
    }
    eyre::bail!("the stub debuggee never appeared in a scan")
}

fn join_stub<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    handle
        .join()
        .map_err(|_| eyre::eyre!("stub thread panicked"))?
}

#[test]
fn attaching_runs_the_handshake_and_reaches_attached() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        let _ = release_rx.recv();
        stub.report_exit(0)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    let info = manager.attach("4242")?;
    assert_eq!(info.pid, 4242);
    assert_eq!(info.procuuid, PROC);
    assert_eq!(manager.state()?, SessionState::Attached);

    release_tx.send(()).context("releasing the stub")?;
    let exit = manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    assert_eq!(
        exit,
        DebugEvent::Exit {
            code: Some(0),
            message: String::new(),
        }
    );
    assert_eq!(manager.state()?, SessionState::Detached);
    assert_eq!(manager.server_info()?, None);

    join_stub(stub)
}

#[test]
fn commands_are_gated_by_the_session_state() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        // The forceful stop sends a shutdown and drops the connection.
        let _ = stub.wait_for(&Method::Shutdown);
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;

    // Running freely: inspection and resume commands are refused.
    assert!(matches!(
        manager.request_go(),
        Err(SessionError::DebuggerNotBroken)
    ));
    assert!(matches!(
        manager.get_variables(0, VarScope::Global),
        Err(SessionError::DebuggerNotBroken)
    ));
    // A second session cannot start while one is active.
    assert!(matches!(
        manager.attach("4242"),
        Err(SessionError::AlreadyAttached)
    ));
    assert!(matches!(
        manager.launch(&LaunchOptions::new("/tmp/other.scr")),
        Err(SessionError::AlreadyAttached)
    ));

    manager.stop_debuggee()?;
    assert_eq!(manager.state()?, SessionState::Detached);

    join_stub(stub)
}

#[test]
fn mirrored_breakpoints_are_pushed_during_the_startup_hold() -> Result<()> {
    let manager = test_manager()?;
    manager.set_breakpoint("/tmp/job.scr", 3, false, Some("x > 1"))?;
    manager.set_watch("x > 5", false)?;
    let port = manager.port();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let stub = thread::spawn(move || -> Result<Vec<Message>> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.wait_for(&Method::PrologueContinue)?;
        stub.send(
            Method::DebugStartup,
            json!({"filename": "/tmp/job.scr", "args": []}),
        )?;

        // Everything mirrored lands before the startup continue.
        let mut pushed = Vec::new();
        loop {
            let message = stub.wait_until("the startup continue", |_| true)?;
            if message.method == Method::Continue {
                break;
            }
            pushed.push(message);
        }
        let _ = release_rx.recv();
        stub.report_exit(0)?;
        Ok(pushed)
    });

    wait_for_announcement(&manager)?;
    manager.attach("job.scr")?;
    release_tx.send(()).context("releasing the stub")?;
    manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));

    let pushed = join_stub(stub)?;
    let bp = pushed
        .iter()
        .find(|m| m.method == Method::SetBreakpoint)
        .expect("breakpoint pushed at startup");
    assert_eq!(bp.params["filename"], "/tmp/job.scr");
    assert_eq!(bp.params["line"], 3);
    assert_eq!(bp.params["condition"], "x > 1");
    let wp = pushed
        .iter()
        .find(|m| m.method == Method::SetWatch)
        .expect("watch pushed at startup");
    assert_eq!(wp.params["condition"], "x > 5");
    Ok(())
}

#[test]
fn a_halt_allows_inspection_and_resuming() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        stub.halt_at(3)?;

        let request = stub.wait_for(&Method::Variables)?;
        assert_eq!(request.params["frameNumber"], 0);
        assert_eq!(request.params["scope"], "global");
        stub.send(
            Method::Variables,
            json!({
                "frameNumber": 0,
                "scope": "global",
                "variables": [
                    {"name": "x", "type": "int", "value": "2", "hasChildren": false},
                ],
            }),
        )?;

        stub.wait_for(&Method::StepOver)?;
        stub.halt_at(4)?;
        stub.wait_for(&Method::Continue)?;
        let _ = release_rx.recv();
        stub.report_exit(0)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;

    manager.wait_for_event(|event| matches!(event, DebugEvent::Line(_)));
    assert_eq!(manager.state()?, SessionState::Broken);
    assert_eq!(manager.current_stack()?.len(), 1);

    let reply = manager.get_variables(0, VarScope::Global)?;
    assert_eq!(reply.variables.len(), 1);
    assert_eq!(reply.variables[0].name, "x");
    assert_eq!(reply.variables[0].value, "2");

    manager.request_step_over()?;
    let halt = manager.wait_for_event(|event| matches!(event, DebugEvent::Line(_)));
    let DebugEvent::Line(event) = halt else {
        unreachable!()
    };
    assert_eq!(event.line, 4);
    assert_eq!(manager.state()?, SessionState::Broken);

    manager.request_go()?;
    assert_eq!(manager.state()?, SessionState::Attached);

    release_tx.send(()).context("releasing the stub")?;
    manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    join_stub(stub)
}

#[test]
fn statements_settle_on_either_reply_method() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        stub.halt_at(2)?;

        let first = stub.wait_for(&Method::ExecuteStatement)?;
        assert_eq!(first.params["statement"], "x = 9");
        stub.send(Method::ExecStatementOutput, json!({"text": "poked\n"}))?;

        stub.wait_for(&Method::ExecuteStatement)?;
        stub.send(
            Method::ExecStatementError,
            json!({"text": "syntax error at 1:5"}),
        )?;

        stub.wait_for(&Method::Continue)?;
        let _ = release_rx.recv();
        stub.report_exit(0)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;
    manager.wait_for_event(|event| matches!(event, DebugEvent::Line(_)));

    let outcome = manager.execute_statement("x = 9", 0)?;
    assert_eq!(outcome, StatementOutcome::Output("poked\n".to_owned()));

    let outcome = manager.execute_statement("y = ", 0)?;
    let StatementOutcome::Error(text) = outcome else {
        panic!("expected a statement error, got {outcome:?}");
    };
    assert!(text.contains("syntax error"));

    manager.request_go()?;
    release_tx.send(()).context("releasing the stub")?;
    manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    join_stub(stub)
}

#[test]
fn analyze_mode_switches_to_the_exception_stack() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        stub.halt_at(5)?;
        stub.send(
            Method::Exception,
            json!({
                "type": "RuntimeError",
                "message": "boom",
                "stack": [
                    {"filename": "/tmp/job.scr", "line": 9, "function": "helper"},
                    {"filename": "/tmp/job.scr", "line": 5, "function": "<module>"},
                ],
            }),
        )?;
        stub.wait_for(&Method::Continue)?;
        let _ = release_rx.recv();
        stub.report_exit(1)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;
    manager.wait_for_event(|event| matches!(event, DebugEvent::Exception(_)));
    assert_eq!(manager.state()?, SessionState::Broken);
    assert_eq!(manager.current_stack()?.len(), 1);

    manager.set_analyze(true)?;
    assert_eq!(manager.state()?, SessionState::Analyze);
    let stack = manager.current_stack()?;
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0].function, "helper");

    // Analyze mode still accepts inspection but not a second entry.
    assert!(matches!(
        manager.set_analyze(true),
        Err(SessionError::DebuggerNotBroken)
    ));

    manager.set_analyze(false)?;
    assert_eq!(manager.state()?, SessionState::Broken);
    assert_eq!(manager.current_stack()?.len(), 1);

    manager.request_go()?;
    release_tx.send(()).context("releasing the stub")?;
    let exit = manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    assert_eq!(
        exit,
        DebugEvent::Exit {
            code: Some(1),
            message: String::new(),
        }
    );
    join_stub(stub)
}

#[test]
fn a_lost_connection_reports_an_exit_without_a_code() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        let _ = release_rx.recv();
        // Dropping the stub severs the connection with no exit report.
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;
    release_tx.send(()).context("releasing the stub")?;

    let exit = manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    let DebugEvent::Exit { code, message } = exit else {
        unreachable!()
    };
    assert_eq!(code, None);
    assert!(message.contains("lost"));
    assert_eq!(manager.state()?, SessionState::Detached);

    join_stub(stub)
}

#[test]
fn a_self_cleared_breakpoint_leaves_the_mirror() -> Result<()> {
    let manager = test_manager()?;
    manager.set_breakpoint("/tmp/job.scr", 3, true, None)?;
    let port = manager.port();

    let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.wait_for(&Method::PrologueContinue)?;
        stub.send(
            Method::DebugStartup,
            json!({"filename": "/tmp/job.scr", "args": []}),
        )?;
        stub.wait_for(&Method::Continue)?;

        // A temporary breakpoint hit drops itself.
        let _ = release_rx.recv();
        stub.send(
            Method::ClearBreakpoint,
            json!({"filename": "/tmp/job.scr", "line": 3}),
        )?;
        stub.report_exit(0)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;
    assert!(manager.proxy().lookup("/tmp/job.scr", 3).is_some());

    release_tx.send(()).context("releasing the stub")?;
    manager.wait_for_event(|event| matches!(event, DebugEvent::BreakpointCleared(_)));
    assert!(manager.proxy().lookup("/tmp/job.scr", 3).is_none());

    manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    join_stub(stub)
}

#[test]
fn stdin_requests_surface_and_answers_flow_back() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        stub.send(Method::Stdin, json!({"prompt": "who? "}))?;
        let answer = stub.wait_for(&Method::Stdin)?;
        assert_eq!(answer.params["input"], "tester");
        stub.report_exit(0)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;

    let request =
        manager.wait_for_event(|event| matches!(event, DebugEvent::StdinRequested(_)));
    assert_eq!(request, DebugEvent::StdinRequested("who? ".to_owned()));
    manager.send_stdin("tester")?;

    manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    join_stub(stub)
}

#[test]
fn fork_queries_are_answered_with_the_configured_side() -> Result<()> {
    let manager = test_manager()?;
    manager.set_fork_mode(ForkTarget::Child)?;
    let port = manager.port();

    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        stub.send(Method::ForkTo, json!({}))?;
        let answer = stub.wait_for(&Method::ForkTo)?;
        assert_eq!(answer.params["target"], "child");
        stub.report_exit(0)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;

    let switched = manager.wait_for_event(|event| matches!(event, DebugEvent::ForkSwitch(_)));
    assert_eq!(switched, DebugEvent::ForkSwitch(ForkTarget::Child));

    manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    join_stub(stub)
}

#[test]
fn detach_waits_for_the_exit_report() -> Result<()> {
    let manager = test_manager()?;
    let port = manager.port();

    let stub = thread::spawn(move || -> Result<()> {
        let mut stub = FakeDebuggee::announce(port)?;
        stub.startup()?;
        stub.wait_for(&Method::Shutdown)?;
        stub.report_exit(0)?;
        Ok(())
    });

    wait_for_announcement(&manager)?;
    manager.attach("4242")?;
    manager.detach()?;

    assert_eq!(manager.state()?, SessionState::Detached);
    let exit = manager.wait_for_event(|event| matches!(event, DebugEvent::Exit { .. }));
    assert_eq!(
        exit,
        DebugEvent::Exit {
            code: Some(0),
            message: String::new(),
        }
    );
    join_stub(stub)
}
