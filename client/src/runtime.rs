//! The debug runtime embedded in the debugged process.
//!
//! [`DebugClient`] sits on the interpreter's host seam. Every trace hook
//! services the control socket, so breakpoint updates, introspection
//! requests and resume commands are handled both while the script runs and
//! while it sits halted. The same object owns the session lifecycle: the
//! announce/acknowledge handshake before the script starts and the exit
//! report handshake after it ends.

use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use script::{
    compile, reserved_names, DefaultHost, ForkContext, Frame, Host, HostError, Interpreter,
    Interrupt, RuntimeError, ScriptError, SyntaxError, TraceContext, Value, PRELUDE_FILENAME,
};
use transport::params::{
    BreakpointConditionError, BreakpointEnable, BreakpointIgnore, BreakpointRef,
    CallTraceDirection, CallTraceEvent, CallTraceToggle, DebugStartup, EpilogueExitCode,
    ExceptionEvent, ExecuteStatement, ForkTarget, ForkToReply, LineEvent, MoveIp, OutputEvent,
    ProcIdInfo, SetBreakpoint, SetEnvironment, SetFilter, SetWatch, SignalEvent, StackEntry,
    StackEvent, StdinReply, StdinRequest, SyntaxErrorEvent, ThreadInfo, ThreadListReply,
    ThreadSet, VarScope, VariableItem, VariableReply, VariableRequest, VariablesReply,
    VariablesRequest, WatchConditionError, WatchEnable, WatchIgnore, WatchRef,
};
use transport::{
    connect, CodecError, Connection, Message, MessageWriter, Method, Poll, SocketReader,
    CONNECT_TIMEOUT,
};

use crate::breakpoints::{BreakpointTable, ConditionVerdict, Hit, WatchObservation, WatchTable};
use crate::execute;
use crate::fork::{self, ForkPolicy};
use crate::signals::{signal_name, SignalWatch};
use crate::variables::{self, VariableFilters};

/// Bound on the controller acknowledging our announcement.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on the controller acknowledging the exit report.
pub const EPILOGUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll granularity of the blocking event loop; interrupts and signals are
/// noticed at this cadence even when the controller is silent.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Upper bound on one uninterruptible slice of a script `sleep()`.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Delay between child-exit polls in `wait_child`.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// The interpreter is single threaded; this is the id it reports for its
/// one thread.
const MAIN_THREAD_ID: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not reach the controller at {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: CodecError,
    },

    #[error("handshake with the controller failed: {0}")]
    Handshake(#[source] CodecError),

    /// The control connection died mid-session.
    #[error("connection to the controller was lost")]
    ConnectionLost,

    #[error("could not read script {path:?}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// How the runtime behaves; every field maps to a command-line flag on the
/// debug client binary.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    /// Correlation id stamped on every message either way.
    pub procuuid: String,
    /// Ship script stdio over the protocol instead of the console.
    pub redirect: bool,
    /// Report runtime errors as they are raised.
    pub exc_report: bool,
    /// Start with call/return events on.
    pub call_trace: bool,
    /// Trace prelude code as well as user code.
    pub trace_lib: bool,
    pub fork_policy: ForkPolicy,
    /// Accepted for compatibility; this build always speaks UTF-8.
    pub encoding: String,
    /// Token proving we are the process the controller spawned.
    pub auth: Option<String>,
    pub handshake_timeout: Duration,
    pub epilogue_timeout: Duration,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            procuuid: Uuid::new_v4().to_string(),
            redirect: true,
            exc_report: true,
            call_trace: true,
            trace_lib: false,
            fork_policy: ForkPolicy::Ask,
            encoding: "utf-8".to_owned(),
            auth: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            epilogue_timeout: EPILOGUE_TIMEOUT,
        }
    }
}

/// What the runtime does at the next traced statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stepping {
    /// Only breakpoints, watches and signals halt.
    Run,
    /// Halt at the next statement anywhere.
    Step,
    /// Halt at the next statement at or above the depth stepping started at.
    StepOver { depth: usize },
    /// Halt once the stack is shallower than where stepping started.
    StepOut { depth: usize },
}

fn stepping_halts(stepping: Stepping, depth: usize) -> bool {
    match stepping {
        Stepping::Run => false,
        Stepping::Step => true,
        Stepping::StepOver { depth: start } => depth <= start,
        Stepping::StepOut { depth: start } => depth < start,
    }
}

pub struct DebugClient {
    reader: SocketReader,
    writer: MessageWriter<TcpStream>,
    opts: ClientOptions,
    breakpoints: BreakpointTable,
    watches: WatchTable,
    filters: VariableFilters,
    signals: SignalWatch,
    stepping: Stepping,
    call_trace_enabled: bool,
    /// A dispatch handler asked the blocking event loop to return.
    event_exit: bool,
    /// Halted at a trace point, servicing the controller.
    halted: bool,
    /// This side of a fork is no longer the debugged process.
    detached: bool,
    connection_lost: bool,
    quit_requested: bool,
    /// `exit()` ran inside `executeStatement`; unwind with this code.
    exit_request: Option<i64>,
    epilogue_done: bool,
    pending_stdin: Option<String>,
    fork_answer: Option<ForkTarget>,
}

impl DebugClient {
    /// Dial the controller and wrap the connection.
    pub fn connect(opts: ClientOptions) -> Result<Self, ClientError> {
        let connection =
            connect(&opts.host, opts.port, CONNECT_TIMEOUT).map_err(|source| {
                ClientError::Connect {
                    host: opts.host.clone(),
                    port: opts.port,
                    source,
                }
            })?;
        Ok(Self::new(connection, opts))
    }

    pub fn new(connection: Connection, opts: ClientOptions) -> Self {
        let call_trace_enabled = opts.call_trace;
        Self {
            reader: connection.reader,
            writer: connection.writer,
            opts,
            breakpoints: BreakpointTable::default(),
            watches: WatchTable::default(),
            filters: VariableFilters::default(),
            signals: SignalWatch::disarmed(),
            stepping: Stepping::Run,
            call_trace_enabled,
            event_exit: false,
            halted: false,
            detached: false,
            connection_lost: false,
            quit_requested: false,
            exit_request: None,
            epilogue_done: false,
            pending_stdin: None,
            fork_answer: None,
        }
    }

    /// Run one script under the controller's direction and return the exit
    /// code the process should report.
    ///
    /// The full lifecycle lives here: announce, wait for the go-ahead, hold
    /// at startup while breakpoints are installed, trace the script, report
    /// the exit.
    pub fn run_script(&mut self, path: &Path, args: &[String]) -> Result<i64, ClientError> {
        self.handshake(path)?;

        let source = std::fs::read_to_string(path).map_err(|source| ClientError::Script {
            path: path.to_owned(),
            source,
        })?;
        let filename = path.display().to_string();
        let program = match compile(&source, &filename) {
            Ok(program) => program,
            Err(error) => {
                self.report_syntax_error(&error, &filename);
                self.prog_terminated(1, "syntax error in script");
                return Ok(1);
            }
        };

        let conflicts = program.shadowed_names(&reserved_names());
        let startup = DebugStartup {
            filename: filename.clone(),
            args: args.to_vec(),
            conflicts,
        };
        let message = Message::with_params(Method::DebugStartup, self.opts.procuuid.as_str(), &startup)?;
        self.writer.send(&message)?;

        // Hold until the controller has primed breakpoints and resumes us.
        self.event_loop(None, true);
        if self.connection_lost {
            return Err(ClientError::ConnectionLost);
        }
        if self.quit_requested {
            self.prog_terminated(0, "terminated before start");
            return Ok(0);
        }

        self.signals = match SignalWatch::install() {
            Ok(watch) => watch,
            Err(error) => {
                warn!(%error, "could not install signal handlers");
                SignalWatch::disarmed()
            }
        };

        let mut interp = Interpreter::new();
        if let Err(error) = interp.load_prelude() {
            warn!(%error, "prelude failed to load");
        }
        let mut argv = vec![Value::Str(filename.clone())];
        argv.extend(args.iter().map(|arg| Value::Str(arg.clone())));
        interp.set_global("argv", Value::list(argv));

        let code = match interp.run(&program, self) {
            Ok(()) => {
                self.prog_terminated(0, "");
                0
            }
            Err(ScriptError::Interrupt(Interrupt::Exit(code))) => {
                self.prog_terminated(code, &format!("exit({code}) called"));
                code
            }
            Err(ScriptError::Interrupt(Interrupt::Quit)) => {
                if self.connection_lost {
                    return Err(ClientError::ConnectionLost);
                }
                self.prog_terminated(0, "terminated by debugger");
                0
            }
            Err(ScriptError::Runtime(error)) => {
                // Already reported from the raise point via the exception
                // hook.
                self.prog_terminated(1, &error.to_string());
                1
            }
            Err(ScriptError::Syntax(error)) => {
                self.report_syntax_error(&error, &filename);
                self.prog_terminated(1, "syntax error in script");
                1
            }
        };
        Ok(code)
    }

    /// Announce this process and wait for the controller's go-ahead.
    fn handshake(&mut self, path: &Path) -> Result<(), ClientError> {
        let module = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_owned());
        let info = ProcIdInfo {
            pid: std::process::id() as i32,
            filename: path.display().to_string(),
            module,
            version: env!("CARGO_PKG_VERSION").to_owned(),
            auth: self.opts.auth.clone(),
        };
        let message = Message::with_params(Method::ProcIdInfo, self.opts.procuuid.as_str(), &info)?;
        self.writer.send(&message)?;
        self.reader
            .wait_for(&Method::PrologueContinue, self.opts.handshake_timeout)
            .map_err(ClientError::Handshake)?;
        Ok(())
    }

    /// Report the exit code and wait briefly for the acknowledgement.
    /// Idempotent; later calls are no-ops.
    fn prog_terminated(&mut self, exit_code: i64, message: &str) {
        if self.epilogue_done {
            return;
        }
        self.epilogue_done = true;
        if self.detached || self.connection_lost {
            return;
        }
        self.send(
            Method::EpilogueExitCode,
            &EpilogueExitCode {
                exit_code,
                message: message.to_owned(),
            },
        );
        if self.connection_lost {
            return;
        }
        match self
            .reader
            .wait_for(&Method::EpilogueExit, self.opts.epilogue_timeout)
        {
            Ok(_) => debug!("controller acknowledged the exit report"),
            Err(error) => warn!(%error, "exiting without an epilogue acknowledgement"),
        }
    }

    fn report_syntax_error(&mut self, error: &SyntaxError, filename: &str) {
        self.send(
            Method::SyntaxError,
            &SyntaxErrorEvent {
                message: error.message.clone(),
                filename: filename.to_owned(),
                line: error.line,
                character_number: error.column,
            },
        );
    }

    /// Encode and send, downgrading a dead connection to a flag. Everything
    /// after the startup phase reports through here: once the controller is
    /// gone the script is stopped at the next trace point instead of
    /// erroring mid-statement.
    fn send<T: Serialize>(&mut self, method: Method, params: &T) {
        if self.detached || self.connection_lost {
            return;
        }
        let message = match Message::with_params(method, self.opts.procuuid.as_str(), params) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping unencodable message");
                return;
            }
        };
        if let Err(error) = self.writer.send(&message) {
            warn!(%error, "control connection lost while sending");
            self.connection_lost = true;
        }
    }

    fn send_empty(&mut self, method: Method) {
        if self.detached || self.connection_lost {
            return;
        }
        let message = Message::new(method, self.opts.procuuid.as_str(), serde_json::Value::Null);
        if let Err(error) = self.writer.send(&message) {
            warn!(%error, "control connection lost while sending");
            self.connection_lost = true;
        }
    }

    /// Service the control channel.
    ///
    /// Blocking mode runs until a handler asks to exit: a resume command, a
    /// quit, an awaited answer arriving. Non-blocking mode drains whatever
    /// is already queued and returns.
    fn event_loop(&mut self, mut ctx: Option<&mut TraceContext<'_>>, block: bool) {
        if self.detached {
            return;
        }
        if block {
            self.event_exit = false;
        }
        loop {
            if self.connection_lost {
                return;
            }
            let timeout = if block { POLL_SLICE } else { Duration::ZERO };
            match self.reader.try_poll_message(timeout) {
                Ok(Poll::Message(message)) => {
                    self.dispatch(message, ctx.as_deref_mut());
                    if block && self.event_exit {
                        return;
                    }
                }
                Ok(Poll::Timeout) => {
                    if !block {
                        return;
                    }
                }
                Ok(Poll::Closed) => {
                    debug!("controller closed the connection");
                    self.connection_lost = true;
                    return;
                }
                Err(error) => {
                    warn!(%error, "control channel failed");
                    self.connection_lost = true;
                    return;
                }
            }
        }
    }

    /// Handle one controller message. `ctx` is present while halted at a
    /// trace point; requests that need the halted stack are refused without
    /// it.
    fn dispatch(&mut self, message: Message, ctx: Option<&mut TraceContext<'_>>) {
        if message.procuuid != self.opts.procuuid {
            warn!(
                got = %message.procuuid,
                expected = %self.opts.procuuid,
                "message for a different process; ignoring"
            );
            return;
        }
        debug!(method = %message.method, "controller message");
        match &message.method {
            Method::Continue => {
                self.stepping = Stepping::Run;
                self.event_exit = true;
            }
            Method::Step => {
                self.stepping = Stepping::Step;
                self.event_exit = true;
            }
            Method::StepOver => {
                let depth = ctx.map_or(0, |ctx| ctx.depth());
                self.stepping = Stepping::StepOver { depth };
                self.event_exit = true;
            }
            Method::StepOut => {
                let depth = ctx.map_or(0, |ctx| ctx.depth());
                self.stepping = Stepping::StepOut { depth };
                self.event_exit = true;
            }
            Method::StepQuit | Method::Shutdown => {
                self.quit_requested = true;
                self.event_exit = true;
            }
            Method::MoveIp => {
                let Some(ctx) = ctx else {
                    warn!("moveIP while not halted; ignoring");
                    return;
                };
                match message.parse_params::<MoveIp>() {
                    Ok(params) => {
                        // The jump applies when execution resumes; report
                        // the new position now so the controller's view
                        // follows the request.
                        ctx.jump_to_line(params.line);
                        let filename = ctx.current().filename.clone();
                        self.send(
                            Method::Line,
                            &LineEvent {
                                filename,
                                line: params.line,
                            },
                        );
                    }
                    Err(error) => warn!(%error, "bad moveIP params"),
                }
            }
            Method::SetBreakpoint => match message.parse_params::<SetBreakpoint>() {
                Ok(params) => {
                    if let Err(error) = self.breakpoints.set(
                        &params.filename,
                        params.line,
                        params.temporary,
                        params.condition.as_deref(),
                    ) {
                        warn!(
                            %error,
                            filename = %params.filename,
                            line = params.line,
                            "breakpoint condition does not compile"
                        );
                        self.send(
                            Method::BreakpointConditionError,
                            &BreakpointConditionError {
                                filename: params.filename,
                                line: params.line,
                                message: error.to_string(),
                            },
                        );
                    }
                }
                Err(error) => warn!(%error, "bad setBP params"),
            },
            Method::ClearBreakpoint => match message.parse_params::<BreakpointRef>() {
                Ok(params) => {
                    if !self.breakpoints.clear(&params.filename, params.line) {
                        debug!(
                            filename = %params.filename,
                            line = params.line,
                            "clearBP for an unknown breakpoint"
                        );
                    }
                }
                Err(error) => warn!(%error, "bad clearBP params"),
            },
            Method::BreakpointEnable => match message.parse_params::<BreakpointEnable>() {
                Ok(params) => {
                    if !self
                        .breakpoints
                        .enable(&params.filename, params.line, params.enable)
                    {
                        debug!(
                            filename = %params.filename,
                            line = params.line,
                            "bpEnable for an unknown breakpoint"
                        );
                    }
                }
                Err(error) => warn!(%error, "bad bpEnable params"),
            },
            Method::BreakpointIgnore => match message.parse_params::<BreakpointIgnore>() {
                Ok(params) => {
                    if !self
                        .breakpoints
                        .set_ignore(&params.filename, params.line, params.count)
                    {
                        debug!(
                            filename = %params.filename,
                            line = params.line,
                            "bpIgnore for an unknown breakpoint"
                        );
                    }
                }
                Err(error) => warn!(%error, "bad bpIgnore params"),
            },
            Method::SetWatch => match message.parse_params::<SetWatch>() {
                Ok(params) => {
                    if let Err(error) = self.watches.set(&params.condition, params.temporary) {
                        warn!(%error, condition = %params.condition, "watch does not compile");
                        self.send(
                            Method::WatchConditionError,
                            &WatchConditionError {
                                condition: params.condition,
                                message: error.to_string(),
                            },
                        );
                    }
                }
                Err(error) => warn!(%error, "bad setWP params"),
            },
            Method::ClearWatch => match message.parse_params::<WatchRef>() {
                Ok(params) => {
                    if !self.watches.clear(&params.condition) {
                        debug!(condition = %params.condition, "clearWP for an unknown watch");
                    }
                }
                Err(error) => warn!(%error, "bad clearWP params"),
            },
            Method::WatchEnable => match message.parse_params::<WatchEnable>() {
                Ok(params) => {
                    if !self.watches.enable(&params.condition, params.enable) {
                        debug!(condition = %params.condition, "wpEnable for an unknown watch");
                    }
                }
                Err(error) => warn!(%error, "bad wpEnable params"),
            },
            Method::WatchIgnore => match message.parse_params::<WatchIgnore>() {
                Ok(params) => {
                    if !self.watches.set_ignore(&params.condition, params.count) {
                        debug!(condition = %params.condition, "wpIgnore for an unknown watch");
                    }
                }
                Err(error) => warn!(%error, "bad wpIgnore params"),
            },
            Method::SetFilter => match message.parse_params::<SetFilter>() {
                Ok(params) => self.filters.update(&params),
                Err(error) => warn!(%error, "bad setFilter params"),
            },
            Method::SetEnvironment => match message.parse_params::<SetEnvironment>() {
                Ok(params) => {
                    for (name, value) in &params.environment {
                        std::env::set_var(name, value);
                    }
                }
                Err(error) => warn!(%error, "bad setEnvironment params"),
            },
            Method::Variables => {
                let Some(ctx) = ctx else {
                    warn!("variables request while not halted; ignoring");
                    return;
                };
                match message.parse_params::<VariablesRequest>() {
                    Ok(params) => {
                        let variables = self.scope_variables(ctx, params.frame_number, params.scope);
                        self.send(
                            Method::Variables,
                            &VariablesReply {
                                frame_number: params.frame_number,
                                scope: params.scope,
                                variables,
                            },
                        );
                    }
                    Err(error) => warn!(%error, "bad variables params"),
                }
            }
            Method::Variable => {
                let Some(ctx) = ctx else {
                    warn!("variable request while not halted; ignoring");
                    return;
                };
                match message.parse_params::<VariableRequest>() {
                    Ok(params) => {
                        let variables = self.expand_variable(ctx, &params);
                        self.send(
                            Method::Variable,
                            &VariableReply {
                                var: params.var,
                                scope: params.scope,
                                variables,
                            },
                        );
                    }
                    Err(error) => warn!(%error, "bad variable params"),
                }
            }
            Method::ExecuteStatement => {
                match message.parse_params::<ExecuteStatement>() {
                    Ok(params) => match ctx {
                        Some(ctx) => self.execute_statement(ctx, &params),
                        None => self.send(
                            Method::ExecStatementError,
                            &OutputEvent {
                                text: "the script is not halted".to_owned(),
                            },
                        ),
                    },
                    Err(error) => warn!(%error, "bad executeStatement params"),
                }
            }
            Method::ThreadList => {
                let reply = ThreadListReply {
                    threads: vec![ThreadInfo {
                        id: MAIN_THREAD_ID,
                        name: "MainThread".to_owned(),
                        broken: self.halted,
                    }],
                    current_id: MAIN_THREAD_ID,
                };
                self.send(Method::ThreadList, &reply);
            }
            Method::ThreadSet => match message.parse_params::<ThreadSet>() {
                Ok(params) if params.thread_id == MAIN_THREAD_ID => {}
                Ok(params) => warn!(thread_id = params.thread_id, "threadSet for an unknown thread"),
                Err(error) => warn!(%error, "bad threadSet params"),
            },
            Method::CallTrace => match message.parse_params::<CallTraceToggle>() {
                Ok(params) => self.call_trace_enabled = params.enable,
                Err(error) => warn!(%error, "bad callTrace params"),
            },
            Method::ForkTo => match message.parse_params::<ForkToReply>() {
                Ok(params) => {
                    self.fork_answer = Some(params.target);
                    self.event_exit = true;
                }
                Err(error) => warn!(%error, "bad forkTo params"),
            },
            Method::Stdin => match message.parse_params::<StdinReply>() {
                Ok(params) => {
                    self.pending_stdin = Some(params.input);
                    self.event_exit = true;
                }
                Err(error) => warn!(%error, "bad stdin params"),
            },
            Method::PrologueContinue => {
                debug!("prologueContinue outside the handshake; ignoring");
            }
            Method::EpilogueExit => {
                debug!("epilogueExit outside the exit report; ignoring");
            }
            Method::Unknown(name) => {
                warn!(method = %name, "method not in this build's vocabulary; ignoring");
            }
            other => {
                debug!(method = %other, "unexpected method from the controller; ignoring");
            }
        }
    }

    fn scope_variables(
        &self,
        ctx: &TraceContext<'_>,
        frame_number: usize,
        scope: VarScope,
    ) -> Vec<VariableItem> {
        let frame = match scope {
            VarScope::Global => ctx.frames().first(),
            VarScope::Local => {
                if ctx.is_module_frame(frame_number) {
                    // Module-level locals are the globals; listing them as
                    // locals too would duplicate every entry.
                    return Vec::new();
                }
                ctx.frame_by_number(frame_number)
            }
        };
        match frame {
            Some(frame) => variables::render_scope(&frame.locals, scope, &self.filters),
            None => {
                warn!(frame_number, "variables request for a missing frame");
                Vec::new()
            }
        }
    }

    fn expand_variable(
        &self,
        ctx: &TraceContext<'_>,
        params: &VariableRequest,
    ) -> Vec<VariableItem> {
        let frame = match params.scope {
            VarScope::Global => ctx.frames().first(),
            VarScope::Local => ctx.frame_by_number(params.frame_number),
        };
        let Some(frame) = frame else {
            warn!(
                frame_number = params.frame_number,
                "variable request for a missing frame"
            );
            return Vec::new();
        };
        match variables::resolve_path(&frame.locals, &params.var) {
            Some(value) => variables::children_of(&value),
            None => {
                debug!(path = ?params.var, "variable path did not resolve");
                Vec::new()
            }
        }
    }

    /// Run controller-supplied statements in the halted frame and reply
    /// exactly once.
    fn execute_statement(&mut self, ctx: &mut TraceContext<'_>, params: &ExecuteStatement) {
        let outcome = execute::run_statement(ctx, params.frame_number, &params.statement);
        if let Some(code) = outcome.exit {
            self.send(
                Method::ExecStatementOutput,
                &OutputEvent {
                    text: outcome.output,
                },
            );
            self.exit_request = Some(code);
            self.event_exit = true;
            return;
        }
        match outcome.error {
            None => self.send(
                Method::ExecStatementOutput,
                &OutputEvent {
                    text: outcome.output,
                },
            ),
            Some(error) => {
                // Whatever printed before the failure still belongs to the
                // user; ship it in front of the error text.
                let mut text = outcome.output;
                if !text.is_empty() && !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&error);
                self.send(Method::ExecStatementError, &OutputEvent { text });
            }
        }
    }

    fn check_interrupts(&mut self) -> Result<(), Interrupt> {
        if let Some(code) = self.exit_request.take() {
            return Err(Interrupt::Exit(code));
        }
        if self.quit_requested || self.connection_lost {
            return Err(Interrupt::Quit);
        }
        Ok(())
    }

    /// Halt at the current statement and service the controller until a
    /// resume command arrives.
    fn break_here(&mut self, ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
        self.stepping = Stepping::Run;
        self.report_position(ctx);
        self.halted = true;
        self.event_loop(Some(ctx), true);
        self.halted = false;
        self.check_interrupts()
    }

    fn report_position(&mut self, ctx: &TraceContext<'_>) {
        let (event, stack) = {
            let frame = ctx.current();
            let event = LineEvent {
                filename: frame.filename.clone(),
                line: frame.line,
            };
            let stack: Vec<StackEntry> = ctx.frames().iter().rev().map(stack_entry).collect();
            (event, stack)
        };
        self.send(Method::Line, &event);
        self.send(Method::Stack, &StackEvent { stack });
    }

    fn report_signal(&mut self, signal: i32, ctx: &TraceContext<'_>) {
        debug!(signal = signal_name(signal), "reporting signal");
        let event = {
            let frame = ctx.current();
            SignalEvent {
                signal,
                filename: frame.filename.clone(),
                line: frame.line,
                function: frame.function.clone(),
            }
        };
        self.send(Method::Signal, &event);
    }
}

fn stack_entry(frame: &Frame) -> StackEntry {
    StackEntry {
        filename: frame.filename.clone(),
        line: frame.line,
        function: frame.function.clone(),
    }
}

impl Host for DebugClient {
    fn stdout(&mut self, text: &str) {
        if !self.opts.redirect || self.detached || self.connection_lost {
            DefaultHost.stdout(text);
            return;
        }
        self.send(
            Method::Stdout,
            &OutputEvent {
                text: text.to_owned(),
            },
        );
    }

    fn stderr(&mut self, text: &str) {
        if !self.opts.redirect || self.detached || self.connection_lost {
            DefaultHost.stderr(text);
            return;
        }
        self.send(
            Method::Stderr,
            &OutputEvent {
                text: text.to_owned(),
            },
        );
    }

    fn input(&mut self, prompt: &str) -> Result<String, HostError> {
        if !self.opts.redirect || self.detached || self.connection_lost {
            return DefaultHost.input(prompt);
        }
        self.send(
            Method::Stdin,
            &StdinRequest {
                prompt: prompt.to_owned(),
            },
        );
        self.event_loop(None, true);
        match self.pending_stdin.take() {
            Some(input) => Ok(input),
            // Quit or disconnect while waiting; hand back an empty line and
            // let the next trace point stop the script.
            None => Ok(String::new()),
        }
    }

    fn sleep(&mut self, millis: u64) {
        let mut remaining = Duration::from_millis(millis);
        while !remaining.is_zero() {
            if self.quit_requested || self.connection_lost || self.exit_request.is_some() {
                return;
            }
            let slice = remaining.min(SLEEP_SLICE);
            std::thread::sleep(slice);
            remaining -= slice;
            self.event_loop(None, false);
        }
    }

    fn fork(&mut self, context: ForkContext) -> Result<i64, HostError> {
        if self.detached {
            return fork::raw_fork();
        }
        let target = match self.opts.fork_policy.preset(context) {
            Some(target) => target,
            None => self.negotiate_fork(),
        };
        let result = fork::raw_fork()?;
        let in_child = result == 0;
        let followed = match target {
            ForkTarget::Child => in_child,
            ForkTarget::Parent => !in_child,
        };
        if !followed {
            // The other side keeps the conversation. This side must leave
            // the shared socket strictly alone, including not closing it.
            self.detached = true;
        }
        Ok(result)
    }

    fn wait_child(&mut self, pid: i64) -> Result<i64, HostError> {
        loop {
            if let Some(code) = fork::raw_try_wait(pid)? {
                return Ok(code);
            }
            if self.quit_requested || self.connection_lost {
                // The next trace point raises the quit; report the child as
                // not collected.
                return Ok(-1);
            }
            self.event_loop(None, false);
            std::thread::sleep(WAIT_POLL);
        }
    }

    fn on_line(&mut self, ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
        if self.detached {
            return self.check_interrupts();
        }
        self.event_loop(Some(ctx), false);
        self.check_interrupts()?;

        let (filename, line) = {
            let frame = ctx.current();
            (frame.filename.clone(), frame.line)
        };
        if !self.opts.trace_lib && filename == PRELUDE_FILENAME {
            return Ok(());
        }

        if let Some(signal) = self.signals.pending() {
            self.report_signal(signal, ctx);
            return self.break_here(ctx);
        }

        // Breakpoints come before stepping so that ignore counts and
        // temporaries advance on every pass over the line.
        if self.breakpoints.any_in_file(&filename) {
            let hit = self
                .breakpoints
                .check(&filename, line, |expr| match ctx.eval_in_frame(expr, 0) {
                    Ok(value) => {
                        if value.is_truthy() {
                            ConditionVerdict::True
                        } else {
                            ConditionVerdict::False
                        }
                    }
                    Err(error) => {
                        warn!(%error, "breakpoint condition failed; halting anyway");
                        ConditionVerdict::Error
                    }
                });
            if let Hit::Halt { cleared } = hit {
                if cleared {
                    self.send(
                        Method::ClearBreakpoint,
                        &BreakpointRef {
                            filename: filename.clone(),
                            line,
                        },
                    );
                }
                return self.break_here(ctx);
            }
        }

        if !self.watches.is_empty() {
            let hit = self.watches.check(|expr| match ctx.eval_in_frame(expr, 0) {
                Ok(value) => WatchObservation::Value {
                    truthy: value.is_truthy(),
                    rendered: value.repr(),
                },
                Err(_) => WatchObservation::Unevaluable,
            });
            if let Some(hit) = hit {
                if hit.cleared {
                    self.send(Method::ClearWatch, &WatchRef { condition: hit.raw });
                }
                return self.break_here(ctx);
            }
        }

        if stepping_halts(self.stepping, ctx.depth()) {
            return self.break_here(ctx);
        }
        Ok(())
    }

    fn on_call(&mut self, ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
        if self.detached || !self.call_trace_enabled {
            return Ok(());
        }
        let event = {
            let frames = ctx.frames();
            let [.., caller, callee] = frames else {
                return Ok(());
            };
            if !self.opts.trace_lib && callee.filename == PRELUDE_FILENAME {
                return Ok(());
            }
            CallTraceEvent {
                direction: CallTraceDirection::Call,
                from: stack_entry(caller),
                to: stack_entry(callee),
            }
        };
        self.send(Method::CallTrace, &event);
        Ok(())
    }

    fn on_return(&mut self, ctx: &mut TraceContext<'_>) -> Result<(), Interrupt> {
        if self.detached || !self.call_trace_enabled {
            return Ok(());
        }
        let event = {
            let frames = ctx.frames();
            let [.., caller, callee] = frames else {
                return Ok(());
            };
            if !self.opts.trace_lib && callee.filename == PRELUDE_FILENAME {
                return Ok(());
            }
            CallTraceEvent {
                direction: CallTraceDirection::Return,
                from: stack_entry(callee),
                to: stack_entry(caller),
            }
        };
        self.send(Method::CallTrace, &event);
        Ok(())
    }

    fn on_exception(
        &mut self,
        ctx: &mut TraceContext<'_>,
        error: &RuntimeError,
    ) -> Result<(), Interrupt> {
        if self.detached || !self.opts.exc_report {
            return Ok(());
        }
        let stack: Vec<StackEntry> = error
            .traceback
            .iter()
            .rev()
            .map(|entry| StackEntry {
                filename: entry.filename.clone(),
                line: entry.line,
                function: entry.function.clone(),
            })
            .collect();
        self.send(
            Method::Exception,
            &ExceptionEvent {
                kind: "RuntimeError".to_owned(),
                message: error.message.clone(),
                stack,
            },
        );
        self.halted = true;
        self.event_loop(Some(ctx), true);
        self.halted = false;
        self.check_interrupts()
    }
}

impl DebugClient {
    /// Ask the controller which side of a user fork to follow.
    fn negotiate_fork(&mut self) -> ForkTarget {
        self.fork_answer = None;
        self.send_empty(Method::ForkTo);
        self.event_loop(None, true);
        match self.fork_answer.take() {
            Some(target) => target,
            None => {
                warn!("no fork answer; following the parent");
                ForkTarget::Parent
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpListener, TcpStream};

    use serde_json::json;

    use super::*;

    const PROC: &str = "test-proc";

    fn connected_pair() -> (DebugClient, SocketReader, MessageWriter<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("binding a loopback listener");
        let addr = listener.local_addr().expect("listener address");
        let client_stream = TcpStream::connect(addr).expect("connecting");
        let (controller_stream, _) = listener.accept().expect("accepting");

        let reader = SocketReader::new(client_stream.try_clone().expect("cloning the stream"))
            .expect("client reader");
        let writer = MessageWriter::new(client_stream);
        let mut opts = ClientOptions::new("127.0.0.1", addr.port());
        opts.procuuid = PROC.to_owned();
        let client = DebugClient::new(Connection { reader, writer }, opts);

        let controller_reader =
            SocketReader::new(controller_stream.try_clone().expect("cloning the stream"))
                .expect("controller reader");
        let controller_writer = MessageWriter::new(controller_stream);
        (client, controller_reader, controller_writer)
    }

    #[test]
    fn stepping_rules() {
        assert!(!stepping_halts(Stepping::Run, 1));
        assert!(stepping_halts(Stepping::Step, 5));

        assert!(stepping_halts(Stepping::StepOver { depth: 2 }, 2));
        assert!(stepping_halts(Stepping::StepOver { depth: 2 }, 1));
        assert!(!stepping_halts(Stepping::StepOver { depth: 2 }, 3));

        assert!(stepping_halts(Stepping::StepOut { depth: 2 }, 1));
        assert!(!stepping_halts(Stepping::StepOut { depth: 2 }, 2));
        assert!(!stepping_halts(Stepping::StepOut { depth: 2 }, 3));
    }

    #[test]
    fn exit_report_happens_exactly_once() {
        let (mut client, mut ctrl_reader, mut ctrl_writer) = connected_pair();

        let controller = std::thread::spawn(move || {
            let message = ctrl_reader
                .poll_message()
                .expect("reading")
                .expect("an exit report");
            assert_eq!(message.method, Method::EpilogueExitCode);
            assert_eq!(message.params["exitCode"], 3);
            ctrl_writer
                .send(&Message::new(Method::EpilogueExit, PROC, json!({})))
                .expect("acknowledging");

            match ctrl_reader
                .try_poll_message(Duration::from_millis(200))
                .expect("polling for extra traffic")
            {
                Poll::Timeout | Poll::Closed => {}
                Poll::Message(extra) => panic!("second exit report: {extra:?}"),
            }
        });

        client.prog_terminated(3, "exit(3) called");
        client.prog_terminated(0, "");
        controller.join().expect("controller thread");
    }

    #[test]
    fn silent_controller_fails_the_handshake() {
        let (mut client, _ctrl_reader, _ctrl_writer) = connected_pair();
        client.opts.handshake_timeout = Duration::from_millis(200);

        let error = client
            .handshake(Path::new("/tmp/job.scr"))
            .expect_err("handshake should time out");
        assert!(matches!(error, ClientError::Handshake(_)));
    }

    #[test]
    fn unknown_method_is_a_logged_no_op() {
        let (mut client, mut ctrl_reader, _ctrl_writer) = connected_pair();

        let message = Message::new(Method::Unknown("framePoke".to_owned()), PROC, json!({}));
        client.dispatch(message, None);

        assert!(!client.quit_requested);
        assert!(!client.connection_lost);
        match ctrl_reader
            .try_poll_message(Duration::from_millis(100))
            .expect("polling")
        {
            Poll::Timeout => {}
            other => panic!("unexpected reply to an unknown method: {other:?}"),
        }
    }

    #[test]
    fn foreign_procuuid_is_ignored() {
        let (mut client, _ctrl_reader, _ctrl_writer) = connected_pair();

        client.dispatch(Message::new(Method::StepQuit, "someone-else", json!({})), None);
        assert!(!client.quit_requested);

        client.dispatch(Message::new(Method::StepQuit, PROC, json!({})), None);
        assert!(client.quit_requested);
    }

    #[test]
    fn bad_breakpoint_condition_is_reported() {
        let (mut client, mut ctrl_reader, _ctrl_writer) = connected_pair();

        let message = Message::with_params(
            Method::SetBreakpoint,
            PROC,
            &SetBreakpoint {
                filename: "a.scr".to_owned(),
                line: 3,
                temporary: false,
                condition: Some("x >".to_owned()),
            },
        )
        .expect("building");
        client.dispatch(message, None);

        let report = ctrl_reader
            .wait_for(&Method::BreakpointConditionError, Duration::from_secs(2))
            .expect("condition error report");
        assert_eq!(report.params["filename"], "a.scr");
        assert_eq!(report.params["line"], 3);
        assert!(client.breakpoints.is_empty());
    }

    #[test]
    fn detached_runtime_goes_quiet() {
        let (mut client, mut ctrl_reader, _ctrl_writer) = connected_pair();
        client.detached = true;
        client.opts.redirect = false;

        client.send(
            Method::Stderr,
            &OutputEvent {
                text: "ignored".to_owned(),
            },
        );
        match ctrl_reader
            .try_poll_message(Duration::from_millis(100))
            .expect("polling")
        {
            Poll::Timeout => {}
            other => panic!("a detached side wrote to the socket: {other:?}"),
        }
    }

    #[test]
    fn exec_exit_turns_into_an_interrupt() {
        let (mut client, _ctrl_reader, _ctrl_writer) = connected_pair();
        client.exit_request = Some(7);
        assert_eq!(client.check_interrupts(), Err(Interrupt::Exit(7)));
        // Consumed by the check.
        assert_eq!(client.check_interrupts(), Ok(()));
    }
}
