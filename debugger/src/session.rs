//! The controller-side session manager.
//!
//! [`SessionManager`] is the one entry point: it owns the control listener,
//! the session state machine, the breakpoint mirror and the dispatcher pair,
//! and it spawns a monitor thread per session to pump events off the socket.
//! Callers drive it from any thread; all session state lives behind one lock.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use retry::delay::Exponential;
use retry::retry;
use serde::Serialize;
use serde_json::json;
use transport::params::{
    BreakpointEnable, BreakpointIgnore, BreakpointRef, CallTraceToggle, ExecuteStatement,
    ForkTarget, MoveIp, OutputEvent, SetBreakpoint, SetEnvironment, SetFilter, SetWatch,
    StackEntry, StackEvent, StdinReply, ThreadInfo, ThreadListReply, ThreadSet, VarScope,
    VariableReply, VariableRequest, VariablesReply, VariablesRequest, WatchEnable, WatchIgnore,
    WatchRef,
};
use transport::{Message, MessageWriter, Method};
use uuid::Uuid;

use crate::config::ManagerConfig;
use crate::dispatcher::{DebugEvent, EventDispatcher, EventFilter};
use crate::error::SessionError;
use crate::listener::{ClaimedDebuggee, ControlListener, DebuggeeInfo};
use crate::monitor::{self, MonitorCommand};
use crate::pending::PendingReplies;
use crate::persistence::{BreakpointRecord, BreakpointStore};
use crate::proxy::BreakpointProxy;
use crate::spawn::{LaunchOptions, SpawnedDebuggee};
use crate::state::{ServerInfo, SessionState};

/// What a controller-driven statement produced in the debuggee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementOutcome {
    /// Collected stdout/stderr of the statement.
    Output(String),
    /// A formatted error report; the session stays healthy.
    Error(String),
}

/// Everything guarded by the session lock.
pub(crate) struct SessionInternals {
    pub(crate) state: SessionState,
    pub(crate) server_info: Option<ServerInfo>,
    pub(crate) procuuid: String,
    pub(crate) writer: Option<MessageWriter<TcpStream>>,
    pub(crate) debuggee: Option<SpawnedDebuggee>,
    pub(crate) monitor: Option<JoinHandle<()>>,
    pub(crate) monitor_tx: Option<crossbeam_channel::Sender<MonitorCommand>>,
    pub(crate) frame_index: usize,
    pub(crate) stack_depth: usize,
    pub(crate) thread_id: Option<u64>,
    pub(crate) live_stack: Vec<StackEntry>,
    pub(crate) exception_stack: Vec<StackEntry>,
    pub(crate) threads: Vec<ThreadInfo>,
    pub(crate) filters: SetFilter,
    pub(crate) fork_answer: ForkTarget,
    pub(crate) exit_reported: bool,
    pub(crate) pending: PendingReplies,
    pub(crate) dispatcher: Arc<EventDispatcher>,
    pub(crate) proxy: Arc<BreakpointProxy>,
}

impl SessionInternals {
    fn new(
        filters: SetFilter,
        dispatcher: Arc<EventDispatcher>,
        proxy: Arc<BreakpointProxy>,
    ) -> Self {
        Self {
            state: SessionState::Detached,
            server_info: None,
            procuuid: String::new(),
            writer: None,
            debuggee: None,
            monitor: None,
            monitor_tx: None,
            frame_index: 0,
            stack_depth: 0,
            thread_id: None,
            live_stack: Vec::new(),
            exception_stack: Vec::new(),
            threads: Vec::new(),
            filters,
            fork_answer: ForkTarget::Parent,
            exit_reported: false,
            pending: PendingReplies::new(),
            dispatcher,
            proxy,
        }
    }

    pub(crate) fn fire(&self, event: DebugEvent) {
        self.dispatcher.fire_event(&event);
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = %self.state, to = %state, "session state change");
        self.state = state;
        self.fire(DebugEvent::from(&state));
    }

    pub(crate) fn ensure_attached(&self) -> Result<(), SessionError> {
        if self.writer.is_none() {
            return Err(SessionError::NotAttached);
        }
        Ok(())
    }

    pub(crate) fn ensure_broken(&self) -> Result<(), SessionError> {
        self.ensure_attached()?;
        if !self.state.accepts_inspection() {
            return Err(SessionError::DebuggerNotBroken);
        }
        Ok(())
    }

    pub(crate) fn send(
        &mut self,
        method: Method,
        params: serde_json::Value,
    ) -> Result<(), SessionError> {
        let procuuid = self.procuuid.clone();
        let writer = self.writer.as_mut().ok_or(SessionError::NotAttached)?;
        writer.send_command(method, &procuuid, params)?;
        Ok(())
    }

    pub(crate) fn send_params<T: Serialize>(
        &mut self,
        method: Method,
        params: &T,
    ) -> Result<(), SessionError> {
        let procuuid = self.procuuid.clone();
        let writer = self.writer.as_mut().ok_or(SessionError::NotAttached)?;
        let message = Message::with_params(method, procuuid, params)?;
        writer.send(&message)?;
        Ok(())
    }

    /// Drop every per-session resource and land in `Detached`.
    ///
    /// Idempotent; both the monitor and the facade may race to call it.
    pub(crate) fn teardown(&mut self) {
        self.writer = None;
        self.debuggee = None;
        self.pending.clear();
        self.live_stack.clear();
        self.exception_stack.clear();
        self.threads.clear();
        self.thread_id = None;
        self.frame_index = 0;
        self.stack_depth = 0;
        self.server_info = None;
        self.procuuid.clear();
        self.set_state(SessionState::Detached);
    }
}

/// Drives debug sessions: spawning or adopting debuggees, forwarding
/// commands, and fanning out their events.
pub struct SessionManager {
    config: ManagerConfig,
    listener: ControlListener,
    proxy: Arc<BreakpointProxy>,
    dispatcher: Arc<EventDispatcher>,
    internals: Arc<Mutex<SessionInternals>>,
    events_rx: crossbeam_channel::Receiver<DebugEvent>,
    store: Option<BreakpointStore>,
}

impl SessionManager {
    /// Bind the control listener and set up the dispatcher chain.
    pub fn new(config: ManagerConfig) -> Result<Self, SessionError> {
        let listener = ControlListener::bind(
            &config.listen_host,
            config.listen_port,
            config.announce_timeout(),
        )?;

        // Internal bookkeeping sees every event before UI listeners do.
        let internal = Arc::new(EventDispatcher::new());
        let dispatcher = Arc::new(EventDispatcher::new());
        internal.set_chain(Arc::clone(&dispatcher));

        let proxy = Arc::new(BreakpointProxy::new());
        proxy.subscribe(&internal);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        dispatcher.register(EventFilter::all(), false, move |event| {
            let _ = events_tx.send(event.clone());
        });

        let internals = Arc::new(Mutex::new(SessionInternals::new(
            config.filters.clone(),
            Arc::clone(&internal),
            Arc::clone(&proxy),
        )));

        internal.fire_event(&DebugEvent::StateChange(SessionState::Detached));

        Ok(Self {
            config,
            listener,
            proxy,
            dispatcher,
            internals,
            events_rx,
            store: BreakpointStore::open_default(),
        })
    }

    /// Use a specific breakpoint store instead of the platform default.
    pub fn use_store(&mut self, store: BreakpointStore) {
        self.store = Some(store);
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Port debuggees should dial.
    pub fn port(&self) -> u16 {
        self.listener.port()
    }

    /// Announced debuggees waiting to be adopted.
    pub fn scan(&self) -> Vec<DebuggeeInfo> {
        self.listener.scan()
    }

    /// The UI-facing dispatcher; register here for typed callbacks.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// A channel view of the event stream.
    ///
    /// Clones share one stream: each event reaches exactly one receiver.
    /// For independent subscriptions register on [`dispatcher`] instead.
    ///
    /// [`dispatcher`]: SessionManager::dispatcher
    pub fn events(&self) -> crossbeam_channel::Receiver<DebugEvent> {
        self.events_rx.clone()
    }

    /// Block until an event matches the predicate.
    pub fn wait_for_event<F>(&self, pred: F) -> DebugEvent
    where
        F: Fn(&DebugEvent) -> bool,
    {
        let mut n = 0;
        loop {
            let event = self.events_rx.recv().expect("event stream ended");
            if pred(&event) {
                tracing::debug!(?event, "received expected event");
                return event;
            }
            tracing::trace!(?event, "non-matching event");
            n += 1;
            if n >= 100 {
                panic!("did not receive expected event");
            }
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle

    /// Spawn a script under the debug client and adopt it.
    #[tracing::instrument(skip(self, options), fields(script = %options.script.display()))]
    pub fn launch(&self, options: &LaunchOptions) -> Result<ServerInfo, SessionError> {
        self.with_internals(|i| {
            if i.state != SessionState::Detached {
                return Err(SessionError::AlreadyAttached);
            }
            i.set_state(SessionState::Spawning);
            Ok(())
        })?;
        match self.launch_inner(options) {
            Ok(info) => Ok(info),
            Err(e) => {
                self.abort_bring_up();
                Err(e)
            }
        }
    }

    fn launch_inner(&self, options: &LaunchOptions) -> Result<ServerInfo, SessionError> {
        let rid = Uuid::new_v4().to_string();
        let password = Uuid::new_v4().to_string();

        let spawned =
            SpawnedDebuggee::spawn(&self.config, self.port(), &rid, &password, options)?;
        tracing::debug!(pid = spawned.pid(), "debuggee spawned, waiting for its announcement");

        let scale = Exponential::from_millis(self.config.spawn_retry_base_ms)
            .take(self.config.spawn_retry_attempts);
        let claimed = retry(scale, || {
            tracing::debug!("scanning for the spawned debuggee");
            self.listener.claim(&rid).ok_or(SessionError::SpawnTimeout)
        })
        .map_err(|_| SessionError::SpawnTimeout)?;

        match claimed.info.auth.as_deref() {
            Some(token) if token == password => {}
            _ => return Err(SessionError::AuthFailed),
        }
        if claimed.info.version != env!("CARGO_PKG_VERSION") {
            return Err(SessionError::AttachFailed(format!(
                "the client speaks protocol {} but this controller speaks {}",
                claimed.info.version,
                env!("CARGO_PKG_VERSION"),
            )));
        }

        let info = self.adopt(claimed, Some(spawned))?;
        self.wait_until_running(self.config.startup_timeout())
            .map_err(|_| SessionError::SpawnTimeout)?;
        Ok(info)
    }

    /// Adopt an already-announced debuggee.
    ///
    /// A numeric key matches by pid, anything else by filename substring.
    /// With several matches the first announced one wins, with a warning.
    #[tracing::instrument(skip(self))]
    pub fn attach(&self, key: &str) -> Result<ServerInfo, SessionError> {
        self.with_internals(|i| {
            if i.state != SessionState::Detached {
                return Err(SessionError::AlreadyAttached);
            }
            i.set_state(SessionState::Attaching);
            Ok(())
        })?;
        match self.attach_inner(key) {
            Ok(info) => Ok(info),
            Err(e) => {
                self.abort_bring_up();
                Err(e)
            }
        }
    }

    fn attach_inner(&self, key: &str) -> Result<ServerInfo, SessionError> {
        let candidates = self.listener.scan();
        let matched = resolve_attach_key(key, &candidates);
        if matched.is_empty() {
            return Err(SessionError::AttachFailed(format!(
                "no announced debuggee matches {key:?}"
            )));
        }
        if matched.len() > 1 {
            tracing::warn!(
                key,
                count = matched.len(),
                "multiple debuggees match, trying in announcement order"
            );
        }

        let mut chosen = None;
        for candidate in &matched {
            if candidate.version != env!("CARGO_PKG_VERSION") {
                tracing::warn!(
                    pid = candidate.pid,
                    version = %candidate.version,
                    "skipping debuggee with a protocol version mismatch"
                );
                continue;
            }
            chosen = Some(*candidate);
            break;
        }
        let target = chosen.ok_or_else(|| {
            SessionError::AttachFailed(
                "every matching debuggee speaks a different protocol version".to_owned(),
            )
        })?;

        let claimed = self.listener.claim(&target.procuuid).ok_or_else(|| {
            SessionError::AttachFailed("the debuggee disappeared before it could be claimed".to_owned())
        })?;
        let info = self.adopt(claimed, None)?;
        self.wait_until_running(self.config.startup_timeout())
            .map_err(|_| {
                SessionError::AttachFailed("the debuggee never reached its startup hold".to_owned())
            })?;
        Ok(info)
    }

    /// Release the handshake hold and start the monitor thread.
    fn adopt(
        &self,
        claimed: ClaimedDebuggee,
        spawned: Option<SpawnedDebuggee>,
    ) -> Result<ServerInfo, SessionError> {
        let ClaimedDebuggee {
            info,
            reader,
            mut writer,
        } = claimed;

        writer.send_command(Method::PrologueContinue, &info.procuuid, json!({}))?;
        let server_info = ServerInfo::from(&info);

        let (monitor_tx, monitor_rx) = crossbeam_channel::unbounded();
        // Commit the connection before the monitor runs, so the first
        // messages it pulls are matched against the right session.
        let committed = server_info.clone();
        self.with_internals(move |i| {
            i.procuuid = committed.procuuid.clone();
            i.server_info = Some(committed);
            i.writer = Some(writer);
            i.exit_reported = false;
            i.debuggee = spawned;
            i.monitor_tx = Some(monitor_tx);
            Ok(())
        })?;

        let internals = Arc::clone(&self.internals);
        let poll_interval = self.config.poll_interval();
        let idle_floor = self.config.idle_floor();
        let handle = std::thread::Builder::new()
            .name("debug-monitor".to_owned())
            .spawn(move || monitor::run(reader, internals, monitor_rx, poll_interval, idle_floor))?;
        self.with_internals(move |i| {
            i.monitor = Some(handle);
            Ok(())
        })?;

        Ok(server_info)
    }

    /// Ask the debuggee to shut down and wait for its exit report.
    #[tracing::instrument(skip(self))]
    pub fn detach(&self) -> Result<(), SessionError> {
        self.with_internals(|i| {
            if i.state == SessionState::Detached {
                return Err(SessionError::NotAttached);
            }
            i.set_state(SessionState::Detaching);
            if let Err(e) = i.send(Method::Shutdown, json!({})) {
                tracing::warn!(error = %e, "could not send shutdown, forcing detach");
            }
            Ok(())
        })?;

        // The monitor lands in Detached once the exit report is in; force
        // the issue if the debuggee never reports.
        if self
            .wait_for_detached(self.config.detach_timeout())
            .is_err()
        {
            tracing::warn!("debuggee did not report its exit in time, forcing detach");
            self.with_internals(|i| {
                i.exit_reported = true;
                i.teardown();
                Ok(())
            })?;
        }
        self.stop_monitor()
    }

    /// The "get out" path: stop the debuggee and detach without waiting for
    /// any acknowledgment.
    #[tracing::instrument(skip(self))]
    pub fn stop_debuggee(&self) -> Result<(), SessionError> {
        let was_active = self.with_internals(|i| {
            if i.state == SessionState::Detached {
                return Ok(false);
            }
            if i.writer.is_some() {
                if let Err(e) = i.send(Method::Shutdown, json!({})) {
                    tracing::warn!(error = %e, "could not send shutdown, forcing detach");
                }
            }
            i.exit_reported = true;
            i.teardown();
            Ok(true)
        })?;
        if was_active {
            self.stop_monitor()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Execution control

    /// Resume free running.
    pub fn request_go(&self) -> Result<(), SessionError> {
        self.resume(Method::Continue)
    }

    /// Execute one line, stepping into calls.
    pub fn request_step(&self) -> Result<(), SessionError> {
        self.resume(Method::Step)
    }

    /// Execute one line, stepping over calls.
    pub fn request_step_over(&self) -> Result<(), SessionError> {
        self.resume(Method::StepOver)
    }

    /// Run until the current function returns.
    pub fn request_step_out(&self) -> Result<(), SessionError> {
        self.resume(Method::StepOut)
    }

    fn resume(&self, method: Method) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.ensure_broken()?;
            i.send(method, json!({}))?;
            i.frame_index = 0;
            i.set_state(SessionState::Attached);
            Ok(())
        })
    }

    /// Move the instruction pointer within the halted frame. The debuggee
    /// stays halted; the skipped statements never run.
    pub fn request_jump(&self, line: u32) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.ensure_broken()?;
            i.send_params(Method::MoveIp, &MoveIp { line })
        })
    }

    // ------------------------------------------------------------------
    // Breakpoints and watches

    pub fn set_breakpoint(
        &self,
        filename: &str,
        line: u32,
        temporary: bool,
        condition: Option<&str>,
    ) -> Result<(), SessionError> {
        self.proxy.record_set(filename, line, temporary, condition);
        self.forward(
            Method::SetBreakpoint,
            &SetBreakpoint {
                filename: filename.to_owned(),
                line,
                temporary,
                condition: condition.map(str::to_owned),
            },
        )
    }

    pub fn clear_breakpoint(&self, filename: &str, line: u32) -> Result<(), SessionError> {
        self.proxy.record_clear(filename, line);
        self.forward(
            Method::ClearBreakpoint,
            &BreakpointRef {
                filename: filename.to_owned(),
                line,
            },
        )
    }

    pub fn enable_breakpoint(
        &self,
        filename: &str,
        line: u32,
        enable: bool,
    ) -> Result<(), SessionError> {
        self.proxy.record_enable(filename, line, enable);
        self.forward(
            Method::BreakpointEnable,
            &BreakpointEnable {
                filename: filename.to_owned(),
                line,
                enable,
            },
        )
    }

    pub fn ignore_breakpoint(
        &self,
        filename: &str,
        line: u32,
        count: u32,
    ) -> Result<(), SessionError> {
        self.proxy.record_ignore(filename, line, count);
        self.forward(
            Method::BreakpointIgnore,
            &BreakpointIgnore {
                filename: filename.to_owned(),
                line,
                count,
            },
        )
    }

    pub fn set_watch(&self, condition: &str, temporary: bool) -> Result<(), SessionError> {
        self.proxy.record_watch(condition, temporary);
        self.forward(
            Method::SetWatch,
            &SetWatch {
                condition: condition.to_owned(),
                temporary,
            },
        )
    }

    pub fn clear_watch(&self, condition: &str) -> Result<(), SessionError> {
        self.proxy.record_clear_watch(condition);
        self.forward(
            Method::ClearWatch,
            &WatchRef {
                condition: condition.to_owned(),
            },
        )
    }

    pub fn enable_watch(&self, condition: &str, enable: bool) -> Result<(), SessionError> {
        self.proxy.record_watch_enable(condition, enable);
        self.forward(
            Method::WatchEnable,
            &WatchEnable {
                condition: condition.to_owned(),
                enable,
            },
        )
    }

    pub fn ignore_watch(&self, condition: &str, count: u32) -> Result<(), SessionError> {
        self.proxy.record_watch_ignore(condition, count);
        self.forward(
            Method::WatchIgnore,
            &WatchIgnore {
                condition: condition.to_owned(),
                count,
            },
        )
    }

    /// The local breakpoint/watch mirror.
    pub fn proxy(&self) -> &Arc<BreakpointProxy> {
        &self.proxy
    }

    // ------------------------------------------------------------------
    // Inspection

    /// List one scope of one frame of the halted stack.
    pub fn get_variables(
        &self,
        frame_number: usize,
        scope: VarScope,
    ) -> Result<VariablesReply, SessionError> {
        let reply = self.request_reply(
            Method::Variables,
            &VariablesRequest {
                frame_number,
                scope,
            },
            Method::Variables,
        )?;
        Ok(reply.parse_params()?)
    }

    /// Expand one container variable a single level.
    pub fn get_variable(
        &self,
        var: Vec<String>,
        frame_number: usize,
        scope: VarScope,
    ) -> Result<VariableReply, SessionError> {
        let reply = self.request_reply(
            Method::Variable,
            &VariableRequest {
                var,
                frame_number,
                scope,
            },
            Method::Variable,
        )?;
        Ok(reply.parse_params()?)
    }

    pub fn thread_list(&self) -> Result<ThreadListReply, SessionError> {
        let reply = self.request_reply(Method::ThreadList, &json!({}), Method::ThreadList)?;
        Ok(reply.parse_params()?)
    }

    pub fn set_thread(&self, thread_id: u64) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.ensure_broken()?;
            i.send_params(Method::ThreadSet, &ThreadSet { thread_id })?;
            i.thread_id = Some(thread_id);
            Ok(())
        })
    }

    /// Run a statement in the selected halted frame and wait for what it
    /// produced.
    #[tracing::instrument(skip(self))]
    pub fn execute_statement(
        &self,
        statement: &str,
        frame_number: usize,
    ) -> Result<StatementOutcome, SessionError> {
        let (output_rx, error_rx) = self.with_internals(|i| {
            i.ensure_broken()?;
            let output_rx = i.pending.add(Method::ExecStatementOutput)?;
            let error_rx = match i.pending.add(Method::ExecStatementError) {
                Ok(rx) => rx,
                Err(e) => {
                    i.pending.discard(&Method::ExecStatementOutput);
                    return Err(e);
                }
            };
            let params = ExecuteStatement {
                statement: statement.to_owned(),
                frame_number,
            };
            if let Err(e) = i.send_params(Method::ExecuteStatement, &params) {
                i.pending.discard(&Method::ExecStatementOutput);
                i.pending.discard(&Method::ExecStatementError);
                return Err(e);
            }
            Ok((output_rx, error_rx))
        })?;

        // The debuggee answers with exactly one of the two methods.
        let deadline = Instant::now() + self.config.reply_timeout();
        loop {
            match output_rx.try_recv() {
                Ok(message) => {
                    self.drop_pending(&Method::ExecStatementError);
                    let output: OutputEvent = message.parse_params()?;
                    return Ok(StatementOutcome::Output(output.text));
                }
                Err(oneshot::TryRecvError::Empty) => {}
                Err(oneshot::TryRecvError::Disconnected) => return Err(SessionError::NotAttached),
            }
            match error_rx.try_recv() {
                Ok(message) => {
                    self.drop_pending(&Method::ExecStatementOutput);
                    let output: OutputEvent = message.parse_params()?;
                    return Ok(StatementOutcome::Error(output.text));
                }
                Err(oneshot::TryRecvError::Empty) => {}
                Err(oneshot::TryRecvError::Disconnected) => return Err(SessionError::NotAttached),
            }
            if Instant::now() >= deadline {
                self.drop_pending(&Method::ExecStatementOutput);
                self.drop_pending(&Method::ExecStatementError);
                return Err(SessionError::WaitTimeout {
                    what: "a statement reply".to_owned(),
                });
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    // ------------------------------------------------------------------
    // Session-wide toggles

    /// Store the visibility filters and push them if a session is live.
    pub fn set_filter(&self, filter: SetFilter) -> Result<(), SessionError> {
        self.with_internals(|i| {
            if i.writer.is_some() {
                i.send_params(Method::SetFilter, &filter)?;
            }
            i.filters = filter;
            Ok(())
        })
    }

    pub fn set_environment(
        &self,
        environment: BTreeMap<String, String>,
    ) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.ensure_attached()?;
            i.send_params(Method::SetEnvironment, &SetEnvironment { environment })
        })
    }

    pub fn set_call_trace(&self, enable: bool) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.ensure_attached()?;
            i.send_params(Method::CallTrace, &CallTraceToggle { enable })
        })
    }

    /// Which side of a fork future queries should follow.
    pub fn set_fork_mode(&self, target: ForkTarget) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.fork_answer = target;
            Ok(())
        })
    }

    /// Answer a pending `stdin` request from the debuggee.
    pub fn send_stdin(&self, input: &str) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.ensure_attached()?;
            i.send_params(
                Method::Stdin,
                &StdinReply {
                    input: input.to_owned(),
                },
            )
        })
    }

    /// Switch stack inspection between the live stack and the exception
    /// stack. Only allowed while halted.
    pub fn set_analyze(&self, on: bool) -> Result<(), SessionError> {
        self.with_internals(|i| {
            if on {
                if i.state != SessionState::Broken {
                    return Err(SessionError::DebuggerNotBroken);
                }
                i.set_state(SessionState::Analyze);
                let stack = i.exception_stack.clone();
                i.fire(DebugEvent::Stack(StackEvent {
                    stack: stack.clone(),
                }));
                i.fire(DebugEvent::StackDepth(stack.len()));
            } else {
                if i.state != SessionState::Analyze {
                    return Err(SessionError::DebuggerNotBroken);
                }
                i.set_state(SessionState::Broken);
                let stack = i.live_stack.clone();
                i.fire(DebugEvent::Stack(StackEvent {
                    stack: stack.clone(),
                }));
                i.fire(DebugEvent::StackDepth(stack.len()));
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // State access

    pub fn state(&self) -> Result<SessionState, SessionError> {
        self.with_internals(|i| Ok(i.state))
    }

    pub fn server_info(&self) -> Result<Option<ServerInfo>, SessionError> {
        self.with_internals(|i| Ok(i.server_info.clone()))
    }

    /// The stack inspection currently targets: the exception stack in
    /// analyze mode, the live stack otherwise.
    pub fn current_stack(&self) -> Result<Vec<StackEntry>, SessionError> {
        self.with_internals(|i| {
            Ok(match i.state {
                SessionState::Analyze => i.exception_stack.clone(),
                _ => i.live_stack.clone(),
            })
        })
    }

    /// Latest thread list reported by the debuggee.
    pub fn threads(&self) -> Result<Vec<ThreadInfo>, SessionError> {
        self.with_internals(|i| Ok(i.threads.clone()))
    }

    pub fn current_frame(&self) -> Result<usize, SessionError> {
        self.with_internals(|i| Ok(i.frame_index))
    }

    /// Select the stack frame later inspection calls refer to.
    pub fn set_current_frame(&self, index: usize) -> Result<(), SessionError> {
        self.with_internals(|i| {
            i.ensure_broken()?;
            if i.stack_depth > 0 && index >= i.stack_depth {
                tracing::warn!(index, depth = i.stack_depth, "frame index beyond the stack");
            }
            i.frame_index = index;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Breakpoint persistence

    /// Restore saved breakpoints for a script into the mirror (and the
    /// debuggee, if one is attached). Returns how many were restored.
    pub fn load_breakpoints(&self, script: &Path) -> Result<usize, SessionError> {
        let Some(store) = &self.store else {
            tracing::debug!("no breakpoint store on this platform");
            return Ok(0);
        };
        let records = store.load(script)?;
        for record in records.values() {
            self.set_breakpoint(
                &record.filename,
                record.line,
                false,
                record.condition.as_deref(),
            )?;
            if !record.enabled {
                self.enable_breakpoint(&record.filename, record.line, false)?;
            }
        }
        Ok(records.len())
    }

    /// Save the mirrored breakpoints for a script.
    pub fn save_breakpoints(&self, script: &Path) -> Result<(), SessionError> {
        let Some(store) = &self.store else {
            tracing::debug!("no breakpoint store on this platform");
            return Ok(());
        };
        let records: BTreeMap<u64, BreakpointRecord> = self
            .proxy
            .breakpoints()
            .iter()
            .enumerate()
            .map(|(index, bp)| (index as u64 + 1, BreakpointRecord::from(bp)))
            .collect();
        store.save(script, &records)
    }

    // ------------------------------------------------------------------
    // Environment probes

    /// Loopback listen/connect/echo probe, to tell local firewall
    /// interference apart from a debuggee that failed to start.
    pub fn test_firewall(timeout: Duration) -> Result<(), SessionError> {
        const PROBE: [u8; 1] = [b'#'];

        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let addr = listener.local_addr()?;
        let mut client = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| SessionError::FirewallBlocked(format!("loopback connect failed: {e}")))?;
        client.set_write_timeout(Some(timeout))?;
        client.set_read_timeout(Some(timeout))?;
        client
            .write_all(&PROBE)
            .map_err(|e| SessionError::FirewallBlocked(format!("loopback send failed: {e}")))?;

        let (mut served, _) = listener
            .accept()
            .map_err(|e| SessionError::FirewallBlocked(format!("loopback accept failed: {e}")))?;
        served.set_read_timeout(Some(timeout))?;
        served.set_write_timeout(Some(timeout))?;
        let mut buffer = [0u8; 1];
        served
            .read_exact(&mut buffer)
            .map_err(|e| SessionError::FirewallBlocked(format!("loopback receive failed: {e}")))?;
        served
            .write_all(&buffer)
            .map_err(|e| SessionError::FirewallBlocked(format!("loopback reply failed: {e}")))?;
        client
            .read_exact(&mut buffer)
            .map_err(|e| SessionError::FirewallBlocked(format!("loopback echo failed: {e}")))?;
        if buffer != PROBE {
            return Err(SessionError::FirewallBlocked(
                "loopback probe corrupted".to_owned(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plumbing

    fn with_internals<T>(
        &self,
        f: impl FnOnce(&mut SessionInternals) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let mut internals = self
            .internals
            .lock()
            .map_err(|_| SessionError::LockPoisoned)?;
        f(&mut internals)
    }

    /// Send when attached; otherwise the mirror alone carries the change
    /// until the next session broadcast.
    fn forward<T: Serialize>(&self, method: Method, params: &T) -> Result<(), SessionError> {
        self.with_internals(|i| {
            if i.writer.is_some() {
                i.send_params(method, params)?;
            }
            Ok(())
        })
    }

    fn request_reply<T: Serialize>(
        &self,
        method: Method,
        params: &T,
        reply: Method,
    ) -> Result<Message, SessionError> {
        let rx = self.with_internals(|i| {
            i.ensure_broken()?;
            let rx = i.pending.add(reply.clone())?;
            if let Err(e) = i.send_params(method, params) {
                i.pending.discard(&reply);
                return Err(e);
            }
            Ok(rx)
        })?;
        match rx.recv_timeout(self.config.reply_timeout()) {
            Ok(message) => Ok(message),
            Err(oneshot::RecvTimeoutError::Timeout) => {
                self.drop_pending(&reply);
                Err(SessionError::WaitTimeout {
                    what: format!("a {reply} reply"),
                })
            }
            Err(oneshot::RecvTimeoutError::Disconnected) => Err(SessionError::NotAttached),
        }
    }

    fn drop_pending(&self, method: &Method) {
        let _ = self.with_internals(|i| {
            i.pending.discard(method);
            Ok(())
        });
    }

    /// Undo a partial bring-up: drop the spawned child and any adopted
    /// connection, and return to `Detached`.
    fn abort_bring_up(&self) {
        let _ = self.with_internals(|i| {
            i.exit_reported = true;
            i.teardown();
            Ok(())
        });
        let _ = self.stop_monitor();
    }

    fn stop_monitor(&self) -> Result<(), SessionError> {
        let (tx, handle) =
            self.with_internals(|i| Ok((i.monitor_tx.take(), i.monitor.take())))?;
        if let Some(tx) = tx {
            let _ = tx.send(MonitorCommand::Shutdown);
        }
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Wait for the session to come up; a halt right out of the gate (a
    /// breakpoint on the first line) counts as up.
    fn wait_until_running(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state()? {
                SessionState::Attached | SessionState::Broken | SessionState::Analyze => {
                    return Ok(())
                }
                SessionState::Detached => {
                    return Err(SessionError::AttachFailed(
                        "the session ended while waiting".to_owned(),
                    ))
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(SessionError::WaitTimeout {
                    what: "the debuggee to start".to_owned(),
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn wait_for_detached(&self, timeout: Duration) -> Result<(), SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state()? == SessionState::Detached {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SessionError::WaitTimeout {
                    what: "the exit report".to_owned(),
                });
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        tracing::debug!("dropping session manager");
        if let Err(e) = self.stop_debuggee() {
            tracing::warn!(error = %e, "could not stop the debuggee during drop");
        }
    }
}

/// Resolve an attach key against announced debuggees: numeric keys match by
/// pid, anything else by filename substring.
pub(crate) fn resolve_attach_key<'a>(
    key: &str,
    candidates: &'a [DebuggeeInfo],
) -> Vec<&'a DebuggeeInfo> {
    if let Ok(pid) = key.parse::<i32>() {
        candidates.iter().filter(|c| c.pid == pid).collect()
    } else {
        candidates
            .iter()
            .filter(|c| c.filename.contains(key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(pid: i32, filename: &str, procuuid: &str) -> DebuggeeInfo {
        DebuggeeInfo {
            pid,
            module: "job".to_owned(),
            filename: filename.to_owned(),
            procuuid: procuuid.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            auth: None,
        }
    }

    fn test_manager() -> SessionManager {
        let config = ManagerConfig {
            listen_port: 0,
            ..ManagerConfig::default()
        };
        SessionManager::new(config).expect("binding a session manager")
    }

    #[test]
    fn numeric_keys_resolve_by_pid() {
        let candidates = vec![
            candidate(100, "/tmp/one.scr", "p-1"),
            candidate(200, "/tmp/two.scr", "p-2"),
        ];
        let matched = resolve_attach_key("200", &candidates);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].procuuid, "p-2");
    }

    #[test]
    fn text_keys_resolve_by_filename_substring() {
        let candidates = vec![
            candidate(100, "/tmp/alpha/job.scr", "p-1"),
            candidate(200, "/tmp/beta/job.scr", "p-2"),
            candidate(300, "/tmp/other.scr", "p-3"),
        ];
        let matched = resolve_attach_key("job.scr", &candidates);
        assert_eq!(matched.len(), 2);
        let matched = resolve_attach_key("beta", &candidates);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].pid, 200);
    }

    #[test]
    fn an_unknown_key_matches_nothing() {
        let candidates = vec![candidate(100, "/tmp/one.scr", "p-1")];
        assert!(resolve_attach_key("999", &candidates).is_empty());
        assert!(resolve_attach_key("missing", &candidates).is_empty());
    }

    #[test]
    fn the_loopback_probe_passes_on_a_healthy_host() {
        SessionManager::test_firewall(Duration::from_secs(2)).expect("loopback probe");
    }

    #[test]
    fn commands_require_a_session() {
        let manager = test_manager();
        assert!(matches!(
            manager.request_go(),
            Err(SessionError::NotAttached)
        ));
        assert!(matches!(
            manager.get_variables(0, VarScope::Global),
            Err(SessionError::NotAttached)
        ));
        assert!(matches!(
            manager.detach(),
            Err(SessionError::NotAttached)
        ));
        assert!(matches!(
            manager.set_analyze(true),
            Err(SessionError::DebuggerNotBroken)
        ));
    }

    #[test]
    fn construction_reports_the_detached_state() {
        let manager = test_manager();
        let events = manager.events();
        assert_eq!(
            events.recv_timeout(Duration::from_secs(1)).expect("initial event"),
            DebugEvent::StateChange(SessionState::Detached)
        );
    }

    #[test]
    fn breakpoints_set_while_detached_live_in_the_mirror() {
        let manager = test_manager();
        manager
            .set_breakpoint("/tmp/job.scr", 3, false, Some("x > 1"))
            .expect("setting breakpoint");
        manager.set_watch("x > 5", false).expect("setting watch");

        let mirrored = manager.proxy().breakpoints();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].condition.as_deref(), Some("x > 1"));
        assert_eq!(manager.proxy().watches().len(), 1);
    }
}
