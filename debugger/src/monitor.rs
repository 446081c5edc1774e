//! The per-session monitor thread.
//!
//! Each adopted debuggee gets one thread that pumps messages off the control
//! socket, updates the session bookkeeping, resolves request rendezvous, and
//! fires dispatcher events. The thread ends when the debuggee reports its
//! exit, when the connection drops, or when the facade asks it to stop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use transport::params::{
    BreakpointConditionError, BreakpointEnable, BreakpointIgnore, BreakpointRef, CallTraceEvent,
    DebugStartup, EpilogueExitCode, ExceptionEvent, ForkToReply, LineEvent, OutputEvent,
    SetBreakpoint, SetFilter, SetWatch, SignalEvent, StackEvent, StdinRequest, SyntaxErrorEvent,
    ThreadListReply, VariableReply, VariablesReply, WatchConditionError, WatchEnable, WatchIgnore,
};
use transport::{CodecError, Message, Method, Poll, SocketReader};

use crate::dispatcher::DebugEvent;
use crate::session::SessionInternals;
use crate::state::SessionState;

/// Facade-to-monitor control messages.
#[derive(Debug)]
pub(crate) enum MonitorCommand {
    Shutdown,
}

/// Pump the session socket until the session ends.
pub(crate) fn run(
    mut reader: SocketReader,
    internals: Arc<Mutex<SessionInternals>>,
    commands: crossbeam_channel::Receiver<MonitorCommand>,
    poll_interval: Duration,
    idle_floor: Duration,
) {
    loop {
        let mut worked = false;
        match reader.try_poll_message(poll_interval) {
            Ok(Poll::Message(message)) => {
                worked = true;
                let session_over = match internals.lock() {
                    Ok(mut internals) => internals.on_message(&message),
                    Err(_) => {
                        tracing::error!("session lock poisoned, stopping the monitor");
                        break;
                    }
                };
                if session_over {
                    break;
                }
            }
            Ok(Poll::Timeout) => {}
            Ok(Poll::Closed) => {
                tracing::debug!("control connection closed");
                disconnect(&internals);
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not read from the control connection");
                disconnect(&internals);
                break;
            }
        }

        match commands.try_recv() {
            Ok(MonitorCommand::Shutdown)
            | Err(crossbeam_channel::TryRecvError::Disconnected) => {
                tracing::debug!("monitor asked to stop");
                break;
            }
            Err(crossbeam_channel::TryRecvError::Empty) => {}
        }

        // Keeps a stream of sub-interval wakeups from turning into a busy
        // loop.
        if !worked && !idle_floor.is_zero() {
            std::thread::sleep(idle_floor);
        }
    }
    tracing::debug!("monitor thread terminated");
}

fn disconnect(internals: &Arc<Mutex<SessionInternals>>) {
    match internals.lock() {
        Ok(mut internals) => internals.on_disconnect(),
        Err(_) => tracing::error!("session lock poisoned during disconnect"),
    }
}

fn warn_undecodable(message: &Message, error: &CodecError) {
    tracing::warn!(
        method = %message.method,
        error = %error,
        "could not decode message params, ignoring"
    );
}

impl SessionInternals {
    /// Handle one inbound message. Returns whether the session is over.
    pub(crate) fn on_message(&mut self, message: &Message) -> bool {
        if message.procuuid != self.procuuid {
            tracing::warn!(
                method = %message.method,
                procuuid = %message.procuuid,
                "message for a different session, ignoring"
            );
            return false;
        }

        let mut session_over = false;
        match &message.method {
            Method::DebugStartup => match message.parse_params::<DebugStartup>() {
                Ok(startup) => {
                    tracing::debug!(filename = %startup.filename, "debuggee held at startup");
                    self.broadcast_setup();
                    if let Err(e) = self.send(Method::Continue, json!({})) {
                        tracing::warn!(error = %e, "could not release the startup hold");
                    }
                    self.set_state(SessionState::Attached);
                    if !startup.conflicts.is_empty() {
                        self.fire(DebugEvent::Conflicts(startup.conflicts));
                    }
                }
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Line => match message.parse_params::<LineEvent>() {
                Ok(event) => {
                    tracing::debug!(
                        filename = %event.filename,
                        line = event.line,
                        "debuggee halted"
                    );
                    self.frame_index = 0;
                    self.set_state(SessionState::Broken);
                    self.fire(DebugEvent::Line(event));
                }
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Stack => match message.parse_params::<StackEvent>() {
                Ok(event) => {
                    let depth = event.stack.len();
                    self.live_stack = event.stack.clone();
                    self.stack_depth = depth;
                    self.fire(DebugEvent::Stack(event));
                    self.fire(DebugEvent::StackDepth(depth));
                }
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Exception => match message.parse_params::<ExceptionEvent>() {
                Ok(event) => {
                    tracing::debug!(kind = %event.kind, "debuggee halted on an exception");
                    self.exception_stack = event.stack.clone();
                    self.frame_index = 0;
                    self.set_state(SessionState::Broken);
                    self.fire(DebugEvent::Exception(event));
                }
                Err(e) => warn_undecodable(message, &e),
            },
            Method::SyntaxError => match message.parse_params::<SyntaxErrorEvent>() {
                Ok(event) => self.fire(DebugEvent::SyntaxError(event)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Stdout => match message.parse_params::<OutputEvent>() {
                Ok(event) => self.fire(DebugEvent::Stdout(event.text)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Stderr => match message.parse_params::<OutputEvent>() {
                Ok(event) => self.fire(DebugEvent::Stderr(event.text)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Stdin => match message.parse_params::<StdinRequest>() {
                Ok(request) => self.fire(DebugEvent::StdinRequested(request.prompt)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Variables => match message.parse_params::<VariablesReply>() {
                Ok(reply) => self.fire(DebugEvent::Variables(reply)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Variable => match message.parse_params::<VariableReply>() {
                Ok(reply) => self.fire(DebugEvent::Variable(reply)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::ThreadList => match message.parse_params::<ThreadListReply>() {
                Ok(reply) => {
                    self.threads = reply.threads.clone();
                    self.thread_id = Some(reply.current_id);
                    self.fire(DebugEvent::ThreadList(reply));
                }
                Err(e) => warn_undecodable(message, &e),
            },
            Method::ForkTo => {
                // The debuggee is blocked in its fork until this answer.
                let target = self.fork_answer;
                tracing::debug!(?target, "answering fork query");
                if let Err(e) = self.send_params(Method::ForkTo, &ForkToReply { target }) {
                    tracing::warn!(error = %e, "could not answer the fork query");
                }
                self.fire(DebugEvent::ForkSwitch(target));
            }
            Method::CallTrace => match message.parse_params::<CallTraceEvent>() {
                Ok(event) => self.fire(DebugEvent::CallTrace(event)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Signal => match message.parse_params::<SignalEvent>() {
                Ok(event) => self.fire(DebugEvent::Signal(event)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::ClearBreakpoint => match message.parse_params::<BreakpointRef>() {
                Ok(reference) => self.fire(DebugEvent::BreakpointCleared(reference)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::BreakpointConditionError => {
                match message.parse_params::<BreakpointConditionError>() {
                    Ok(report) => self.fire(DebugEvent::BreakpointConditionError(report)),
                    Err(e) => warn_undecodable(message, &e),
                }
            }
            Method::WatchConditionError => match message.parse_params::<WatchConditionError>() {
                Ok(report) => self.fire(DebugEvent::WatchConditionError(report)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::ExecStatementOutput => match message.parse_params::<OutputEvent>() {
                Ok(event) => self.fire(DebugEvent::StatementOutput(event.text)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::ExecStatementError => match message.parse_params::<OutputEvent>() {
                Ok(event) => self.fire(DebugEvent::StatementError(event.text)),
                Err(e) => warn_undecodable(message, &e),
            },
            Method::EpilogueExitCode => match message.parse_params::<EpilogueExitCode>() {
                Ok(report) => {
                    tracing::debug!(exit_code = report.exit_code, "debuggee reported its exit");
                    // Acknowledge first: the debuggee holds its process open
                    // until this lands.
                    if let Err(e) = self.send(Method::EpilogueExit, json!({})) {
                        tracing::warn!(error = %e, "could not acknowledge the exit report");
                    }
                    self.exit_reported = true;
                    self.fire(DebugEvent::Exit {
                        code: Some(report.exit_code),
                        message: report.message,
                    });
                    self.teardown();
                    session_over = true;
                }
                Err(e) => warn_undecodable(message, &e),
            },
            Method::Unknown(name) => {
                tracing::warn!(method = %name, "unrecognized method, ignoring");
            }
            other => {
                tracing::debug!(method = %other, "unexpected method on an established session");
            }
        }

        if self.pending.resolve(message) {
            tracing::trace!(method = %message.method, "reply delivered to its waiter");
        }
        session_over
    }

    /// The connection died without an exit report.
    pub(crate) fn on_disconnect(&mut self) {
        if !self.exit_reported {
            self.exit_reported = true;
            self.fire(DebugEvent::Exit {
                code: None,
                message: "connection to the debuggee was lost".to_owned(),
            });
        }
        self.teardown();
    }

    /// Push the mirrored breakpoints, watches and filters into a freshly
    /// held debuggee.
    fn broadcast_setup(&mut self) {
        let breakpoints = self.proxy.breakpoints();
        let watches = self.proxy.watches();
        tracing::debug!(
            breakpoints = breakpoints.len(),
            watches = watches.len(),
            "pushing mirrored state to the debuggee"
        );

        for bp in breakpoints {
            let set = SetBreakpoint {
                filename: bp.filename.clone(),
                line: bp.line,
                temporary: bp.temporary,
                condition: bp.condition.clone(),
            };
            if let Err(e) = self.send_params(Method::SetBreakpoint, &set) {
                tracing::warn!(error = %e, "could not push a breakpoint");
                return;
            }
            if !bp.enabled {
                let enable = BreakpointEnable {
                    filename: bp.filename.clone(),
                    line: bp.line,
                    enable: false,
                };
                if let Err(e) = self.send_params(Method::BreakpointEnable, &enable) {
                    tracing::warn!(error = %e, "could not push a breakpoint state");
                    return;
                }
            }
            if bp.ignore_count > 0 {
                let ignore = BreakpointIgnore {
                    filename: bp.filename,
                    line: bp.line,
                    count: bp.ignore_count,
                };
                if let Err(e) = self.send_params(Method::BreakpointIgnore, &ignore) {
                    tracing::warn!(error = %e, "could not push an ignore count");
                    return;
                }
            }
        }

        for watch in watches {
            let set = SetWatch {
                condition: watch.condition.clone(),
                temporary: watch.temporary,
            };
            if let Err(e) = self.send_params(Method::SetWatch, &set) {
                tracing::warn!(error = %e, "could not push a watch");
                return;
            }
            if !watch.enabled {
                let enable = WatchEnable {
                    condition: watch.condition.clone(),
                    enable: false,
                };
                if let Err(e) = self.send_params(Method::WatchEnable, &enable) {
                    tracing::warn!(error = %e, "could not push a watch state");
                    return;
                }
            }
            if watch.ignore_count > 0 {
                let ignore = WatchIgnore {
                    condition: watch.condition,
                    count: watch.ignore_count,
                };
                if let Err(e) = self.send_params(Method::WatchIgnore, &ignore) {
                    tracing::warn!(error = %e, "could not push a watch ignore count");
                    return;
                }
            }
        }

        if self.filters != SetFilter::default() {
            let filters = self.filters.clone();
            if let Err(e) = self.send_params(Method::SetFilter, &filters) {
                tracing::warn!(error = %e, "could not push the variable filters");
            }
        }
    }
}
