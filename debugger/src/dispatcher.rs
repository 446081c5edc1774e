//! Fan-out of typed session events to registered callbacks.
//!
//! The protocol layer never talks to a UI directly: the monitor thread turns
//! wire messages into [`DebugEvent`]s and fires them here. Dispatchers can be
//! chained, so internal bookkeeping (the breakpoint mirror, state caches)
//! sees every event before it continues on to UI-facing listeners.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use transport::params::{
    BreakpointConditionError, BreakpointRef, CallTraceEvent, ExceptionEvent, ForkTarget,
    LineEvent, SignalEvent, StackEvent, SyntaxErrorEvent, ThreadListReply, VariableReply,
    VariablesReply, WatchConditionError,
};

use crate::state::SessionState;

/// Everything a session can report, decoded into protocol payload types.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    StateChange(SessionState),
    /// The debuggee halted at this location.
    Line(LineEvent),
    Stack(StackEvent),
    StackDepth(usize),
    Exception(ExceptionEvent),
    SyntaxError(SyntaxErrorEvent),
    ThreadList(ThreadListReply),
    Variables(VariablesReply),
    Variable(VariableReply),
    /// The debuggee finished. `code` is `None` when the connection died
    /// before an exit report arrived.
    Exit { code: Option<i64>, message: String },
    Signal(SignalEvent),
    /// User definitions that shadow built-in names, reported at startup.
    Conflicts(Vec<String>),
    /// A fork query was answered; the session follows this side.
    ForkSwitch(ForkTarget),
    CallTrace(CallTraceEvent),
    Stdout(String),
    Stderr(String),
    /// The debuggee dropped a breakpoint on its own (a temporary one hit).
    BreakpointCleared(BreakpointRef),
    BreakpointConditionError(BreakpointConditionError),
    WatchConditionError(WatchConditionError),
    StatementOutput(String),
    StatementError(String),
    /// The debuggee wants one line of user input.
    StdinRequested(String),
}

impl DebugEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DebugEvent::StateChange(_) => EventKind::StateChange,
            DebugEvent::Line(_) => EventKind::Line,
            DebugEvent::Stack(_) => EventKind::Stack,
            DebugEvent::StackDepth(_) => EventKind::StackDepth,
            DebugEvent::Exception(_) => EventKind::Exception,
            DebugEvent::SyntaxError(_) => EventKind::SyntaxError,
            DebugEvent::ThreadList(_) => EventKind::ThreadList,
            DebugEvent::Variables(_) => EventKind::Variables,
            DebugEvent::Variable(_) => EventKind::Variable,
            DebugEvent::Exit { .. } => EventKind::Exit,
            DebugEvent::Signal(_) => EventKind::Signal,
            DebugEvent::Conflicts(_) => EventKind::Conflicts,
            DebugEvent::ForkSwitch(_) => EventKind::ForkSwitch,
            DebugEvent::CallTrace(_) => EventKind::CallTrace,
            DebugEvent::Stdout(_) => EventKind::Stdout,
            DebugEvent::Stderr(_) => EventKind::Stderr,
            DebugEvent::BreakpointCleared(_) => EventKind::BreakpointCleared,
            DebugEvent::BreakpointConditionError(_) => EventKind::BreakpointConditionError,
            DebugEvent::WatchConditionError(_) => EventKind::WatchConditionError,
            DebugEvent::StatementOutput(_) => EventKind::StatementOutput,
            DebugEvent::StatementError(_) => EventKind::StatementError,
            DebugEvent::StdinRequested(_) => EventKind::StdinRequested,
        }
    }
}

/// Payload-free discriminant of [`DebugEvent`], used in filters and chain
/// overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StateChange,
    Line,
    Stack,
    StackDepth,
    Exception,
    SyntaxError,
    ThreadList,
    Variables,
    Variable,
    Exit,
    Signal,
    Conflicts,
    ForkSwitch,
    CallTrace,
    Stdout,
    Stderr,
    BreakpointCleared,
    BreakpointConditionError,
    WatchConditionError,
    StatementOutput,
    StatementError,
    StdinRequested,
}

/// Which event kinds a registration wants to see.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    // None admits everything.
    kinds: Option<HashSet<EventKind>>,
}

impl EventFilter {
    /// Admit every event.
    pub fn all() -> Self {
        Self { kinds: None }
    }

    /// Admit only the given kinds.
    pub fn only<I: IntoIterator<Item = EventKind>>(kinds: I) -> Self {
        Self {
            kinds: Some(kinds.into_iter().collect()),
        }
    }

    pub fn admits(&self, kind: EventKind) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

/// Handle for removing a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Box<dyn FnMut(&DebugEvent) + Send>;

struct Registration {
    id: CallbackId,
    filter: EventFilter,
    single_use: bool,
    callback: Callback,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    registrations: Vec<Registration>,
    chain: Option<Arc<EventDispatcher>>,
    overrides: HashSet<EventKind>,
}

/// Delivers events to registered callbacks, in registration order.
///
/// Delivery is single threaded: the monitor thread is the only producer, and
/// callbacks run on it. A callback must not call back into the dispatcher or
/// the session manager; hand work that needs either to another thread.
#[derive(Default)]
pub struct EventDispatcher {
    inner: Mutex<Inner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for the events the filter admits.
    ///
    /// A `single_use` registration is dropped after its first delivery.
    pub fn register(
        &self,
        filter: EventFilter,
        single_use: bool,
        callback: impl FnMut(&DebugEvent) + Send + 'static,
    ) -> CallbackId {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.next_id += 1;
        let id = CallbackId(inner.next_id);
        inner.registrations.push(Registration {
            id,
            filter,
            single_use,
            callback: Box::new(callback),
        });
        id
    }

    /// Drop a registration. Returns whether it was still present.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = inner.registrations.len();
        inner.registrations.retain(|r| r.id != id);
        inner.registrations.len() != before
    }

    /// Forward events to a downstream dispatcher after local delivery.
    pub fn set_chain(&self, downstream: Arc<EventDispatcher>) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.chain = Some(downstream);
    }

    /// Stop the given kinds at this dispatcher instead of forwarding them
    /// down the chain.
    pub fn override_chain<I: IntoIterator<Item = EventKind>>(&self, kinds: I) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.overrides.extend(kinds);
    }

    /// Deliver one event to every admitting registration, then forward it
    /// down the chain unless its kind is overridden here.
    pub fn fire_event(&self, event: &DebugEvent) {
        let kind = event.kind();
        let chain = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut spent = Vec::new();
            for registration in inner.registrations.iter_mut() {
                if registration.filter.admits(kind) {
                    (registration.callback)(event);
                    if registration.single_use {
                        spent.push(registration.id);
                    }
                }
            }
            if !spent.is_empty() {
                inner.registrations.retain(|r| !spent.contains(&r.id));
            }
            if inner.overrides.contains(&kind) {
                None
            } else {
                inner.chain.clone()
            }
        };
        if let Some(downstream) = chain {
            downstream.fire_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn line_event(line: u32) -> DebugEvent {
        DebugEvent::Line(LineEvent {
            filename: "job.scr".to_owned(),
            line,
        })
    }

    #[test]
    fn filters_select_events_by_kind() {
        let dispatcher = EventDispatcher::new();
        let (tx, rx) = mpsc::channel();
        dispatcher.register(EventFilter::only([EventKind::Line]), false, move |event| {
            let _ = tx.send(event.clone());
        });

        dispatcher.fire_event(&DebugEvent::Stdout("noise".to_owned()));
        dispatcher.fire_event(&line_event(3));

        assert_eq!(rx.try_recv().expect("one delivery"), line_event(3));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn single_use_registrations_fire_once() {
        let dispatcher = EventDispatcher::new();
        let (tx, rx) = mpsc::channel();
        dispatcher.register(EventFilter::all(), true, move |event| {
            let _ = tx.send(event.clone());
        });

        dispatcher.fire_event(&line_event(1));
        dispatcher.fire_event(&line_event(2));

        assert_eq!(rx.try_recv().expect("first delivery"), line_event(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn a_single_use_registration_survives_filtered_events() {
        let dispatcher = EventDispatcher::new();
        let (tx, rx) = mpsc::channel();
        dispatcher.register(EventFilter::only([EventKind::Exit]), true, move |event| {
            let _ = tx.send(event.clone());
        });

        // Not admitted, so the registration must not be consumed.
        dispatcher.fire_event(&line_event(1));
        dispatcher.fire_event(&DebugEvent::Exit {
            code: Some(0),
            message: String::new(),
        });

        assert!(matches!(
            rx.try_recv().expect("delivery"),
            DebugEvent::Exit { code: Some(0), .. }
        ));
    }

    #[test]
    fn removed_registrations_stop_receiving() {
        let dispatcher = EventDispatcher::new();
        let (tx, rx) = mpsc::channel();
        let id = dispatcher.register(EventFilter::all(), false, move |event| {
            let _ = tx.send(event.clone());
        });

        dispatcher.fire_event(&line_event(1));
        assert!(dispatcher.remove(id));
        assert!(!dispatcher.remove(id));
        dispatcher.fire_event(&line_event(2));

        assert_eq!(rx.try_recv().expect("first delivery"), line_event(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn chained_dispatchers_see_events_after_the_upstream() {
        let upstream = EventDispatcher::new();
        let downstream = Arc::new(EventDispatcher::new());
        upstream.set_chain(Arc::clone(&downstream));

        let (tx, rx) = mpsc::channel();
        let up_tx = tx.clone();
        upstream.register(EventFilter::all(), false, move |_| {
            let _ = up_tx.send("upstream");
        });
        downstream.register(EventFilter::all(), false, move |_| {
            let _ = tx.send("downstream");
        });

        upstream.fire_event(&line_event(1));
        assert_eq!(rx.try_recv().expect("upstream first"), "upstream");
        assert_eq!(rx.try_recv().expect("then downstream"), "downstream");
    }

    #[test]
    fn overridden_kinds_stop_at_the_upstream_dispatcher() {
        let upstream = EventDispatcher::new();
        let downstream = Arc::new(EventDispatcher::new());
        upstream.set_chain(Arc::clone(&downstream));
        upstream.override_chain([EventKind::BreakpointCleared]);

        let (tx, rx) = mpsc::channel();
        downstream.register(EventFilter::all(), false, move |event| {
            let _ = tx.send(event.clone());
        });

        upstream.fire_event(&DebugEvent::BreakpointCleared(BreakpointRef {
            filename: "job.scr".to_owned(),
            line: 3,
        }));
        upstream.fire_event(&line_event(5));

        // Only the non-overridden event reaches the downstream listeners.
        assert_eq!(rx.try_recv().expect("line forwarded"), line_event(5));
        assert!(rx.try_recv().is_err());
    }
}
