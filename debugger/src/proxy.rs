//! Local mirror of the debuggee's breakpoint and watch tables.
//!
//! Commands update the mirror before they go over the wire, and a chained
//! dispatcher registration keeps it honest when the debuggee changes its own
//! table (a temporary breakpoint hitting, a condition failing to compile).
//! The mirror has its own lock so UI threads can read it while the monitor
//! thread is mid-delivery.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::dispatcher::{CallbackId, DebugEvent, EventDispatcher, EventFilter, EventKind};

/// One breakpoint as the debuggee should currently know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredBreakpoint {
    pub filename: String,
    pub line: u32,
    pub temporary: bool,
    pub condition: Option<String>,
    pub enabled: bool,
    pub ignore_count: u32,
}

/// One watch expression as the debuggee should currently know it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredWatch {
    pub condition: String,
    pub temporary: bool,
    pub enabled: bool,
    pub ignore_count: u32,
}

#[derive(Default)]
struct Tables {
    breakpoints: BTreeMap<(String, u32), MirroredBreakpoint>,
    watches: BTreeMap<String, MirroredWatch>,
}

/// The mirror. Breakpoints are keyed by `(filename, line)`, watches by their
/// condition text, matching the identities the protocol uses.
#[derive(Default)]
pub struct BreakpointProxy {
    tables: Mutex<Tables>,
}

impl BreakpointProxy {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert or replace the breakpoint at a location.
    pub fn record_set(
        &self,
        filename: &str,
        line: u32,
        temporary: bool,
        condition: Option<&str>,
    ) {
        self.lock().breakpoints.insert(
            (filename.to_owned(), line),
            MirroredBreakpoint {
                filename: filename.to_owned(),
                line,
                temporary,
                condition: condition.map(str::to_owned),
                enabled: true,
                ignore_count: 0,
            },
        );
    }

    /// Remove the breakpoint at a location. Returns whether one was there.
    pub fn record_clear(&self, filename: &str, line: u32) -> bool {
        self.lock()
            .breakpoints
            .remove(&(filename.to_owned(), line))
            .is_some()
    }

    pub fn record_enable(&self, filename: &str, line: u32, enable: bool) {
        if let Some(bp) = self
            .lock()
            .breakpoints
            .get_mut(&(filename.to_owned(), line))
        {
            bp.enabled = enable;
        }
    }

    pub fn record_ignore(&self, filename: &str, line: u32, count: u32) {
        if let Some(bp) = self
            .lock()
            .breakpoints
            .get_mut(&(filename.to_owned(), line))
        {
            bp.ignore_count = count;
        }
    }

    /// Insert or replace a watch expression.
    pub fn record_watch(&self, condition: &str, temporary: bool) {
        self.lock().watches.insert(
            condition.to_owned(),
            MirroredWatch {
                condition: condition.to_owned(),
                temporary,
                enabled: true,
                ignore_count: 0,
            },
        );
    }

    pub fn record_clear_watch(&self, condition: &str) -> bool {
        self.lock().watches.remove(condition).is_some()
    }

    pub fn record_watch_enable(&self, condition: &str, enable: bool) {
        if let Some(watch) = self.lock().watches.get_mut(condition) {
            watch.enabled = enable;
        }
    }

    pub fn record_watch_ignore(&self, condition: &str, count: u32) {
        if let Some(watch) = self.lock().watches.get_mut(condition) {
            watch.ignore_count = count;
        }
    }

    /// Snapshot of every mirrored breakpoint, ordered by location.
    pub fn breakpoints(&self) -> Vec<MirroredBreakpoint> {
        self.lock().breakpoints.values().cloned().collect()
    }

    /// Snapshot of the mirrored breakpoints in one file.
    pub fn breakpoints_for(&self, filename: &str) -> Vec<MirroredBreakpoint> {
        self.lock()
            .breakpoints
            .values()
            .filter(|bp| bp.filename == filename)
            .cloned()
            .collect()
    }

    pub fn lookup(&self, filename: &str, line: u32) -> Option<MirroredBreakpoint> {
        self.lock()
            .breakpoints
            .get(&(filename.to_owned(), line))
            .cloned()
    }

    /// Snapshot of every mirrored watch, ordered by condition.
    pub fn watches(&self) -> Vec<MirroredWatch> {
        self.lock().watches.values().cloned().collect()
    }

    pub fn clear_all(&self) {
        let mut tables = self.lock();
        tables.breakpoints.clear();
        tables.watches.clear();
    }

    /// Keep the mirror in sync with debuggee-driven changes, via a chained
    /// registration on the internal dispatcher.
    pub fn subscribe(self: &Arc<Self>, dispatcher: &EventDispatcher) -> CallbackId {
        let proxy = Arc::clone(self);
        dispatcher.register(
            EventFilter::only([
                EventKind::BreakpointCleared,
                EventKind::BreakpointConditionError,
                EventKind::WatchConditionError,
            ]),
            false,
            move |event| match event {
                DebugEvent::BreakpointCleared(bp) => {
                    proxy.record_clear(&bp.filename, bp.line);
                }
                // A rejected condition means the debuggee never installed
                // the entry, so the mirror drops it too.
                DebugEvent::BreakpointConditionError(error) => {
                    proxy.record_clear(&error.filename, error.line);
                }
                DebugEvent::WatchConditionError(error) => {
                    proxy.record_clear_watch(&error.condition);
                }
                _ => {}
            },
        )
    }
}
