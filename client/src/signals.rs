//! Async-signal observation for the debugged process.
//!
//! Handlers only set a per-signal flag; the trace hook picks the flag up at
//! the next statement boundary and reports a halt from there. Nothing
//! protocol-related happens in signal context.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::signal::{SIGABRT, SIGINT, SIGTERM};

pub const WATCHED_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGABRT];

/// Installed signal flags, one per watched signal.
#[derive(Debug, Default)]
pub struct SignalWatch {
    flags: Vec<(i32, Arc<AtomicBool>)>,
}

impl SignalWatch {
    /// Register handlers for every watched signal.
    pub fn install() -> io::Result<Self> {
        let mut flags = Vec::with_capacity(WATCHED_SIGNALS.len());
        for &signal in &WATCHED_SIGNALS {
            let flag = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register(signal, Arc::clone(&flag))?;
            flags.push((signal, flag));
        }
        Ok(Self { flags })
    }

    /// A watch that never reports anything; used when signal reporting is
    /// turned off.
    pub fn disarmed() -> Self {
        Self::default()
    }

    /// Take one pending signal, clearing its flag.
    pub fn pending(&self) -> Option<i32> {
        self.flags
            .iter()
            .find(|(_, flag)| flag.swap(false, Ordering::Relaxed))
            .map(|(signal, _)| *signal)
    }
}

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGABRT => "SIGABRT",
        _ => "unknown signal",
    }
}
