//! Accepting debuggee connections and tracking announced processes.
//!
//! Debuggees dial in and announce themselves with `procIDInfo`. The accept
//! thread parks each announced connection in a registry until a session
//! claims it, which is what makes both `launch` (claim by the generated id)
//! and `attach` (claim by pid or filename) work over one listener.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use transport::params::ProcIdInfo;
use transport::{MessageWriter, Method, SocketReader};

use crate::error::SessionError;

/// A debuggee that has announced itself and is waiting to be claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggeeInfo {
    pub pid: i32,
    pub module: String,
    pub filename: String,
    pub procuuid: String,
    pub version: String,
    pub auth: Option<String>,
}

impl DebuggeeInfo {
    fn from_announcement(procuuid: &str, info: &ProcIdInfo) -> Self {
        Self {
            pid: info.pid,
            module: info.module.clone(),
            filename: info.filename.clone(),
            procuuid: procuuid.to_owned(),
            version: info.version.clone(),
            auth: info.auth.clone(),
        }
    }
}

/// An announced connection handed over to a session.
pub(crate) struct ClaimedDebuggee {
    pub(crate) info: DebuggeeInfo,
    pub(crate) reader: SocketReader,
    pub(crate) writer: MessageWriter<TcpStream>,
}

struct PendingDebuggee {
    info: DebuggeeInfo,
    reader: SocketReader,
    writer: MessageWriter<TcpStream>,
    announced: Instant,
}

type Registry = Arc<Mutex<Vec<PendingDebuggee>>>;

/// Bound TCP listener plus the accept thread feeding the registry.
pub struct ControlListener {
    port: u16,
    registry: Registry,
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl ControlListener {
    /// Bind and start accepting. Port 0 picks an ephemeral port; `port()`
    /// reports the effective one either way.
    pub fn bind(host: &str, port: u16, announce_timeout: Duration) -> Result<Self, SessionError> {
        let listener = TcpListener::bind((host, port))?;
        let port = listener.local_addr()?.port();
        tracing::debug!(host, port, "control listener bound");

        let registry: Registry = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_registry = Arc::clone(&registry);
        let thread_stop = Arc::clone(&stop);
        let accept_thread = std::thread::Builder::new()
            .name("debug-accept".to_owned())
            .spawn(move || accept_loop(listener, thread_registry, thread_stop, announce_timeout))?;

        Ok(Self {
            port,
            registry,
            stop,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Announced-but-unclaimed debuggees, oldest first.
    pub fn scan(&self) -> Vec<DebuggeeInfo> {
        self.lock_registry()
            .iter()
            .map(|pending| pending.info.clone())
            .collect()
    }

    /// Take an announced debuggee out of the registry.
    pub(crate) fn claim(&self, procuuid: &str) -> Option<ClaimedDebuggee> {
        let mut registry = self.lock_registry();
        let index = registry
            .iter()
            .position(|pending| pending.info.procuuid == procuuid)?;
        let pending = registry.remove(index);
        tracing::debug!(
            procuuid,
            pid = pending.info.pid,
            waited = ?pending.announced.elapsed(),
            "debuggee claimed"
        );
        Some(ClaimedDebuggee {
            info: pending.info,
            reader: pending.reader,
            writer: pending.writer,
        })
    }

    /// Drop an announced debuggee without adopting it, closing its
    /// connection.
    pub fn discard(&self, procuuid: &str) -> bool {
        let mut registry = self.lock_registry();
        let before = registry.len();
        registry.retain(|pending| pending.info.procuuid != procuuid);
        registry.len() != before
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Vec<PendingDebuggee>> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Wake the accept loop so it observes the stop flag.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(
    listener: TcpListener,
    registry: Registry,
    stop: Arc<AtomicBool>,
    announce_timeout: Duration,
) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => greet(stream, &registry, announce_timeout),
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
    tracing::debug!("accept thread terminated");
}

/// Wait for a connection to announce itself; drop it if it does not within
/// the window. Announcements are handled one at a time, which keeps the
/// accept thread simple; the window is short.
fn greet(stream: TcpStream, registry: &Registry, announce_timeout: Duration) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_owned());

    let writer_stream = match stream.try_clone() {
        Ok(cloned) => cloned,
        Err(e) => {
            tracing::warn!(peer, error = %e, "could not split connection");
            return;
        }
    };
    let mut reader = match SocketReader::new(stream) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(peer, error = %e, "could not wrap connection");
            return;
        }
    };

    let message = match reader.wait_for(&Method::ProcIdInfo, announce_timeout) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(peer, error = %e, "connection did not announce itself");
            return;
        }
    };
    let announcement = match message.parse_params::<ProcIdInfo>() {
        Ok(announcement) => announcement,
        Err(e) => {
            tracing::warn!(peer, error = %e, "malformed announcement");
            return;
        }
    };

    let info = DebuggeeInfo::from_announcement(&message.procuuid, &announcement);
    tracing::debug!(
        peer,
        pid = info.pid,
        module = %info.module,
        procuuid = %info.procuuid,
        "debuggee announced"
    );

    let mut registry = match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    // A re-announcing procuuid replaces the stale entry; the old process is
    // gone or restarting.
    registry.retain(|pending| pending.info.procuuid != info.procuuid);
    registry.push(PendingDebuggee {
        info,
        reader,
        writer: MessageWriter::new(writer_stream),
        announced: Instant::now(),
    });
}
