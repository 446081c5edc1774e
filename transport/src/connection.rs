//! Dialing the controller.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::{CodecError, MessageWriter, SocketReader};

/// Port the controller listens on when nothing else is configured.
pub const DEFAULT_CONTROL_PORT: u16 = 8765;

/// Default bound on establishing the control connection.
///
/// Callers may choose a larger bound, but the connect must always be bounded:
/// a debuggee hanging forever on a dead controller address helps nobody.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A connected control channel, split into its two directions.
pub struct Connection {
    pub reader: SocketReader,
    pub writer: MessageWriter<TcpStream>,
}

/// Resolve a host argument to connectable socket addresses.
///
/// A trailing `@@v6` marks the host as an IPv6 literal, which needs
/// bracketing before standard resolution accepts it.
pub fn resolve_host(host: &str, port: u16) -> Result<Vec<SocketAddr>, CodecError> {
    let spec = match host.strip_suffix("@@v6") {
        Some(literal) => format!("[{literal}]:{port}"),
        None if host.contains(':') && !host.contains('[') => format!("[{host}]:{port}"),
        None => format!("{host}:{port}"),
    };
    let addrs: Vec<SocketAddr> = spec
        .to_socket_addrs()
        .map_err(|_| CodecError::HostResolve(host.to_owned()))?
        .collect();
    if addrs.is_empty() {
        return Err(CodecError::HostResolve(host.to_owned()));
    }
    Ok(addrs)
}

/// Connect to the controller with a bounded timeout.
///
/// The socket is configured for interactive traffic: Nagle off, keep-alive on
/// where the platform exposes it.
pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Connection, CodecError> {
    let addrs = resolve_host(host, port)?;
    let mut stream = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(e) => {
                tracing::debug!(%addr, %e, "connect attempt failed");
            }
        }
    }
    let stream = stream.ok_or_else(|| CodecError::ConnectTimeout {
        host: host.to_owned(),
        port,
        timeout,
    })?;

    stream.set_nodelay(true)?;
    #[cfg(unix)]
    if let Err(e) = enable_keepalive(&stream) {
        tracing::warn!(%e, "could not enable keep-alive");
    }

    let write_half = stream.try_clone()?;
    Ok(Connection {
        reader: SocketReader::new(stream)?,
        writer: MessageWriter::new(write_half),
    })
}

#[cfg(unix)]
fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt::KeepAlive};

    setsockopt(stream, KeepAlive, &true)?;
    Ok(())
}
