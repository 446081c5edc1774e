//! Loopback socket helpers for tests.

use std::net::{TcpListener, TcpStream};

use eyre::Result;

/// Bind a loopback listener on an ephemeral port, reporting the port.
pub fn loopback_listener() -> Result<(TcpListener, u16)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// A connected loopback socket pair: the dialing end and the accepted end.
pub fn loopback_pair() -> Result<(TcpStream, TcpStream)> {
    let (listener, port) = loopback_listener()?;
    let client = TcpStream::connect(("127.0.0.1", port))?;
    let (served, _) = listener.accept()?;
    Ok((client, served))
}

/// A loopback port with nothing listening on it.
///
/// Bind-then-drop, so reuse before the test finishes is unlikely but not
/// impossible.
pub fn closed_loopback_port() -> Result<u16> {
    let (listener, port) = loopback_listener()?;
    drop(listener);
    Ok(port)
}
