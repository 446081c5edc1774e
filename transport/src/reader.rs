//! Reading messages off a byte stream.

use std::io::{self, BufRead, BufReader};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::{CodecError, Message, Method};

/// Sockets reject a zero read timeout, so bounded polls are clamped to this.
const MIN_POLL: Duration = Duration::from_millis(1);

/// Cap on a single poll while waiting for a specific method, so the deadline
/// is checked at a reasonable rate even when the peer is silent.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Outcome of a bounded poll.
#[derive(Debug)]
pub enum Poll {
    /// A full message arrived.
    Message(Message),
    /// No full line arrived within the bound.
    Timeout,
    /// The peer closed the connection.
    Closed,
}

enum Step {
    Message(Message),
    Pending,
    Eof,
}

/// Decodes newline-delimited messages from any buffered reader.
///
/// A partial line interrupted by `WouldBlock` is carried over to the next
/// call, so bounded polling never loses bytes.
pub struct MessageReader<R> {
    input: R,
    buffer: String,
}

impl<R: BufRead> MessageReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            buffer: String::new(),
        }
    }

    /// Block until one full message is available.
    ///
    /// Returns `Ok(None)` on clean end-of-stream. A line that fails to parse
    /// is fatal: the stream must be assumed desynchronized.
    pub fn poll_message(&mut self) -> Result<Option<Message>, CodecError> {
        loop {
            match self.poll_step()? {
                Step::Message(message) => return Ok(Some(message)),
                Step::Eof => return Ok(None),
                Step::Pending => continue,
            }
        }
    }

    fn poll_step(&mut self) -> Result<Step, CodecError> {
        loop {
            match self.input.read_line(&mut self.buffer) {
                Ok(0) => {
                    if !self.buffer.is_empty() {
                        tracing::warn!(partial = %self.buffer.trim_end(), "stream ended mid-message");
                        self.buffer.clear();
                    }
                    return Ok(Step::Eof);
                }
                Ok(_) => {
                    if !self.buffer.ends_with('\n') {
                        // Partial line right at end-of-stream; the next read
                        // reports the close.
                        continue;
                    }
                    let raw = std::mem::take(&mut self.buffer);
                    let line = raw.trim_end_matches(['\r', '\n']);
                    if line.is_empty() {
                        continue;
                    }
                    return Message::decode(line).map(Step::Message);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    // Bytes read so far stay in the carry buffer.
                    return Ok(Step::Pending);
                }
                Err(e) => return Err(CodecError::Io(e)),
            }
        }
    }
}

/// A [`MessageReader`] over a TCP stream, with bounded polling.
///
/// Keeps a second handle to the socket so read timeouts can be adjusted
/// between the blocking and polling flavors.
pub struct SocketReader {
    inner: MessageReader<BufReader<TcpStream>>,
    handle: TcpStream,
}

impl SocketReader {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let handle = stream.try_clone()?;
        Ok(Self {
            inner: MessageReader::new(BufReader::new(stream)),
            handle,
        })
    }

    /// Block indefinitely for the next message. `Ok(None)` means the peer
    /// closed the connection.
    pub fn poll_message(&mut self) -> Result<Option<Message>, CodecError> {
        self.handle.set_read_timeout(None)?;
        self.inner.poll_message()
    }

    /// Poll for one message, giving up after roughly `timeout`.
    ///
    /// A zero timeout is a pure non-blocking readiness check, which is how
    /// the trace hooks absorb controller commands on every traced line
    /// without stalling the debuggee. Non-zero sub-millisecond bounds are
    /// clamped up to one millisecond.
    pub fn try_poll_message(&mut self, timeout: Duration) -> Result<Poll, CodecError> {
        let step = if timeout.is_zero() {
            self.handle.set_nonblocking(true)?;
            let step = self.inner.poll_step();
            self.handle.set_nonblocking(false)?;
            step?
        } else {
            self.handle.set_read_timeout(Some(timeout.max(MIN_POLL)))?;
            self.inner.poll_step()?
        };
        match step {
            Step::Message(message) => Ok(Poll::Message(message)),
            Step::Pending => Ok(Poll::Timeout),
            Step::Eof => Ok(Poll::Closed),
        }
    }

    /// Drain the stream until a message with the expected method arrives.
    ///
    /// Non-matching messages are logged and discarded. Used at exactly the
    /// two points of the session lifecycle where one specific reply is the
    /// only way forward: the prologue and the epilogue.
    pub fn wait_for(&mut self, expected: &Method, timeout: Duration) -> Result<Message, CodecError> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|r| !r.is_zero())
            else {
                return Err(CodecError::WaitTimeout {
                    method: expected.clone(),
                    timeout,
                });
            };
            match self.try_poll_message(remaining.min(WAIT_SLICE))? {
                Poll::Message(message) if &message.method == expected => return Ok(message),
                Poll::Message(message) => {
                    tracing::debug!(got = %message.method, want = %expected, "discarding while waiting");
                }
                Poll::Timeout => {}
                Poll::Closed => return Err(CodecError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, IsTerminal, Write};
    use std::net::TcpStream;

    use tracing_subscriber::EnvFilter;

    use crate::bindings::loopback_pair;

    use super::*;

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

    fn socket_pair() -> (TcpStream, SocketReader) {
        let (client, served) = loopback_pair().expect("connecting a socket pair");
        (client, SocketReader::new(served).expect("building reader"))
    }

    #[test]
    fn single_message() {
        let (mut client, mut reader) = socket_pair();
        write!(
            client,
            "{}\n",
            r#"{"method":"continue","params":{"procuuid":"p1"}}"#
        )
        .expect("sending message");

        let message = reader.poll_message().expect("polling message").expect("a message");
        assert_eq!(message.method, Method::Continue);
        assert_eq!(message.procuuid, "p1");
    }

    #[test]
    fn message_split_between_writes() {
        let (mut client, mut reader) = socket_pair();
        write!(client, "{}", r#"{"method":"step","#).expect("sending first half");

        // The first bounded poll sees only the partial line.
        match reader.try_poll_message(Duration::from_millis(10)).expect("polling") {
            Poll::Timeout => {}
            other => panic!("expected timeout, got {other:?}"),
        }

        write!(client, "{}\n", r#""params":{"procuuid":"p1"}}"#).expect("sending second half");
        let message = reader.poll_message().expect("polling message").expect("a message");
        assert_eq!(message.method, Method::Step);
    }

    #[test]
    fn two_messages_in_one_write() {
        let (mut client, mut reader) = socket_pair();
        write!(
            client,
            "{}\n{}\n",
            r#"{"method":"step","params":{"procuuid":"a"}}"#,
            r#"{"method":"stepOut","params":{"procuuid":"a"}}"#
        )
        .expect("sending messages");

        let first = reader.poll_message().expect("first poll").expect("first message");
        let second = reader.poll_message().expect("second poll").expect("second message");
        assert_eq!(first.method, Method::Step);
        assert_eq!(second.method, Method::StepOut);
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut reader = MessageReader::new(Cursor::new(
            "\n\r\n{\"method\":\"shutdown\",\"params\":{\"procuuid\":\"x\"}}\n",
        ));
        let message = reader.poll_message().expect("polling").expect("a message");
        assert_eq!(message.method, Method::Shutdown);
        assert!(reader.poll_message().expect("eof poll").is_none());
    }

    #[test]
    fn end_of_stream_is_none() {
        let mut reader = MessageReader::new(Cursor::new(""));
        assert!(reader.poll_message().expect("polling").is_none());
    }

    #[test]
    fn malformed_line_is_fatal() {
        let mut reader = MessageReader::new(Cursor::new("this is not json\n"));
        assert!(matches!(
            reader.poll_message(),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn try_poll_times_out_quickly() {
        let (_client, mut reader) = socket_pair();
        let start = Instant::now();
        match reader.try_poll_message(Duration::from_millis(20)).expect("polling") {
            Poll::Timeout => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn peer_close_is_reported() {
        let (client, mut reader) = socket_pair();
        drop(client);
        match reader.try_poll_message(Duration::from_millis(50)).expect("polling") {
            Poll::Closed => {}
            other => panic!("expected closed, got {other:?}"),
        }
    }

    #[test]
    fn wait_for_discards_other_methods() {
        let (mut client, mut reader) = socket_pair();
        write!(
            client,
            "{}\n{}\n{}\n",
            r#"{"method":"stdout","params":{"procuuid":"p","text":"noise"}}"#,
            r#"{"method":"line","params":{"procuuid":"p","line":1}}"#,
            r#"{"method":"prologueContinue","params":{"procuuid":"p"}}"#
        )
        .expect("sending messages");

        let message = reader
            .wait_for(&Method::PrologueContinue, Duration::from_secs(2))
            .expect("waiting");
        assert_eq!(message.method, Method::PrologueContinue);
    }

    #[test]
    fn wait_for_times_out() {
        let (_client, mut reader) = socket_pair();
        let err = reader
            .wait_for(&Method::PrologueContinue, Duration::from_millis(50))
            .expect_err("should time out");
        assert!(matches!(
            err,
            CodecError::WaitTimeout {
                method: Method::PrologueContinue,
                ..
            }
        ));
    }
}
