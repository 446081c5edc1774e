//! Writing messages to a byte stream.

use std::io::Write;

use serde_json::Value;

use crate::{CodecError, Message, Method};

/// Frames and flushes outgoing messages.
///
/// Each message is a single write of a single line, so concurrent readers on
/// the other end never observe a torn frame.
pub struct MessageWriter<W> {
    output: W,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(output: W) -> Self {
        Self { output }
    }

    pub fn send(&mut self, message: &Message) -> Result<(), CodecError> {
        let line = message.encode()?;
        self.output.write_all(line.as_bytes())?;
        self.output.flush()?;
        Ok(())
    }

    /// Build and send a message in one step.
    pub fn send_command(
        &mut self,
        method: Method,
        procuuid: &str,
        params: Value,
    ) -> Result<(), CodecError> {
        self.send(&Message::new(method, procuuid, params))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn send_writes_one_terminated_line() {
        let mut sink = Vec::new();
        let mut writer = MessageWriter::new(&mut sink);
        writer
            .send_command(Method::Continue, "p1", json!({}))
            .expect("sending");

        let written = String::from_utf8(sink).expect("utf8");
        assert!(written.ends_with('\n'));
        assert_eq!(written.lines().count(), 1);

        let message = Message::decode(written.trim_end()).expect("decoding");
        assert_eq!(message.method, Method::Continue);
        assert_eq!(message.procuuid, "p1");
    }

    #[test]
    fn consecutive_sends_stay_line_separated() {
        let mut sink = Vec::new();
        {
            let mut writer = MessageWriter::new(&mut sink);
            writer
                .send_command(Method::Step, "p", json!({}))
                .expect("first send");
            writer
                .send_command(Method::StepOver, "p", json!({}))
                .expect("second send");
        }

        let written = String::from_utf8(sink).expect("utf8");
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(Message::decode(lines[0]).expect("first").method, Method::Step);
        assert_eq!(
            Message::decode(lines[1]).expect("second").method,
            Method::StepOver
        );
    }
}
