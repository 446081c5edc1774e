//! The message envelope and its line framing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CodecError, Method};

/// One protocol message.
///
/// On the wire a message is `{"method": ..., "params": {...}}` on a single
/// line. The `procuuid` correlation id always travels inside the params
/// object; the envelope lifts it out so every layer above the codec can route
/// on it without touching the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub method: Method,
    pub procuuid: String,
    /// Method-specific payload with `procuuid` removed. Always a JSON object.
    pub params: Value,
}

#[derive(Serialize, Deserialize)]
struct Wire {
    method: Method,
    #[serde(default)]
    params: Map<String, Value>,
}

impl Message {
    pub fn new(method: Method, procuuid: impl Into<String>, params: Value) -> Self {
        Self {
            method,
            procuuid: procuuid.into(),
            params: normalize_params(params),
        }
    }

    /// Build a message from a serializable payload struct.
    pub fn with_params<T: Serialize>(
        method: Method,
        procuuid: impl Into<String>,
        params: &T,
    ) -> Result<Self, CodecError> {
        let value = serde_json::to_value(params).map_err(CodecError::Encode)?;
        Ok(Self::new(method, procuuid, value))
    }

    /// Deserialize the params payload into a typed struct.
    pub fn parse_params<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_value(self.params.clone()).map_err(CodecError::Decode)
    }

    /// Serialize to the single-line wire form, including the trailing newline.
    ///
    /// Compact JSON never contains a raw newline (control characters inside
    /// strings are escaped), so the one appended here is the whole frame
    /// delimiter.
    pub fn encode(&self) -> Result<String, CodecError> {
        let mut params = match &self.params {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        params.insert("procuuid".to_owned(), Value::String(self.procuuid.clone()));

        let wire = Wire {
            method: self.method.clone(),
            params,
        };
        let mut line = serde_json::to_string(&wire).map_err(CodecError::Encode)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one line (without its delimiter) into a message.
    pub fn decode(line: &str) -> Result<Self, CodecError> {
        let wire: Wire = serde_json::from_str(line).map_err(CodecError::Decode)?;
        let mut params = wire.params;
        let procuuid = match params.remove("procuuid") {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => {
                tracing::debug!(method = %wire.method, "message without procuuid");
                String::new()
            }
        };
        Ok(Self {
            method: wire.method,
            procuuid,
            params: Value::Object(params),
        })
    }
}

fn normalize_params(params: Value) -> Value {
    match params {
        Value::Object(mut map) => {
            map.remove("procuuid");
            Value::Object(map)
        }
        Value::Null => Value::Object(Map::new()),
        other => {
            tracing::warn!(?other, "non-object params replaced with empty object");
            Value::Object(Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn encode_produces_one_line() {
        let message = Message::new(
            Method::SetBreakpoint,
            "abc-123",
            json!({"filename": "main.scr", "line": 3}),
        );
        let line = message.encode().unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let raw: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(raw["method"], "setBP");
        assert_eq!(raw["params"]["procuuid"], "abc-123");
        assert_eq!(raw["params"]["filename"], "main.scr");
        assert_eq!(raw["params"]["line"], 3);
    }

    #[test]
    fn decode_lifts_procuuid_out_of_params() {
        let message =
            Message::decode(r#"{"method":"line","params":{"procuuid":"p1","line":7}}"#).unwrap();

        assert_eq!(message.method, Method::Line);
        assert_eq!(message.procuuid, "p1");
        assert_eq!(message.params, json!({"line": 7}));
    }

    #[test]
    fn round_trip_preserves_method_procuuid_params() {
        let original = Message::new(
            Method::ExecuteStatement,
            "deadbeef",
            json!({"statement": "x = 1\nprint(x)", "frameNumber": 2}),
        );
        let decoded = Message::decode(original.encode().unwrap().trim_end()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn round_trip_with_embedded_newline_in_string() {
        // The \n inside the value must be escaped, never framed.
        let original = Message::new(Method::Stdout, "p", json!({"text": "a\nb\n"}));
        let line = original.encode().unwrap();
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(Message::decode(line.trim_end()).unwrap(), original);
    }

    #[test]
    fn unknown_method_round_trips() {
        let decoded =
            Message::decode(r#"{"method":"framePoke","params":{"procuuid":"p"}}"#).unwrap();
        assert_eq!(decoded.method, Method::Unknown("framePoke".to_owned()));
        assert!(decoded.encode().unwrap().contains("framePoke"));
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(matches!(
            Message::decode("{\"method\": \"line\""),
            Err(CodecError::Decode(_))
        ));
        assert!(matches!(
            Message::decode("not json at all"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn missing_params_decodes_to_empty_object() {
        let message = Message::decode(r#"{"method":"epilogueExit"}"#).unwrap();
        assert_eq!(message.procuuid, "");
        assert_eq!(message.params, json!({}));
    }
}
