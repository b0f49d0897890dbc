//! Event envelope carried in WebSocket text frames: `["event", arg, ...]`.

use serde_json::Value;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(String),
    #[error("frame must be a non-empty JSON array")]
    NotAnArray,
    #[error("first frame element must be the event name")]
    MissingEvent,
}

pub fn encode(event: &str, args: &[Value]) -> String {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(Value::String(event.to_string()));
    items.extend_from_slice(args);
    Value::Array(items).to_string()
}

/// Split a frame into its event name and arguments.
pub fn decode(text: &str) -> Result<(String, Vec<Value>), FrameError> {
    let value: Value = serde_json::from_str(text).map_err(|e| FrameError::Json(e.to_string()))?;
    let Value::Array(mut items) = value else {
        return Err(FrameError::NotAnArray);
    };
    if items.is_empty() {
        return Err(FrameError::NotAnArray);
    }
    match items.remove(0) {
        Value::String(event) if !event.is_empty() => Ok((event, items)),
        _ => Err(FrameError::MissingEvent),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn decodes_event_and_args() {
        let (event, args) = decode(r#"["echo", 1, {"a": true}, null]"#).unwrap();
        assert_eq!(event, "echo");
        assert_eq!(args, vec![json!(1), json!({ "a": true }), Value::Null]);

        let (event, args) = decode(r#"["ping"]"#).unwrap();
        assert_eq!(event, "ping");
        assert!(args.is_empty());
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(decode("not json"), Err(FrameError::Json(_))));
        assert_eq!(decode(r#"{"event":"x"}"#), Err(FrameError::NotAnArray));
        assert_eq!(decode("[]"), Err(FrameError::NotAnArray));
        assert_eq!(decode("[1, 2]"), Err(FrameError::MissingEvent));
        assert_eq!(decode(r#"["", 2]"#), Err(FrameError::MissingEvent));
    }

    #[test]
    fn encodes_event_first() {
        assert_eq!(encode("reply", &[json!("a"), json!([1])]), r#"["reply","a",[1]]"#);
        assert_eq!(encode("bare", &[]), r#"["bare"]"#);
    }
}
