//! Line framing for the client-facing stream: one JSON object per physical line.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;

pub const GENERIC_ERROR_MESSAGE: &str =
    "Sorry, I could not answer that. Please try asking a different question.";

/// Serializes `value` to a single newline-terminated line.
pub fn emit<T: Serialize + ?Sized>(value: &T) -> String {
    let json = serde_json::to_string(value).unwrap_or_else(|err| {
        tracing::warn!("failed to serialize stream line: {err}");
        json!({ "error": GENERIC_ERROR_MESSAGE }).to_string()
    });
    frame(&json)
}

/// `{"error": message}` as a terminal line.
pub fn error_line(message: &str) -> String {
    emit(&json!({ "error": message }))
}

fn frame(json: &str) -> String {
    let mut line = json.replace('\n', "\\n");
    line.push('\n');
    line
}

/// Adapts the producer side of a conversation into a response body stream.
/// Dropping the returned stream closes the channel, which halts the producer.
pub fn body_stream(
    rx: mpsc::Receiver<String>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    tokio_stream::wrappers::ReceiverStream::new(rx).map(|line| Ok(Bytes::from(line)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn emitted_line_is_single_physical_line() {
        let line = emit(&json!({"content": "a\nb"}));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["content"], "a\nb");
    }

    #[test]
    fn frame_escapes_raw_newlines() {
        assert_eq!(frame("{\"a\":1,\n\"b\":2}"), "{\"a\":1,\\n\"b\":2}\n");
    }

    #[test]
    fn error_line_shape() {
        let line = error_line(GENERIC_ERROR_MESSAGE);
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed, json!({ "error": GENERIC_ERROR_MESSAGE }));
    }

    #[tokio::test]
    async fn body_stream_forwards_lines_in_order() {
        let (tx, rx) = mpsc::channel(4);
        tx.send("one\n".to_string()).await.unwrap();
        tx.send("two\n".to_string()).await.unwrap();
        drop(tx);
        let chunks: Vec<Bytes> = body_stream(rx)
            .map(|r| r.unwrap_or_else(|never| match never {}))
            .collect()
            .await;
        assert_eq!(chunks, vec![Bytes::from("one\n"), Bytes::from("two\n")]);
    }
}
