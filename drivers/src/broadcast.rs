//! Stdout-JSON fan-out sink for the `Broadcast` port (§6).
//!
//! Grounded on `examples/martyn-saronic-urd/src/json_output.rs`'s
//! timestamp-stamped, `type`-tagged event envelope: every event gets the
//! same `{timestamp, type, ...payload}` shape and is written as one JSON
//! line, the same "one line per event, consumable by an external tailer"
//! contract `json_output.rs` establishes for command/error/buffer events.

use std::io::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::json;

use labcell_core::driver::Broadcast;

fn current_timestamp() -> f64 {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    (timestamp * 1_000_000.0).round() / 1_000_000.0
}

/// Writes one JSON object per line to the wrapped writer. Defaults to
/// stdout; tests swap in an in-memory buffer.
pub struct StdoutBroadcast<W: Write + Send = std::io::Stdout> {
    writer: Mutex<W>,
}

impl StdoutBroadcast<std::io::Stdout> {
    pub fn new() -> Self {
        Self { writer: Mutex::new(std::io::stdout()) }
    }
}

impl Default for StdoutBroadcast<std::io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write + Send> StdoutBroadcast<W> {
    pub fn with_writer(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }
}

#[async_trait]
impl<W: Write + Send> Broadcast for StdoutBroadcast<W> {
    async fn broadcast(&self, event_type: &str, mut payload: serde_json::Value) {
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("timestamp".to_string(), json!(current_timestamp()));
            map.insert("type".to_string(), json!(event_type));
        } else {
            payload = json!({"timestamp": current_timestamp(), "type": event_type, "data": payload});
        }

        let line = match serde_json::to_string(&payload) {
            Ok(line) => line,
            Err(_) => return,
        };

        let mut writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = writeln!(writer, "{line}");
        let _ = writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_gains_timestamp_and_type_fields() {
        let sink = StdoutBroadcast::with_writer(Vec::new());
        sink.broadcast("state_transition", json!({"robot_id": "arm-1"})).await;
        let buf = sink.writer.lock().unwrap();
        let line: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(line["type"], "state_transition");
        assert_eq!(line["robot_id"], "arm-1");
        assert!(line["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn non_object_payload_is_wrapped_rather_than_dropped() {
        let sink = StdoutBroadcast::with_writer(Vec::new());
        sink.broadcast("raw_count", json!(42)).await;
        let buf = sink.writer.lock().unwrap();
        let line: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(line["type"], "raw_count");
        assert_eq!(line["data"], 42);
    }

    #[tokio::test]
    async fn two_events_each_land_on_their_own_line() {
        let sink = StdoutBroadcast::with_writer(Vec::new());
        sink.broadcast("a", json!({})).await;
        sink.broadcast("b", json!({})).await;
        let buf = sink.writer.lock().unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
