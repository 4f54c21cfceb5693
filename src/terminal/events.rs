use serde::Serialize;
use tokio::sync::mpsc;

/// Channel end a caller hands to `create_terminal` to observe a terminal's
/// lifecycle. Send failures (receiver dropped) are ignored everywhere.
pub type EventSender = mpsc::UnboundedSender<TerminalEvent>;

/// A lifecycle or output event, tagged with the terminal it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalEvent {
    pub terminal_id: String,
    #[serde(flatten)]
    pub kind: TerminalEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalEventKind {
    /// The shell process started and was registered.
    Spawn,
    Stdout { data: String },
    Stderr { data: String },
    /// The shell exited, voluntarily or by signal. Emitted exactly once.
    Exit { code: Option<i32>, signal: Option<i32> },
    /// Waiting on the process failed; the terminal was torn down.
    Error { message: String },
}

pub(crate) fn forward(subscriber: &Option<EventSender>, terminal_id: &str, kind: TerminalEventKind) {
    if let Some(tx) = subscriber {
        let _ = tx.send(TerminalEvent {
            terminal_id: terminal_id.to_string(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = TerminalEvent {
            terminal_id: "term-abc123".to_string(),
            kind: TerminalEventKind::Stdout {
                data: "hi\n".to_string(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["terminal_id"], "term-abc123");
        assert_eq!(json["type"], "stdout");
        assert_eq!(json["data"], "hi\n");
    }

    #[test]
    fn test_exit_event_carries_code_and_signal() {
        let event = TerminalEvent {
            terminal_id: "term-abc123".to_string(),
            kind: TerminalEventKind::Exit {
                code: Some(0),
                signal: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["code"], 0);
        assert!(json["signal"].is_null());
    }

    #[test]
    fn test_forward_without_subscriber_is_noop() {
        forward(&None, "term-x", TerminalEventKind::Spawn);
    }

    #[test]
    fn test_forward_tags_terminal_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward(&Some(tx), "term-x", TerminalEventKind::Spawn);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.terminal_id, "term-x");
        assert!(matches!(event.kind, TerminalEventKind::Spawn));
    }
}
