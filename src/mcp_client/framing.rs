//! Line framing for the server's stdout.
//!
//! Protocol traffic is one JSON-RPC object per line. Some servers also print
//! log lines to stdout; those are recognised by a leading bracketed level tag
//! (`[INFO] ...`, `[error] ...`) and never parsed as JSON.

use super::types::JsonRpcResponse;

/// Level tags that mark a stdout line as server log output.
const LOG_TAGS: &[&str] = &["TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "FATAL"];

/// What a single stdout line turned out to be.
#[derive(Debug)]
pub enum Frame<'a> {
    Blank,
    /// Server log output; carries the trimmed line.
    Log(&'a str),
    Message(JsonRpcResponse),
    Malformed {
        line: &'a str,
        error: String,
    },
}

/// Classify one line read from stdout (trailing newline allowed).
pub fn classify_line(line: &str) -> Frame<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Frame::Blank;
    }
    if is_log_line(trimmed) {
        return Frame::Log(trimmed);
    }
    match serde_json::from_str::<JsonRpcResponse>(trimmed) {
        Ok(msg) => Frame::Message(msg),
        Err(e) => Frame::Malformed {
            line: trimmed,
            error: e.to_string(),
        },
    }
}

/// Whether a trimmed line starts with a bracketed log level tag.
pub fn is_log_line(trimmed: &str) -> bool {
    let Some(rest) = trimmed.strip_prefix('[') else {
        return false;
    };
    let Some(end) = rest.find(']') else {
        return false;
    };
    let tag = &rest[..end];
    LOG_TAGS.iter().any(|t| t.eq_ignore_ascii_case(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_lines() {
        assert!(matches!(classify_line(""), Frame::Blank));
        assert!(matches!(classify_line("   \n"), Frame::Blank));
    }

    #[test]
    fn test_log_tags_are_not_parsed() {
        assert!(matches!(classify_line("[INFO] connected to db"), Frame::Log(_)));
        assert!(matches!(classify_line("[error] boom\n"), Frame::Log(_)));
        assert!(matches!(classify_line("[Warning] slow query"), Frame::Log(_)));
    }

    #[test]
    fn test_json_array_is_not_a_log_line() {
        // A bracket that is not a level tag falls through to JSON parsing.
        assert!(!is_log_line("[1, 2, 3]"));
        assert!(!is_log_line("[INFO"));
    }

    #[test]
    fn test_response_line() {
        let frame = classify_line(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#);
        match frame {
            Frame::Message(msg) => {
                assert_eq!(msg.response_id(), Some(7));
                assert_eq!(msg.jsonrpc, "2.0");
                assert_eq!(msg.result.unwrap()["ok"], true);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_notification_line() {
        let frame = classify_line(r#"{"jsonrpc":"2.0","method":"notifications/message"}"#);
        match frame {
            Frame::Message(msg) => {
                assert!(msg.id.is_none());
                assert_eq!(msg.method.as_deref(), Some("notifications/message"));
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_line() {
        match classify_line("Listening on stdio...") {
            Frame::Malformed { line, .. } => assert_eq!(line, "Listening on stdio..."),
            other => panic!("expected malformed, got {other:?}"),
        }
    }
}
