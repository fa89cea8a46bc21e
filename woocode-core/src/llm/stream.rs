//! Frame reassembly shared by the provider streaming parsers
//!
//! Providers speak three incremental wire formats: SSE events (`data:`
//! prefixed lines separated by blank lines), newline-delimited JSON objects,
//! and line-buffered subprocess stdout. Network reads land in a growing
//! string buffer; these helpers carve complete frames out of the front of
//! the buffer and leave partial frames in place for the next read.

const SSE_EVENT_SEPARATOR: &str = "\n\n";
const SSE_DONE_SENTINEL: &str = "[DONE]";

/// Drain complete SSE events from the buffer and return their payloads with
/// the `data:` prefix stripped. Incomplete events stay buffered. The
/// `[DONE]` terminator and blank events are skipped; encountering the
/// terminator is reported so callers can stop reading.
pub fn drain_sse_events(buffer: &mut String) -> (Vec<String>, bool) {
    let mut payloads = Vec::new();
    let mut done = false;

    // Normalize CRLF framing so the separator search sees plain newlines.
    // A buffer ending in a bare `\r` is mid-CRLF; the pair re-forms once
    // the next chunk arrives.
    if buffer.contains("\r\n") {
        *buffer = buffer.replace("\r\n", "\n");
    }

    while let Some(idx) = buffer.find(SSE_EVENT_SEPARATOR) {
        let raw_event = buffer[..idx].replace('\r', "");
        buffer.drain(..idx + SSE_EVENT_SEPARATOR.len());

        if raw_event.trim().is_empty() {
            continue;
        }

        if let Some(payload) = extract_event_payload(&raw_event) {
            if payload == SSE_DONE_SENTINEL {
                done = true;
                break;
            }
            if !payload.is_empty() {
                payloads.push(payload);
            }
        }
    }

    (payloads, done)
}

/// Collect the payload of one SSE event by joining its `data:` lines.
/// Comment lines and `event:`/`id:` fields are ignored.
fn extract_event_payload(event: &str) -> Option<String> {
    let mut data_lines = Vec::new();

    for line in event.lines() {
        let trimmed = line.trim_end();
        if let Some(data) = trimmed.strip_prefix("data:") {
            data_lines.push(data.trim_start());
        }
    }

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Drain complete newline-delimited frames from the buffer. Blank lines are
/// skipped; the trailing partial line stays buffered until its newline
/// arrives.
pub fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();

    while let Some(idx) = buffer.find('\n') {
        let line = buffer[..idx].trim_end_matches('\r').to_string();
        buffer.drain(..idx + 1);

        if line.trim().is_empty() {
            continue;
        }
        lines.push(line);
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_events_are_extracted_in_order() {
        let mut buffer = String::from("data: one\n\ndata: two\n\n");
        let (events, done) = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["one".to_string(), "two".to_string()]);
        assert!(!done);
        assert!(buffer.is_empty());
    }

    #[test]
    fn partial_sse_event_stays_buffered() {
        let mut buffer = String::from("data: {\"a\":\"b\"}\n\ndata: {\"partial");
        let (events, done) = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["{\"a\":\"b\"}".to_string()]);
        assert!(!done);
        assert_eq!(buffer, "data: {\"partial");
    }

    #[test]
    fn done_sentinel_terminates_the_event_stream() {
        let mut buffer = String::from("data: one\n\ndata: [DONE]\n\ndata: late\n\n");
        let (events, done) = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["one".to_string()]);
        assert!(done);
    }

    #[test]
    fn carriage_returns_and_event_fields_are_ignored() {
        let mut buffer = String::from("event: message\r\ndata: {\"a\":\"b\"}\r\n\r\n");
        let (events, _) = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["{\"a\":\"b\"}".to_string()]);
    }

    #[test]
    fn multiline_data_payloads_are_joined() {
        let mut buffer = String::from("data: line1\ndata: line2\n\n");
        let (events, _) = drain_sse_events(&mut buffer);
        assert_eq!(events, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn ndjson_lines_skip_blanks_and_keep_partials() {
        let mut buffer = String::from("{\"done\":false}\n\n{\"done\":true}\n{\"trunc");
        let lines = drain_lines(&mut buffer);
        assert_eq!(
            lines,
            vec!["{\"done\":false}".to_string(), "{\"done\":true}".to_string()]
        );
        assert_eq!(buffer, "{\"trunc");
    }
}
