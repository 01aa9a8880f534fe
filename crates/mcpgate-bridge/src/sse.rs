//! Incremental decoder for the SSE wire format.
//!
//! Only the fields the bridge cares about are retained: `event:` names the
//! record (`endpoint` announces the POST URL, anything else is a `message`),
//! `data:` lines accumulate into the payload, `id:` and `retry:` are parsed
//! and carried through. Comment lines (`:`) and unknown fields are ignored.

/// One blank-line-delimited SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Streaming decoder. Feed it chunks as they arrive; complete events come
/// out in arrival order, partial lines are carried to the next feed.
///
/// The buffer is kept as bytes so a multi-byte character split across two
/// chunks decodes intact once its line completes.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let raw = std::mem::replace(&mut self.buf, rest);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(ev) = self.take_event() {
                    out.push(ev);
                }
                continue;
            }

            // Comment lines double as keep-alive pings on most servers.
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };

            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data_lines.push(value.to_string()),
                "id" => self.id = Some(value.to_string()),
                "retry" => {
                    if let Ok(ms) = value.parse::<u64>() {
                        self.retry = Some(ms);
                    }
                }
                _ => {}
            }
        }

        out
    }

    /// Flush the record in progress. Events without data are discarded.
    fn take_event(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(SseEvent {
            event,
            data,
            id,
            retry,
        })
    }
}
