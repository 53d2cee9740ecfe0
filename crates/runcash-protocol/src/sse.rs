/// One field line of a server-sent event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseParsed {
    Event(String),
    Data(String),
    Retry(u64),
    Id(String),
    Comment,
}

/// Parse a single SSE line. Blank lines are handled by [`SseDecoder`].
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if line.starts_with(':') {
        return Some(SseParsed::Comment);
    }
    let (field, value) = match line.split_once(':') {
        Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
        None => (line, ""),
    };
    match field {
        "event" => Some(SseParsed::Event(value.to_string())),
        "data" => Some(SseParsed::Data(value.to_string())),
        "id" => Some(SseParsed::Id(value.to_string())),
        "retry" => value.trim().parse().ok().map(SseParsed::Retry),
        _ => None,
    }
}

/// A complete event, dispatched on the blank line that terminates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
}

impl SseMessage {
    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

/// Incremental decoder over arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buf: String,
    event: Option<String>,
    data: Vec<String>,
    retry_ms: Option<u64>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `retry:` hint seen on the stream.
    pub fn retry_ms(&self) -> Option<u64> {
        self.retry_ms
    }

    /// Feed a text chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<SseMessage> {
        self.line_buf.push_str(chunk);
        let mut out = Vec::new();

        // keep the incomplete last line in the buffer
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    out.push(SseMessage {
                        event: self.event.take(),
                        data: self.data.join("\n"),
                    });
                    self.data.clear();
                } else {
                    self.event = None;
                }
                continue;
            }

            match parse_sse_line(line) {
                Some(SseParsed::Event(ev)) => self.event = Some(ev),
                Some(SseParsed::Data(d)) => self.data.push(d),
                Some(SseParsed::Retry(ms)) => self.retry_ms = Some(ms),
                Some(SseParsed::Id(_)) | Some(SseParsed::Comment) | None => {}
            }
        }
        out
    }
}
