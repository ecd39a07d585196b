//! MSRP chunk framing (RFC 4975 subset)
//!
//! Covers SEND and REPORT requests plus numeric responses, with the byte
//! range and continuation-flag handling the transfer loop needs. The empty
//! chunk (headers and end-line, no body) doubles as the NAT-opening probe a
//! passive endpoint sends right after its transport opens.

use bytes::Bytes;
use rand::Rng;

/// Continuation flag on the chunk end-line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// `$` — last chunk of the message
    Complete,
    /// `+` — more chunks follow
    More,
    /// `#` — sender aborted the message
    Aborted,
}

impl Continuation {
    pub fn as_char(&self) -> char {
        match self {
            Continuation::Complete => '$',
            Continuation::More => '+',
            Continuation::Aborted => '#',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '$' => Some(Continuation::Complete),
            '+' => Some(Continuation::More),
            '#' => Some(Continuation::Aborted),
            _ => None,
        }
    }
}

/// Chunk kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsrpKind {
    Send,
    Report,
    /// Response with status code (e.g. 200, 481)
    Response(u16),
}

/// Byte-Range header: `start-end/total`, where end or total may be `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    pub fn whole(total: u64) -> Self {
        Self {
            start: 1,
            end: Some(total),
            total: Some(total),
        }
    }

    pub fn to_header_value(&self) -> String {
        let end = self
            .end
            .map(|e| e.to_string())
            .unwrap_or_else(|| "*".to_string());
        let total = self
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| "*".to_string());
        format!("{}-{}/{}", self.start, end, total)
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (range, total) = value.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = match end.trim() {
            "*" => None,
            e => Some(e.parse::<u64>().ok()?),
        };
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };
        Some(Self { start, end, total })
    }
}

/// A single MSRP chunk
#[derive(Debug, Clone)]
pub struct MsrpChunk {
    pub transaction_id: String,
    pub kind: MsrpKind,
    pub to_path: String,
    pub from_path: String,
    pub message_id: Option<String>,
    pub byte_range: Option<ByteRange>,
    pub content_type: Option<String>,
    pub success_report: Option<String>,
    pub failure_report: Option<String>,
    pub status: Option<String>,
    pub body: Bytes,
    pub continuation: Continuation,
}

impl MsrpChunk {
    /// A data-bearing SEND chunk.
    pub fn send(
        to_path: &str,
        from_path: &str,
        message_id: &str,
        content_type: &str,
        byte_range: ByteRange,
        body: Bytes,
        continuation: Continuation,
    ) -> Self {
        Self {
            transaction_id: generate_transaction_id(),
            kind: MsrpKind::Send,
            to_path: to_path.to_string(),
            from_path: from_path.to_string(),
            message_id: Some(message_id.to_string()),
            byte_range: Some(byte_range),
            content_type: Some(content_type.to_string()),
            success_report: Some("no".to_string()),
            failure_report: Some("yes".to_string()),
            status: None,
            body,
            continuation,
        }
    }

    /// The bodiless SEND a passive endpoint emits right after its transport
    /// opens, so intervening NATs learn the binding.
    pub fn empty(to_path: &str, from_path: &str) -> Self {
        Self {
            transaction_id: generate_transaction_id(),
            kind: MsrpKind::Send,
            to_path: to_path.to_string(),
            from_path: from_path.to_string(),
            message_id: Some(generate_message_id()),
            byte_range: None,
            content_type: None,
            success_report: None,
            failure_report: None,
            status: None,
            body: Bytes::new(),
            continuation: Continuation::Complete,
        }
    }

    /// A 200 response acknowledging a received chunk.
    pub fn ok_response(of: &MsrpChunk) -> Self {
        Self {
            transaction_id: of.transaction_id.clone(),
            kind: MsrpKind::Response(200),
            to_path: of.from_path.clone(),
            from_path: of.to_path.clone(),
            message_id: None,
            byte_range: None,
            content_type: None,
            success_report: None,
            failure_report: None,
            status: None,
            body: Bytes::new(),
            continuation: Continuation::Complete,
        }
    }

    pub fn is_empty_probe(&self) -> bool {
        self.kind == MsrpKind::Send && self.body.is_empty() && self.content_type.is_none()
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();

        let start_line = match &self.kind {
            MsrpKind::Send => format!("MSRP {} SEND\r\n", self.transaction_id),
            MsrpKind::Report => format!("MSRP {} REPORT\r\n", self.transaction_id),
            MsrpKind::Response(code) => {
                format!("MSRP {} {} OK\r\n", self.transaction_id, code)
            }
        };
        out.extend_from_slice(start_line.as_bytes());

        out.extend_from_slice(format!("To-Path: {}\r\n", self.to_path).as_bytes());
        out.extend_from_slice(format!("From-Path: {}\r\n", self.from_path).as_bytes());
        if let Some(id) = &self.message_id {
            out.extend_from_slice(format!("Message-ID: {}\r\n", id).as_bytes());
        }
        if let Some(range) = &self.byte_range {
            out.extend_from_slice(
                format!("Byte-Range: {}\r\n", range.to_header_value()).as_bytes(),
            );
        }
        if let Some(v) = &self.success_report {
            out.extend_from_slice(format!("Success-Report: {}\r\n", v).as_bytes());
        }
        if let Some(v) = &self.failure_report {
            out.extend_from_slice(format!("Failure-Report: {}\r\n", v).as_bytes());
        }
        if let Some(v) = &self.status {
            out.extend_from_slice(format!("Status: {}\r\n", v).as_bytes());
        }

        if let Some(content_type) = &self.content_type {
            out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(&self.body);
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(
            format!("-------{}{}\r\n", self.transaction_id, self.continuation.as_char())
                .as_bytes(),
        );
        out
    }

    /// Parse one chunk from a buffer known to contain a complete chunk.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(data);
        let mut lines = text.lines();

        let start_line = lines.next()?;
        let mut start_parts = start_line.split_whitespace();
        if start_parts.next()? != "MSRP" {
            return None;
        }
        let transaction_id = start_parts.next()?.to_string();
        let kind = match start_parts.next()? {
            "SEND" => MsrpKind::Send,
            "REPORT" => MsrpKind::Report,
            code => MsrpKind::Response(code.parse().ok()?),
        };

        let mut to_path = String::new();
        let mut from_path = String::new();
        let mut message_id = None;
        let mut byte_range = None;
        let mut content_type: Option<String> = None;
        let mut success_report = None;
        let mut failure_report = None;
        let mut status = None;

        let end_marker = format!("-------{}", transaction_id);
        let mut header_bytes = 0usize;
        for line in text.lines() {
            header_bytes += line.len() + 2;
            if line.is_empty() || line.starts_with(&end_marker) {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name {
                "To-Path" => to_path = value.to_string(),
                "From-Path" => from_path = value.to_string(),
                "Message-ID" => message_id = Some(value.to_string()),
                "Byte-Range" => byte_range = ByteRange::parse(value),
                "Content-Type" => content_type = Some(value.to_string()),
                "Success-Report" => success_report = Some(value.to_string()),
                "Failure-Report" => failure_report = Some(value.to_string()),
                "Status" => status = Some(value.to_string()),
                _ => {}
            }
        }

        // Locate the end-line to recover the body and continuation flag
        let end_pos = find_subsequence(data, end_marker.as_bytes())?;
        let flag_pos = end_pos + end_marker.len();
        let continuation = Continuation::from_char(*data.get(flag_pos)? as char)?;

        let body = if content_type.is_some() {
            // Body sits between the blank line and "\r\n-------"
            let body_start = header_bytes;
            let body_end = end_pos.saturating_sub(2); // trailing CRLF
            if body_start <= body_end {
                Bytes::copy_from_slice(&data[body_start..body_end])
            } else {
                Bytes::new()
            }
        } else {
            Bytes::new()
        };

        Some(Self {
            transaction_id,
            kind,
            to_path,
            from_path,
            message_id,
            byte_range,
            content_type,
            success_report,
            failure_report,
            status,
            body,
            continuation,
        })
    }
}

/// Scan a frame buffer for one complete chunk; returns the chunk and the
/// number of bytes consumed.
pub fn parse_next_chunk(buffer: &[u8]) -> Option<(MsrpChunk, usize)> {
    let text = String::from_utf8_lossy(buffer);
    let first_line_end = text.find("\r\n")?;
    let mut parts = text[..first_line_end].split_whitespace();
    if parts.next()? != "MSRP" {
        return None;
    }
    let transaction_id = parts.next()?;

    let end_marker = format!("-------{}", transaction_id);
    let end_pos = find_subsequence(buffer, end_marker.as_bytes())?;
    // end-line is marker + flag + CRLF
    let consumed = end_pos + end_marker.len() + 3;
    if consumed > buffer.len() {
        return None;
    }

    let chunk = MsrpChunk::parse(&buffer[..consumed])?;
    Some((chunk, consumed))
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn generate_transaction_id() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

pub fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..10).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}
