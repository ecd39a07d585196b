//! CPIM envelope build/parse (RFC 3862 subset)
//!
//! The envelope carries the sender/recipient URIs, a DateTime stamp, the
//! imdn namespace headers that request disposition reports and the inner
//! content part. Parsing is line-oriented and tolerant: unknown headers are
//! skipped, a missing imdn.Message-ID falls back to the transport-level id
//! supplied by the caller.

use chrono::{DateTime, SecondsFormat, Utc};

/// Disposition reports the sender asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispositionRequest {
    pub delivery: bool,
    pub display: bool,
}

impl DispositionRequest {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn any(&self) -> bool {
        self.delivery || self.display
    }

    fn to_header_value(self) -> Option<String> {
        let mut parts = Vec::new();
        if self.delivery {
            parts.push("positive-delivery");
        }
        if self.display {
            parts.push("display");
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }

    fn parse(value: &str) -> Self {
        let mut req = Self::default();
        for token in value.split(',') {
            match token.trim() {
                "positive-delivery" => req.delivery = true,
                "display" => req.display = true,
                _ => {}
            }
        }
        req
    }
}

/// A decoded CPIM envelope.
#[derive(Debug, Clone)]
pub struct CpimMessage {
    pub from: String,
    pub to: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub disposition: DispositionRequest,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Serialize a CPIM envelope. `Content-Length` counts encoded bytes, so
/// multi-byte UTF-8 content is measured on the wire form, not in chars.
pub fn build_cpim(
    from: &str,
    to: &str,
    message_id: &str,
    timestamp: DateTime<Utc>,
    disposition: DispositionRequest,
    content_type: &str,
    content: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("From: <{}>\r\n", from).as_bytes());
    out.extend_from_slice(format!("To: <{}>\r\n", to).as_bytes());
    out.extend_from_slice(b"NS: imdn <urn:ietf:params:imdn>\r\n");
    out.extend_from_slice(format!("imdn.Message-ID: {}\r\n", message_id).as_bytes());
    out.extend_from_slice(
        format!(
            "DateTime: {}\r\n",
            timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
        .as_bytes(),
    );
    if let Some(value) = disposition.to_header_value() {
        out.extend_from_slice(format!("imdn.Disposition-Notification: {}\r\n", value).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    out.extend_from_slice(format!("Content-Length: {}\r\n", content.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(content);
    out
}

/// Parse a CPIM envelope. `fallback_message_id` is the transport-level id
/// (MSRP Message-ID or SIP Call-ID) used when the envelope carries none.
pub fn parse_cpim(data: &[u8], fallback_message_id: &str) -> Option<CpimMessage> {
    let text = String::from_utf8_lossy(data);

    let mut from = String::new();
    let mut to = String::new();
    let mut message_id = None;
    let mut timestamp = None;
    let mut disposition = DispositionRequest::none();
    let mut content_type = "text/plain".to_string();
    let mut declared_length = None;

    // Envelope headers, then a blank line, then content-part headers, then
    // a blank line, then the content itself.
    let mut sections = 0;
    let mut consumed = 0usize;
    for line in text.split("\r\n") {
        consumed += line.len() + 2;
        if line.is_empty() {
            sections += 1;
            if sections == 2 {
                break;
            }
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim() {
            "From" => from = strip_angle_brackets(value),
            "To" => to = strip_angle_brackets(value),
            "imdn.Message-ID" => message_id = Some(value.to_string()),
            "DateTime" => {
                timestamp = DateTime::parse_from_rfc3339(value)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            }
            "imdn.Disposition-Notification" => disposition = DispositionRequest::parse(value),
            "Content-Type" if sections == 1 => content_type = value.to_string(),
            "Content-Length" if sections == 1 => declared_length = value.parse::<usize>().ok(),
            _ => {}
        }
    }

    if sections < 2 || consumed > data.len() {
        return None;
    }

    let remaining = &data[consumed..];
    let content = match declared_length {
        Some(len) if len <= remaining.len() => remaining[..len].to_vec(),
        _ => remaining.to_vec(),
    };

    Some(CpimMessage {
        from,
        to,
        message_id: message_id.unwrap_or_else(|| fallback_message_id.to_string()),
        timestamp: timestamp.unwrap_or_else(Utc::now),
        disposition,
        content_type,
        content,
    })
}

/// Whether a MIME type means the payload is CPIM-wrapped rather than plain.
pub fn is_cpim_content(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case("message/cpim"))
        .unwrap_or(false)
}

fn strip_angle_brackets(value: &str) -> String {
    let value = value.trim();
    // Drop an optional display name before the bracketed URI
    if let Some(start) = value.find('<') {
        if let Some(end) = value.rfind('>') {
            if end > start {
                return value[start + 1..end].to_string();
            }
        }
    }
    value.to_string()
}
