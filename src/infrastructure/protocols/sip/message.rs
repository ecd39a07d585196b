//! SIP message wrappers
//!
//! Thin domain-facing views over `rsip` requests and responses. The engine
//! consumes parsed headers and body text; transaction retransmission and the
//! raw socket belong to the external transaction layer.

use bytes::Bytes;
use rsip::{Header, Headers, Method, Request, Response};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Missing header: {0}")]
    MissingHeader(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

/// Methods the engine handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipMethod {
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Options,
}

impl SipMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Cancel => "CANCEL",
            SipMethod::Message => "MESSAGE",
            SipMethod::Options => "OPTIONS",
        }
    }

    pub fn from_rsip(method: &Method) -> Option<Self> {
        match method {
            Method::Invite => Some(SipMethod::Invite),
            Method::Ack => Some(SipMethod::Ack),
            Method::Bye => Some(SipMethod::Bye),
            Method::Cancel => Some(SipMethod::Cancel),
            Method::Message => Some(SipMethod::Message),
            Method::Options => Some(SipMethod::Options),
            _ => None,
        }
    }

    pub fn to_rsip(self) -> Method {
        match self {
            SipMethod::Invite => Method::Invite,
            SipMethod::Ack => Method::Ack,
            SipMethod::Bye => Method::Bye,
            SipMethod::Cancel => Method::Cancel,
            SipMethod::Message => Method::Message,
            SipMethod::Options => Method::Options,
        }
    }
}

impl fmt::Display for SipMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Case-insensitive lookup of a header value by name.
///
/// rsip's typed headers all render as `Name: value`, so a single string walk
/// covers typed and untyped headers alike.
fn find_header_value(headers: &Headers, name: &str) -> Option<String> {
    let prefix_len = name.len();
    headers.iter().find_map(|h| {
        let rendered = h.to_string();
        if rendered.len() > prefix_len
            && rendered[..prefix_len].eq_ignore_ascii_case(name)
            && rendered[prefix_len..].starts_with(':')
        {
            Some(rendered[prefix_len + 1..].trim().to_string())
        } else {
            None
        }
    })
}

/// Collect every value of a repeating header (e.g. Record-Route).
fn find_header_values(headers: &Headers, name: &str) -> Vec<String> {
    let prefix_len = name.len();
    headers
        .iter()
        .filter_map(|h| {
            let rendered = h.to_string();
            if rendered.len() > prefix_len
                && rendered[..prefix_len].eq_ignore_ascii_case(name)
                && rendered[prefix_len..].starts_with(':')
            {
                Some(rendered[prefix_len + 1..].trim().to_string())
            } else {
                None
            }
        })
        .collect()
}

/// Extract the `tag` parameter from a From/To header value.
fn extract_tag(header_value: &str) -> Option<String> {
    header_value
        .split(';')
        .skip(1)
        .find_map(|p| p.trim().strip_prefix("tag="))
        .map(|t| t.trim().to_string())
}

/// SIP request wrapper
#[derive(Debug, Clone)]
pub struct SipRequest {
    pub inner: Request,
}

impl SipRequest {
    pub fn new(inner: Request) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let request = rsip::Request::try_from(data)?;
        Ok(Self::new(request))
    }

    pub fn method(&self) -> Option<SipMethod> {
        SipMethod::from_rsip(&self.inner.method)
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).to_string()
    }

    pub fn header_value(&self, name: &str) -> Option<String> {
        find_header_value(&self.inner.headers, name)
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        find_header_values(&self.inner.headers, name)
    }

    pub fn call_id(&self) -> Option<String> {
        self.header_value("Call-ID")
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header_value("From").and_then(|v| extract_tag(&v))
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header_value("To").and_then(|v| extract_tag(&v))
    }

    pub fn cseq(&self) -> Option<u32> {
        self.header_value("CSeq")
            .and_then(|v| v.split_whitespace().next().map(|s| s.to_string()))
            .and_then(|s| s.parse().ok())
    }

    pub fn content_type(&self) -> Option<String> {
        self.header_value("Content-Type")
    }

    /// Sender identity, preferring P-Asserted-Identity over From.
    pub fn asserted_identity(&self) -> Option<String> {
        self.header_value("P-Asserted-Identity")
            .or_else(|| self.header_value("From"))
            .map(|v| strip_name_addr(&v))
    }

    pub fn contribution_id(&self) -> Option<String> {
        self.header_value("Contribution-ID")
    }

    pub fn conversation_id(&self) -> Option<String> {
        self.header_value("Conversation-ID")
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// SIP response wrapper
#[derive(Debug, Clone)]
pub struct SipResponse {
    pub inner: Response,
}

impl SipResponse {
    pub fn new(inner: Response) -> Self {
        Self { inner }
    }

    pub fn parse(data: &[u8]) -> Result<Self, SipError> {
        let response = rsip::Response::try_from(data)?;
        Ok(Self::new(response))
    }

    pub fn status_code(&self) -> u16 {
        self.inner.status_code.clone().into()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code())
    }

    pub fn is_auth_challenge(&self) -> bool {
        matches!(self.status_code(), 401 | 407)
    }

    pub fn headers(&self) -> &Headers {
        &self.inner.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.inner.body).to_string()
    }

    pub fn header_value(&self, name: &str) -> Option<String> {
        find_header_value(&self.inner.headers, name)
    }

    pub fn header_values(&self, name: &str) -> Vec<String> {
        find_header_values(&self.inner.headers, name)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header_value("To").and_then(|v| extract_tag(&v))
    }

    /// Challenge value from either proxy or UAS authentication headers.
    pub fn authenticate_header(&self) -> Option<String> {
        self.header_value("Proxy-Authenticate")
            .or_else(|| self.header_value("WWW-Authenticate"))
    }

    /// `Authentication-Info` from a success response (source of nextnonce).
    pub fn authentication_info(&self) -> Option<String> {
        self.header_value("Authentication-Info")
    }

    /// Record-Route values, in arrival order, for the dialog route set.
    pub fn record_routes(&self) -> Vec<String> {
        self.header_values("Record-Route")
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.inner.to_string())
    }
}

/// Strip display name and angle brackets from a name-addr, keeping the URI.
pub fn strip_name_addr(value: &str) -> String {
    let value = match value.split(';').next() {
        Some(v) => v.trim(),
        None => value.trim(),
    };
    if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
        if start < end {
            return value[start + 1..end].to_string();
        }
    }
    value.to_string()
}
