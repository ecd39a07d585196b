//! SIP request/response builders
//!
//! Requests are assembled against a [`DialogPath`] so dialog identity (call-id,
//! tags, route set, CSeq) always comes from one place.

use rand::Rng;
use rsip::{Header, Headers, Request, Response, StatusCode, Version};

use super::dialog::DialogPath;
use super::message::{SipError, SipMethod, SipRequest, SipResponse};

/// Build an in-dialog (or dialog-forming) request.
pub struct RequestBuilder {
    method: SipMethod,
    request_uri: String,
    from_uri: String,
    to_uri: String,
    via_host: String,
    contact_uri: Option<String>,
    extra_headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl RequestBuilder {
    pub fn new(method: SipMethod, request_uri: &str, from_uri: &str, to_uri: &str) -> Self {
        Self {
            method,
            request_uri: request_uri.to_string(),
            from_uri: from_uri.to_string(),
            to_uri: to_uri.to_string(),
            via_host: "localhost".to_string(),
            contact_uri: None,
            extra_headers: Vec::new(),
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn via_host(mut self, host: &str) -> Self {
        self.via_host = host.to_string();
        self
    }

    pub fn contact(mut self, uri: &str) -> Self {
        self.contact_uri = Some(uri.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = body;
        self
    }

    /// Assemble the request, advancing the dialog's CSeq.
    pub fn build(self, dialog: &mut DialogPath) -> Result<SipRequest, SipError> {
        let cseq = dialog.next_cseq();
        self.assemble(dialog, cseq)
    }

    /// Assemble with an explicit CSeq, leaving the dialog counter alone.
    /// ACK for a 2xx reuses the INVITE's sequence number.
    pub fn build_with_cseq(self, dialog: &DialogPath, cseq: u32) -> Result<SipRequest, SipError> {
        self.assemble(dialog, cseq)
    }

    fn assemble(self, dialog: &DialogPath, cseq: u32) -> Result<SipRequest, SipError> {
        let uri = rsip::Uri::try_from(self.request_uri.as_str())
            .map_err(|e| SipError::InvalidMessage(format!("bad request uri: {}", e)))?;
        let mut headers: Vec<Header> = Vec::new();

        headers.push(Header::Other(
            "Via".into(),
            format!(
                "SIP/2.0/TCP {};branch={}",
                self.via_host,
                generate_branch()
            ),
        ));
        headers.push(Header::Other("Max-Forwards".into(), "70".into()));

        let from_value = match dialog.local_tag() {
            Some(tag) => format!("<{}>;tag={}", self.from_uri, tag),
            None => format!("<{}>", self.from_uri),
        };
        headers.push(Header::Other("From".into(), from_value));

        let to_value = match dialog.remote_tag() {
            Some(tag) => format!("<{}>;tag={}", self.to_uri, tag),
            None => format!("<{}>", self.to_uri),
        };
        headers.push(Header::Other("To".into(), to_value));

        headers.push(Header::Other("Call-ID".into(), dialog.call_id().to_string()));
        headers.push(Header::Other(
            "CSeq".into(),
            format!("{} {}", cseq, self.method.as_str()),
        ));

        for route in dialog.route_set() {
            headers.push(Header::Other("Route".into(), route.clone()));
        }

        if let Some(contact) = &self.contact_uri {
            headers.push(Header::Other("Contact".into(), format!("<{}>", contact)));
        }

        for (name, value) in self.extra_headers {
            headers.push(Header::Other(name, value));
        }

        if let Some(content_type) = &self.content_type {
            headers.push(Header::Other("Content-Type".into(), content_type.clone()));
        }
        headers.push(Header::Other(
            "Content-Length".into(),
            self.body.len().to_string(),
        ));

        let request = Request {
            method: self.method.to_rsip(),
            uri,
            headers: Headers::from(headers),
            version: Version::V2,
            body: self.body,
        };

        Ok(SipRequest::new(request))
    }
}

/// Build a response mirroring a request's dialog headers.
pub struct ResponseBuilder {
    status_code: u16,
    local_tag: Option<String>,
    extra_headers: Vec<(String, String)>,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl ResponseBuilder {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            local_tag: None,
            extra_headers: Vec::new(),
            content_type: None,
            body: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn decline() -> Self {
        Self::new(603)
    }

    /// Tag to append to the To header (the terminating side's dialog tag).
    pub fn to_tag(mut self, tag: &str) -> Self {
        self.local_tag = Some(tag.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.extra_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.content_type = Some(content_type.to_string());
        self.body = body;
        self
    }

    pub fn build_for(self, request: &SipRequest) -> Result<SipResponse, SipError> {
        let mut headers: Vec<Header> = Vec::new();

        for name in ["Via", "From", "Call-ID", "CSeq"] {
            for value in request.header_values(name) {
                headers.push(Header::Other(name.into(), value));
            }
        }

        let to_value = request
            .header_value("To")
            .ok_or_else(|| SipError::MissingHeader("To".to_string()))?;
        let to_value = match (&self.local_tag, to_value.contains("tag=")) {
            (Some(tag), false) => format!("{};tag={}", to_value, tag),
            _ => to_value,
        };
        headers.push(Header::Other("To".into(), to_value));

        for (name, value) in self.extra_headers {
            headers.push(Header::Other(name, value));
        }

        if let Some(content_type) = &self.content_type {
            headers.push(Header::Other("Content-Type".into(), content_type.clone()));
        }
        headers.push(Header::Other(
            "Content-Length".into(),
            self.body.len().to_string(),
        ));

        let response = Response {
            status_code: StatusCode::from(self.status_code),
            headers: Headers::from(headers),
            version: Version::V2,
            body: self.body,
        };

        Ok(SipResponse::new(response))
    }
}

/// Generate a Via branch token (RFC 3261 magic cookie prefix).
pub fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    let random: u64 = rng.gen();
    format!("z9hG4bK{:x}", random)
}
