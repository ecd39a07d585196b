//! IMDN disposition notification documents (RFC 5438 subset)
//!
//! Builds and parses the small XML bodies that report delivery and display
//! of a message. Parsing is a targeted tag scan rather than a full XML
//! parser; the documents are machine-generated and tiny.

use chrono::{DateTime, SecondsFormat, Utc};

pub const IMDN_CONTENT_TYPE: &str = "message/imdn+xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionKind {
    Delivery,
    Display,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispositionStatus {
    Delivered,
    Displayed,
    Failed,
}

impl DispositionStatus {
    fn tag(&self) -> &'static str {
        match self {
            DispositionStatus::Delivered => "delivered",
            DispositionStatus::Displayed => "displayed",
            DispositionStatus::Failed => "failed",
        }
    }
}

/// A parsed or to-be-sent disposition report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImdnReport {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DispositionKind,
    pub status: DispositionStatus,
}

impl ImdnReport {
    pub fn delivered(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            timestamp: Utc::now(),
            kind: DispositionKind::Delivery,
            status: DispositionStatus::Delivered,
        }
    }

    pub fn displayed(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            timestamp: Utc::now(),
            kind: DispositionKind::Display,
            status: DispositionStatus::Displayed,
        }
    }

    pub fn delivery_failed(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            timestamp: Utc::now(),
            kind: DispositionKind::Delivery,
            status: DispositionStatus::Failed,
        }
    }

    pub fn to_xml(&self) -> String {
        let notification = match self.kind {
            DispositionKind::Delivery => "delivery-notification",
            DispositionKind::Display => "display-notification",
        };
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
             <imdn xmlns=\"urn:ietf:params:xml:ns:imdn\">\r\n\
             <message-id>{}</message-id>\r\n\
             <datetime>{}</datetime>\r\n\
             <{}><status><{}/></status></{}>\r\n\
             </imdn>",
            self.message_id,
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            notification,
            self.status.tag(),
            notification,
        )
    }

    pub fn parse(xml: &str) -> Option<Self> {
        let message_id = extract_tag_text(xml, "message-id")?;
        let timestamp = extract_tag_text(xml, "datetime")
            .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let kind = if xml.contains("<display-notification") {
            DispositionKind::Display
        } else if xml.contains("<delivery-notification") {
            DispositionKind::Delivery
        } else {
            return None;
        };

        let status = if xml.contains("<displayed") {
            DispositionStatus::Displayed
        } else if xml.contains("<delivered") {
            DispositionStatus::Delivered
        } else if xml.contains("<failed") {
            DispositionStatus::Failed
        } else {
            return None;
        };

        Some(Self {
            message_id,
            timestamp,
            kind,
            status,
        })
    }
}

pub fn is_imdn_content(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case(IMDN_CONTENT_TYPE))
        .unwrap_or(false)
}

fn extract_tag_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim().to_string())
}
