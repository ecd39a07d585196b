//! SDP handling for MSRP media sessions
//!
//! Covers the subset this engine negotiates: MSRP media descriptions with
//! `path`/`setup`/`fingerprint` attributes, file-transfer attributes
//! (`file-selector`, `file-disposition`, `file-range`), and enough of the
//! general grammar (`rtpmap`, `framesize`) to read descriptions produced by
//! peers.

use crate::domain::content::FileDescriptor;

/// Parsed SDP session
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub address_type: String,
    pub address: String,
}

/// A single media description with its attributes
#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String, // "message", "audio", "video"
    pub port: u16,
    pub protocol: String, // "TCP/MSRP", "TCP/TLS/MSRP", "RTP/AVP"
    pub formats: Vec<String>,
    pub connection: Option<SdpConnection>,
    pub attributes: Vec<(String, String)>,
}

impl SdpMedia {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn path(&self) -> Option<&str> {
        self.attribute("path")
    }

    pub fn setup(&self) -> Option<&str> {
        self.attribute("setup")
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.attribute("fingerprint")
    }

    pub fn file_selector(&self) -> Option<&str> {
        self.attribute("file-selector")
    }

    pub fn is_msrp(&self) -> bool {
        self.protocol.contains("MSRP")
    }

    pub fn is_secured(&self) -> bool {
        self.protocol.contains("TLS")
    }
}

impl SdpSession {
    /// Parse an SDP document. Unknown lines are skipped; a document without
    /// a version or origin line is rejected.
    pub fn parse(text: &str) -> Option<Self> {
        let mut version = None;
        let mut origin = None;
        let mut session_name = String::new();
        let mut connection = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in text.lines() {
            let line = line.trim_end();
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };

            match kind {
                "v" => version = value.trim().parse::<u32>().ok(),
                "o" => origin = parse_origin(value),
                "s" => session_name = value.to_string(),
                "c" => {
                    let conn = parse_connection(value);
                    match media.last_mut() {
                        Some(m) => m.connection = conn,
                        None => connection = conn,
                    }
                }
                "m" => {
                    if let Some(m) = parse_media_line(value) {
                        media.push(m);
                    }
                }
                "a" => {
                    if let Some(m) = media.last_mut() {
                        let (name, attr_value) = match value.split_once(':') {
                            Some((n, v)) => (n.to_string(), v.to_string()),
                            None => (value.to_string(), String::new()),
                        };
                        m.attributes.push((name, attr_value));
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            version: version?,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    /// First MSRP media description, if any.
    pub fn msrp_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.is_msrp())
    }

    /// Connection address for a media description, falling back to the
    /// session-level connection.
    pub fn media_address(&self, media: &SdpMedia) -> Option<String> {
        media
            .connection
            .as_ref()
            .or(self.connection.as_ref())
            .map(|c| c.address.clone())
    }

    /// Serialize back to SDP text.
    pub fn to_sdp_string(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("v={}\r\n", self.version));
        out.push_str(&format!(
            "o={} {} {} IN {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.address_type,
            self.origin.address
        ));
        out.push_str(&format!("s={}\r\n", self.session_name));
        if let Some(conn) = &self.connection {
            out.push_str(&format!("c=IN {} {}\r\n", conn.address_type, conn.address));
        }
        out.push_str("t=0 0\r\n");
        for m in &self.media {
            out.push_str(&format!(
                "m={} {} {} {}\r\n",
                m.media_type,
                m.port,
                m.protocol,
                m.formats.join(" ")
            ));
            if let Some(conn) = &m.connection {
                out.push_str(&format!("c=IN {} {}\r\n", conn.address_type, conn.address));
            }
            for (name, value) in &m.attributes {
                if value.is_empty() {
                    out.push_str(&format!("a={}\r\n", name));
                } else {
                    out.push_str(&format!("a={}:{}\r\n", name, value));
                }
            }
        }
        out
    }
}

fn parse_origin(value: &str) -> Option<SdpOrigin> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 6 {
        return None;
    }
    Some(SdpOrigin {
        username: parts[0].to_string(),
        session_id: parts[1].to_string(),
        session_version: parts[2].to_string(),
        address_type: parts[4].to_string(),
        address: parts[5].to_string(),
    })
}

fn parse_connection(value: &str) -> Option<SdpConnection> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }
    Some(SdpConnection {
        address_type: parts[1].to_string(),
        address: parts[2].to_string(),
    })
}

fn parse_media_line(value: &str) -> Option<SdpMedia> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }
    Some(SdpMedia {
        media_type: parts[0].to_string(),
        port: parts[1].parse().ok()?,
        protocol: parts[2].to_string(),
        formats: parts[3..].iter().map(|s| s.to_string()).collect(),
        connection: None,
        attributes: Vec::new(),
    })
}

/// Build a local MSRP media description for an offer or answer.
pub struct MsrpSdpBuilder {
    local_address: String,
    port: u16,
    path: String,
    setup: String,
    secured: bool,
    accept_types: String,
    file: Option<FileDescriptor>,
}

impl MsrpSdpBuilder {
    pub fn new(local_address: &str, port: u16, path: &str, setup: &str) -> Self {
        Self {
            local_address: local_address.to_string(),
            port,
            path: path.to_string(),
            setup: setup.to_string(),
            secured: false,
            accept_types: "message/cpim".to_string(),
            file: None,
        }
    }

    pub fn secured(mut self, secured: bool) -> Self {
        self.secured = secured;
        self
    }

    pub fn accept_types(mut self, types: &str) -> Self {
        self.accept_types = types.to_string();
        self
    }

    pub fn file_transfer(mut self, file: FileDescriptor) -> Self {
        self.file = Some(file);
        self
    }

    pub fn build(self) -> SdpSession {
        let protocol = if self.secured {
            "TCP/TLS/MSRP"
        } else {
            "TCP/MSRP"
        };

        let mut attributes = vec![
            ("path".to_string(), self.path.clone()),
            ("setup".to_string(), self.setup.clone()),
            ("accept-types".to_string(), self.accept_types.clone()),
        ];
        if let Some(file) = &self.file {
            attributes.push(("file-selector".to_string(), file.file_selector()));
            attributes.push(("file-disposition".to_string(), "attachment".to_string()));
            if file.transferred > 0 {
                attributes.push(("file-range".to_string(), file.file_range()));
            }
        }
        attributes.push(("sendrecv".to_string(), String::new()));

        SdpSession {
            version: 0,
            origin: SdpOrigin {
                username: "-".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                address_type: "IP4".to_string(),
                address: self.local_address.clone(),
            },
            session_name: "-".to_string(),
            connection: Some(SdpConnection {
                address_type: "IP4".to_string(),
                address: self.local_address,
            }),
            media: vec![SdpMedia {
                media_type: "message".to_string(),
                port: self.port,
                protocol: protocol.to_string(),
                formats: vec!["*".to_string()],
                connection: None,
                attributes,
            }],
        }
    }
}

/// Build a content descriptor from the first `video` media description.
///
/// Returns `None` when no media description is video.
pub fn video_content_from_sdp(sdp: &SdpSession) -> Option<FileDescriptor> {
    let media = sdp.media.iter().find(|m| m.media_type == "video")?;

    if let Some(selector) = media.file_selector() {
        let mut desc = FileDescriptor::from_file_selector(selector)?;
        if let Some(range) = media.attribute("file-range") {
            if let Some((start, _stop)) = FileDescriptor::parse_file_range(range) {
                desc.transferred = start - 1;
            }
        }
        return Some(desc);
    }

    // No selector: derive a descriptor from the rtpmap encoding
    let mime = media
        .attribute("rtpmap")
        .and_then(|v| v.split_whitespace().nth(1))
        .and_then(|enc| enc.split('/').next())
        .map(|codec| format!("video/{}", codec.to_ascii_lowercase()))
        .unwrap_or_else(|| "video/unknown".to_string());

    Some(FileDescriptor::new("video", &mime, 0))
}

/// Parse `file-disposition` into whether the transfer should render inline.
pub fn is_inline_disposition(media: &SdpMedia) -> bool {
    matches!(media.attribute("file-disposition"), Some("render"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSRP_OFFER: &str = "v=0\r\n\
        o=- 123456 1 IN IP4 10.0.0.2\r\n\
        s=-\r\n\
        c=IN IP4 10.0.0.2\r\n\
        t=0 0\r\n\
        m=message 2855 TCP/MSRP *\r\n\
        a=path:msrp://10.0.0.2:2855/kjhd37s2s20w2a;tcp\r\n\
        a=setup:active\r\n\
        a=accept-types:message/cpim\r\n\
        a=sendrecv\r\n";

    #[test]
    fn test_parse_msrp_offer() {
        let sdp = SdpSession::parse(MSRP_OFFER).unwrap();
        assert_eq!(sdp.version, 0);
        assert_eq!(sdp.origin.address, "10.0.0.2");

        let media = sdp.msrp_media().unwrap();
        assert_eq!(media.media_type, "message");
        assert_eq!(media.port, 2855);
        assert!(media.is_msrp());
        assert!(!media.is_secured());
        assert_eq!(
            media.path(),
            Some("msrp://10.0.0.2:2855/kjhd37s2s20w2a;tcp")
        );
        assert_eq!(media.setup(), Some("active"));
        assert_eq!(sdp.media_address(media), Some("10.0.0.2".to_string()));
    }

    #[test]
    fn test_parse_rejects_incomplete_document() {
        assert!(SdpSession::parse("s=-\r\n").is_none());
    }

    #[test]
    fn test_builder_round_trip() {
        let sdp = MsrpSdpBuilder::new(
            "10.0.0.1",
            2860,
            "msrp://10.0.0.1:2860/abcd;tcp",
            "passive",
        )
        .build();

        let text = sdp.to_sdp_string();
        let parsed = SdpSession::parse(&text).unwrap();
        let media = parsed.msrp_media().unwrap();
        assert_eq!(media.setup(), Some("passive"));
        assert_eq!(media.path(), Some("msrp://10.0.0.1:2860/abcd;tcp"));
        assert_eq!(media.attribute("accept-types"), Some("message/cpim"));
    }

    #[test]
    fn test_builder_file_transfer_attributes() {
        let mut file = FileDescriptor::new("photo.jpg", "image/jpeg", 90000);
        file.transferred = 30000;

        let sdp = MsrpSdpBuilder::new("10.0.0.1", 2860, "msrp://10.0.0.1:2860/f;tcp", "actpass")
            .file_transfer(file)
            .build();

        let media = &sdp.media[0];
        assert!(media.file_selector().unwrap().contains("name:\"photo.jpg\""));
        assert_eq!(media.attribute("file-disposition"), Some("attachment"));
        assert_eq!(media.attribute("file-range"), Some("30001-90000"));
    }

    #[test]
    fn test_secured_protocol() {
        let sdp = MsrpSdpBuilder::new("10.0.0.1", 2860, "msrps://10.0.0.1:2860/f;tcp", "passive")
            .secured(true)
            .build();
        assert!(sdp.media[0].is_secured());
    }

    #[test]
    fn test_video_content_from_second_media() {
        let text = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.2\r\n\
            s=-\r\n\
            c=IN IP4 10.0.0.2\r\n\
            t=0 0\r\n\
            m=audio 49170 RTP/AVP 0\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            m=video 51372 RTP/AVP 99\r\n\
            a=rtpmap:99 H264/90000\r\n";
        let sdp = SdpSession::parse(text).unwrap();

        let content = video_content_from_sdp(&sdp).unwrap();
        assert_eq!(content.mime_type, "video/h264");
    }

    #[test]
    fn test_no_video_media_yields_none() {
        let text = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.2\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=audio 49170 RTP/AVP 0\r\n\
            a=rtpmap:0 PCMU/8000\r\n\
            m=message 2855 TCP/MSRP *\r\n\
            a=path:msrp://10.0.0.2:2855/x;tcp\r\n";
        let sdp = SdpSession::parse(text).unwrap();
        assert!(video_content_from_sdp(&sdp).is_none());
    }

    #[test]
    fn test_inline_disposition() {
        let text = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.2\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=message 2855 TCP/MSRP *\r\n\
            a=file-disposition:render\r\n";
        let sdp = SdpSession::parse(text).unwrap();
        assert!(is_inline_disposition(&sdp.media[0]));

        let sdp = SdpSession::parse(MSRP_OFFER).unwrap();
        assert!(!is_inline_disposition(sdp.msrp_media().unwrap()));
    }

    #[test]
    fn test_video_content_with_file_selector() {
        let text = "v=0\r\n\
            o=- 1 1 IN IP4 10.0.0.2\r\n\
            s=-\r\n\
            t=0 0\r\n\
            m=video 2855 TCP/MSRP *\r\n\
            a=file-selector:name:\"clip.mp4\" type:video/mp4 size:500\r\n\
            a=file-range:101-500\r\n";
        let sdp = SdpSession::parse(text).unwrap();

        let content = video_content_from_sdp(&sdp).unwrap();
        assert_eq!(content.name, "clip.mp4");
        assert_eq!(content.size, 500);
        assert_eq!(content.transferred, 100);
    }
}
