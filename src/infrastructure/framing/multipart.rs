//! multipart/mixed wrapping for one-to-many messages
//!
//! A multi-recipient message is framed as multipart/mixed carrying a
//! resource-lists XML part (the recipients) followed by the CPIM part.
//! Part Content-Length values count encoded bytes.

pub const BOUNDARY: &str = "next-part-boundary";

/// MIME type of the whole wrapper, boundary parameter included.
pub fn multipart_content_type() -> String {
    format!("multipart/mixed; boundary=\"{}\"", BOUNDARY)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Build the resource-lists document naming each recipient URI.
pub fn build_resource_list(recipients: &[String]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
         <resource-lists xmlns=\"urn:ietf:params:xml:ns:resource-lists\" \
         xmlns:cp=\"urn:ietf:params:xml:ns:copycontrol\">\r\n<list>\r\n",
    );
    for recipient in recipients {
        xml.push_str(&format!("<entry uri=\"{}\" cp:copyControl=\"to\"/>\r\n", recipient));
    }
    xml.push_str("</list>\r\n</resource-lists>");
    xml
}

/// Frame a recipient list plus a payload part into multipart/mixed.
pub fn build_multipart(recipients: &[String], payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let resource_list = build_resource_list(recipients);
    encode_parts(&[
        MultipartPart {
            content_type: "application/resource-lists+xml".to_string(),
            body: resource_list.into_bytes(),
        },
        MultipartPart {
            content_type: payload_type.to_string(),
            body: payload.to_vec(),
        },
    ])
}

fn encode_parts(parts: &[MultipartPart]) -> Vec<u8> {
    let mut out = Vec::new();
    for part in parts {
        out.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        out.extend_from_slice(format!("Content-Type: {}\r\n", part.content_type).as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n", part.body.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&part.body);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    out
}

/// Split a multipart body back into parts. `boundary` comes from the outer
/// Content-Type header. Offsets are computed over the raw bytes so binary
/// part bodies survive untouched.
pub fn parse_multipart(data: &[u8], boundary: &str) -> Vec<MultipartPart> {
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut parts = Vec::new();

    let mut cursor = 0usize;
    while let Some(rel) = find_bytes(&data[cursor..], &delimiter) {
        let part_start = cursor + rel + delimiter.len();
        if data[part_start..].starts_with(b"--") {
            break;
        }
        // Skip CRLF after the delimiter line
        let header_start = match find_bytes(&data[part_start..], b"\r\n") {
            Some(offset) => part_start + offset + 2,
            None => break,
        };
        let Some(blank) = find_bytes(&data[header_start..], b"\r\n\r\n") else {
            break;
        };
        let headers = String::from_utf8_lossy(&data[header_start..header_start + blank]);
        let body_start = header_start + blank + 4;

        let mut content_type = "text/plain".to_string();
        let mut declared_length = None;
        for line in headers.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            match name.trim() {
                name if name.eq_ignore_ascii_case("Content-Type") => {
                    content_type = value.trim().to_string()
                }
                name if name.eq_ignore_ascii_case("Content-Length") => {
                    declared_length = value.trim().parse::<usize>().ok()
                }
                _ => {}
            }
        }

        let next_delim = find_bytes(&data[body_start..], &delimiter)
            .map(|offset| body_start + offset)
            .unwrap_or(data.len());
        let body_end = match declared_length {
            Some(len) if body_start + len <= next_delim => body_start + len,
            // Fall back to the boundary scan, trimming the CRLF before it
            _ => next_delim.saturating_sub(2).max(body_start),
        };

        parts.push(MultipartPart {
            content_type,
            body: data[body_start..body_end].to_vec(),
        });
        cursor = next_delim;
    }

    parts
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract the boundary parameter from a Content-Type value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

pub fn is_multipart_content(mime_type: &str) -> bool {
    mime_type
        .split(';')
        .next()
        .map(|t| t.trim().eq_ignore_ascii_case("multipart/mixed"))
        .unwrap_or(false)
}
