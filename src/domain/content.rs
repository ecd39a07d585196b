//! Transfer content metadata
//!
//! File-selector / file-range / file-location are read-only attribute views
//! computed from a [`FileDescriptor`]; they are never persisted on their own.

/// Descriptor for a file (or file-like payload) moving through a transfer
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Integrity hash as `<algo>:<hex-or-colon-bytes>` when known
    pub hash: Option<String>,
    /// Bytes already transferred (resume offset)
    pub transferred: u64,
    /// Remote download location, when the network stored the file
    pub location: Option<String>,
    /// Playable media duration in seconds, when the descriptor carries one
    pub duration_secs: Option<u32>,
}

impl FileDescriptor {
    pub fn new(name: &str, mime_type: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size,
            hash: None,
            transferred: 0,
            location: None,
            duration_secs: None,
        }
    }

    pub fn with_hash(mut self, hash: &str) -> Self {
        self.hash = Some(hash.to_string());
        self
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    pub fn is_fully_transferred(&self) -> bool {
        self.size > 0 && self.transferred >= self.size
    }

    /// `file-selector` attribute value (RFC 5547 subset)
    pub fn file_selector(&self) -> String {
        let mut value = format!(
            "name:\"{}\" type:{} size:{}",
            self.name, self.mime_type, self.size
        );
        if let Some(hash) = &self.hash {
            value.push_str(" hash:");
            value.push_str(hash);
        }
        value
    }

    /// `file-range` attribute value; resumes from the transferred offset.
    ///
    /// Byte positions are 1-based per the SDP grammar.
    pub fn file_range(&self) -> String {
        format!("{}-{}", self.transferred + 1, self.size)
    }

    /// `file-location` attribute value, when the file has a network location
    pub fn file_location(&self) -> Option<String> {
        self.location.clone()
    }

    /// Parse a `file-selector` attribute value.
    pub fn from_file_selector(value: &str) -> Option<Self> {
        let mut name = None;
        let mut mime_type = None;
        let mut size = None;
        let mut hash = None;

        for part in split_selector_parts(value) {
            if let Some(rest) = part.strip_prefix("name:") {
                name = Some(rest.trim_matches('"').to_string());
            } else if let Some(rest) = part.strip_prefix("type:") {
                mime_type = Some(rest.to_string());
            } else if let Some(rest) = part.strip_prefix("size:") {
                size = rest.parse::<u64>().ok();
            } else if let Some(rest) = part.strip_prefix("hash:") {
                hash = Some(rest.to_string());
            }
        }

        Some(Self {
            name: name?,
            mime_type: mime_type.unwrap_or_else(|| "application/octet-stream".to_string()),
            size: size.unwrap_or(0),
            hash,
            transferred: 0,
            location: None,
            duration_secs: None,
        })
    }

    /// Parse a `file-range` value (`start-stop`), returning the resume offset.
    pub fn parse_file_range(value: &str) -> Option<(u64, u64)> {
        let (start, stop) = value.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let stop = stop.trim().parse::<u64>().ok()?;
        if start == 0 || stop < start {
            return None;
        }
        Some((start, stop))
    }
}

/// Split a file-selector value on spaces, keeping quoted names intact.
fn split_selector_parts(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in value.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Generate a destination name that does not collide with any existing name.
///
/// If `name` is free the result equals `name`; otherwise `_1`, `_2`, ... is
/// appended before the extension, counting up until a free name is found.
pub fn unique_destination_name<F>(name: &str, exists: F) -> String
where
    F: Fn(&str) -> bool,
{
    if !exists(name) {
        return name.to_string();
    }

    let (stem, ext) = match name.rfind('.') {
        // A leading dot is a hidden-file name, not an extension
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };

    let mut counter = 1u32;
    loop {
        let candidate = format!("{}_{}{}", stem, counter, ext);
        if !exists(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
