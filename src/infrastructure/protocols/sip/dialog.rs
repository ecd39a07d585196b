//! SIP dialog path
//!
//! The durable per-session addressing context: call-id, tags, route set and
//! the CSeq counter. CSeq is monotonically incremented for every request sent
//! within the dialog, including requests resent after an authentication
//! challenge. Tags are set exactly once from the first message that supplies
//! them.

use rand::Rng;

/// Which side of the dialog this endpoint plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogRole {
    /// We sent the initial request
    Originating,
    /// We received the initial request
    Terminating,
}

/// Mutable dialog state bound one-to-one to a session
#[derive(Debug, Clone)]
pub struct DialogPath {
    call_id: String,
    role: DialogRole,
    local_tag: Option<String>,
    remote_tag: Option<String>,
    route_set: Vec<String>,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    cseq: u32,
}

impl DialogPath {
    /// Create the originating side of a dialog with a fresh call-id.
    pub fn originating(domain: &str) -> Self {
        Self {
            call_id: generate_call_id(domain),
            role: DialogRole::Originating,
            local_tag: Some(generate_tag()),
            remote_tag: None,
            route_set: Vec::new(),
            local_sdp: None,
            remote_sdp: None,
            cseq: 0,
        }
    }

    /// Create the terminating side from an inbound request's dialog data.
    pub fn terminating(call_id: &str, remote_tag: Option<&str>, remote_cseq: u32) -> Self {
        Self {
            call_id: call_id.to_string(),
            role: DialogRole::Terminating,
            local_tag: Some(generate_tag()),
            remote_tag: remote_tag.map(|t| t.to_string()),
            route_set: Vec::new(),
            local_sdp: None,
            remote_sdp: None,
            cseq: remote_cseq,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn role(&self) -> DialogRole {
        self.role
    }

    pub fn local_tag(&self) -> Option<&str> {
        self.local_tag.as_deref()
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    /// Record the remote tag from the first response/request carrying one.
    ///
    /// Later values are ignored: the tag is immutable once set, except when a
    /// challenge retry legitimately restarts the dialog-forming exchange.
    pub fn set_remote_tag(&mut self, tag: &str) {
        if self.remote_tag.is_none() {
            self.remote_tag = Some(tag.to_string());
        }
    }

    /// Clear dialog-forming response data for an authorized re-challenge
    /// retry. The CSeq counter is never reset.
    pub fn reset_for_challenge_retry(&mut self) {
        if self.role == DialogRole::Originating {
            self.remote_tag = None;
            self.remote_sdp = None;
        }
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    pub fn set_route_set(&mut self, routes: Vec<String>) {
        self.route_set = routes;
    }

    pub fn local_sdp(&self) -> Option<&str> {
        self.local_sdp.as_deref()
    }

    pub fn set_local_sdp(&mut self, sdp: String) {
        self.local_sdp = Some(sdp);
    }

    pub fn remote_sdp(&self) -> Option<&str> {
        self.remote_sdp.as_deref()
    }

    pub fn set_remote_sdp(&mut self, sdp: String) {
        self.remote_sdp = Some(sdp);
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// Advance and return the CSeq for the next request in this dialog.
    pub fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }
}

/// Generate a dialog call-id scoped to the local domain.
pub fn generate_call_id(domain: &str) -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..12).map(|_| rng.gen()).collect();
    format!("{}@{}", hex::encode(random_bytes), domain)
}

/// Generate a From/To tag.
pub fn generate_tag() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_originating_dialog_has_fresh_identity() {
        let a = DialogPath::originating("ims.example.com");
        let b = DialogPath::originating("ims.example.com");

        assert_ne!(a.call_id(), b.call_id());
        assert!(a.call_id().ends_with("@ims.example.com"));
        assert!(a.local_tag().is_some());
        assert!(a.remote_tag().is_none());
        assert_eq!(a.cseq(), 0);
    }

    #[test]
    fn test_terminating_dialog_adopts_remote_identity() {
        let dialog = DialogPath::terminating("abc123@peer.example.com", Some("remote-tag"), 7);
        assert_eq!(dialog.call_id(), "abc123@peer.example.com");
        assert_eq!(dialog.remote_tag(), Some("remote-tag"));
        assert_eq!(dialog.role(), DialogRole::Terminating);
    }

    #[test]
    fn test_cseq_strictly_increases() {
        let mut dialog = DialogPath::originating("example.com");
        let first = dialog.next_cseq();
        let second = dialog.next_cseq();
        let third = dialog.next_cseq();
        assert_eq!((first, second, third), (1, 2, 3));
    }

    #[test]
    fn test_remote_tag_set_once() {
        let mut dialog = DialogPath::originating("example.com");
        dialog.set_remote_tag("first");
        dialog.set_remote_tag("second");
        assert_eq!(dialog.remote_tag(), Some("first"));
    }

    #[test]
    fn test_challenge_retry_resets_tag_but_not_cseq() {
        let mut dialog = DialogPath::originating("example.com");
        dialog.next_cseq();
        dialog.set_remote_tag("challenged");
        dialog.set_remote_sdp("v=0".to_string());

        dialog.reset_for_challenge_retry();
        assert!(dialog.remote_tag().is_none());
        assert!(dialog.remote_sdp().is_none());
        // Retried request continues the counter
        assert_eq!(dialog.next_cseq(), 2);

        dialog.set_remote_tag("answered");
        assert_eq!(dialog.remote_tag(), Some("answered"));
    }
}
