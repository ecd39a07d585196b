//! External transaction-layer seam
//!
//! The engine never owns the SIP socket or retransmission timers. Requests
//! are handed to an external transaction layer, and the result comes back as
//! an explicit decision value the caller's retry loop consumes.

use async_trait::async_trait;

use super::message::{SipRequest, SipResponse};

/// Result of one transaction round trip.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// A final response arrived
    Response(SipResponse),
    /// The transaction layer gave up waiting
    Timeout,
    /// The transport failed before any response
    TransportError(String),
}

impl SendOutcome {
    pub fn response(&self) -> Option<&SipResponse> {
        match self {
            SendOutcome::Response(resp) => Some(resp),
            _ => None,
        }
    }
}

/// Hands constructed requests to the external SIP transaction layer.
#[async_trait]
pub trait SipTransactionSender: Send + Sync {
    async fn send(&self, request: SipRequest) -> SendOutcome;
}

/// Capability re-query hook, owned by the external capability-exchange
/// service; fired when a media transfer fails because the remote may have
/// changed capabilities.
#[async_trait]
pub trait CapabilityRequery: Send + Sync {
    async fn requery(&self, remote_party: &str);
}

/// State-change reporting sink for messages and transfers. The engine writes
/// to it and never reads history back for control decisions.
pub trait TransferStore: Send + Sync {
    fn message_sent(&self, conversation_id: &str, message_id: &str);
    fn message_failed(&self, conversation_id: &str, message_id: &str, reason: &str);
    fn message_received(&self, conversation_id: &str, message_id: &str);
    fn transfer_progress(&self, session_id: &str, transferred: u64, total: u64);
}

/// No-op store for deployments that do not persist engine events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransferStore;

impl TransferStore for NullTransferStore {
    fn message_sent(&self, _conversation_id: &str, _message_id: &str) {}
    fn message_failed(&self, _conversation_id: &str, _message_id: &str, _reason: &str) {}
    fn message_received(&self, _conversation_id: &str, _message_id: &str) {}
    fn transfer_progress(&self, _session_id: &str, _transferred: u64, _total: u64) {}
}
