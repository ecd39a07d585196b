//! SIP protocol support: message wrappers, dialog state, builders, AKA digest
//! authentication, SDP handling and the external transaction seam.

pub mod auth;
pub mod builder;
pub mod dialog;
pub mod message;
pub mod sdp;
pub mod transport;

pub use auth::{AkaOutcome, AuthProcedure, DigestParams, SimChallenge};
pub use builder::{generate_branch, RequestBuilder, ResponseBuilder};
pub use dialog::{DialogPath, DialogRole};
pub use message::{SipError, SipMethod, SipRequest, SipResponse};
pub use sdp::{video_content_from_sdp, MsrpSdpBuilder, SdpMedia, SdpSession};
pub use transport::{
    CapabilityRequery, NullTransferStore, SendOutcome, SipTransactionSender, TransferStore,
};
