//! Infrastructure layer - protocol and codec implementations
//!
//! This layer contains:
//! - Protocol implementations (SIP signaling, MSRP media)
//! - Payload framing (CPIM, IMDN, multipart)

pub mod framing;
pub mod protocols;
