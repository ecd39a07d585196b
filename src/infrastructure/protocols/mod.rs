//! Wire protocols: SIP signaling and MSRP media transfer.

pub mod msrp;
pub mod sip;
