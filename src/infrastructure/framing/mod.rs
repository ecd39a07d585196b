//! Payload framing: CPIM envelopes, IMDN disposition reports and the
//! multipart/mixed wrapper for one-to-many messages.

pub mod cpim;
pub mod imdn;
pub mod multipart;

pub use cpim::{build_cpim, is_cpim_content, parse_cpim, CpimMessage, DispositionRequest};
pub use imdn::{is_imdn_content, DispositionKind, DispositionStatus, ImdnReport, IMDN_CONTENT_TYPE};
pub use multipart::{
    boundary_from_content_type, build_multipart, is_multipart_content, multipart_content_type,
    parse_multipart, MultipartPart,
};
