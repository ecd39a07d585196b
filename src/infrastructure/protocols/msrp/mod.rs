//! MSRP media plane: chunk framing and the negotiated transfer session.

pub mod chunk;
pub mod session;

pub use chunk::{parse_next_chunk, ByteRange, Continuation, MsrpChunk, MsrpKind};
pub use session::{
    parse_msrp_uri, MsrpConnector, MsrpEvent, MsrpSession, MsrpStream, RemoteSetup, SetupRole,
    ACTIVE_DISCOVERY_PORT, OPEN_TIMEOUT,
};
