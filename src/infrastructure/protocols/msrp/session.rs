//! MSRP transport negotiation and the transfer loop
//!
//! Setup roles follow RFC 4145: whichever side offered `actpass` lets the
//! answerer choose, an `active` offer forces us passive and vice versa. The
//! active side advertises discovery port 9 in its SDP and connects out; the
//! passive side listens and, once the connection opens, sends exactly one
//! bodiless chunk so NAT bindings along the path are established.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::chunk::{
    generate_message_id, parse_next_chunk, ByteRange, Continuation, MsrpChunk, MsrpKind,
};
use crate::domain::shared::{EngineError, Result};

/// Port the active side advertises in SDP; the real source port is chosen by
/// the OS at connect time.
pub const ACTIVE_DISCOVERY_PORT: u16 = 9;

/// How long either side waits for the transport to open before the media
/// leg is declared dead.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum body bytes carried by one SEND chunk.
const CHUNK_SIZE: usize = 2048;

/// Our side's connection-setup role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupRole {
    Active,
    Passive,
}

impl SetupRole {
    pub fn as_sdp_value(&self) -> &'static str {
        match self {
            SetupRole::Active => "active",
            SetupRole::Passive => "passive",
        }
    }

    pub fn advertised_port(&self, local_port: u16) -> u16 {
        match self {
            SetupRole::Active => ACTIVE_DISCOVERY_PORT,
            SetupRole::Passive => local_port,
        }
    }
}

/// The remote's `a=setup:` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSetup {
    Active,
    Passive,
    ActPass,
}

impl RemoteSetup {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "active" => Some(RemoteSetup::Active),
            "passive" => Some(RemoteSetup::Passive),
            "actpass" => Some(RemoteSetup::ActPass),
            _ => None,
        }
    }

    /// Resolve our role against the remote's declaration. `actpass` falls
    /// back to the configured preference.
    pub fn local_role(&self, preferred: SetupRole) -> SetupRole {
        match self {
            RemoteSetup::Active => SetupRole::Passive,
            RemoteSetup::Passive => SetupRole::Active,
            RemoteSetup::ActPass => preferred,
        }
    }
}

/// Byte stream the MSRP loop runs over. Plain TCP and TLS streams both
/// qualify via the blanket impl.
pub trait MsrpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MsrpStream for T {}

/// Opens the transport according to the resolved role. The engine injects a
/// real TCP/TLS implementation; tests inject duplex pipes.
#[async_trait::async_trait]
pub trait MsrpConnector: Send + Sync {
    /// Active side: connect out to the remote path's host and port.
    async fn connect(&self, remote_host: &str, remote_port: u16) -> Result<Box<dyn MsrpStream>>;

    /// Passive side: wait for the remote to connect to our advertised port.
    async fn accept(&self, local_port: u16) -> Result<Box<dyn MsrpStream>>;
}

/// Events surfaced by the receive loop.
#[derive(Debug, Clone)]
pub enum MsrpEvent {
    /// A complete message was reassembled
    MessageReceived {
        message_id: String,
        content_type: String,
        body: Bytes,
    },
    /// Forward progress on an inbound or outbound transfer
    Progress { transferred: u64, total: u64 },
    /// The remote aborted a message mid-transfer
    TransferAborted { message_id: String },
    /// The connection closed
    Closed,
}

/// One negotiated MSRP media leg.
///
/// The transport is split into halves at open time so sending and the
/// receive loop never contend for one lock.
pub struct MsrpSession {
    role: SetupRole,
    local_path: String,
    remote_path: String,
    reader: Mutex<Option<ReadHalf<Box<dyn MsrpStream>>>>,
    writer: Mutex<Option<WriteHalf<Box<dyn MsrpStream>>>>,
    transferred: Mutex<u64>,
}

impl MsrpSession {
    pub fn new(role: SetupRole, local_path: &str, remote_path: &str) -> Self {
        Self {
            role,
            local_path: local_path.to_string(),
            remote_path: remote_path.to_string(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            transferred: Mutex::new(0),
        }
    }

    pub fn role(&self) -> SetupRole {
        self.role
    }

    pub fn local_path(&self) -> &str {
        &self.local_path
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub async fn transferred(&self) -> u64 {
        *self.transferred.lock().await
    }

    /// Open the transport within [`OPEN_TIMEOUT`]. A passive endpoint sends
    /// its single empty chunk immediately after accepting.
    pub async fn open(&self, connector: Arc<dyn MsrpConnector>, local_port: u16) -> Result<()> {
        self.open_with_timeout(connector, local_port, OPEN_TIMEOUT)
            .await
    }

    /// Open with an explicit timeout (deployment-configurable).
    pub async fn open_with_timeout(
        &self,
        connector: Arc<dyn MsrpConnector>,
        local_port: u16,
        timeout: Duration,
    ) -> Result<()> {
        let opened = tokio::time::timeout(timeout, async {
            match self.role {
                SetupRole::Active => {
                    let (host, port) = parse_msrp_uri(&self.remote_path)?;
                    connector.connect(&host, port).await
                }
                SetupRole::Passive => connector.accept(local_port).await,
            }
        })
        .await
        .map_err(|_| EngineError::Network("media transport open timed out".to_string()))??;

        let (reader, mut writer) = tokio::io::split(opened);

        if self.role == SetupRole::Passive {
            let probe = MsrpChunk::empty(&self.remote_path, &self.local_path);
            writer.write_all(&probe.encode()).await.map_err(|e| {
                EngineError::Network(format!("failed to send opening chunk: {}", e))
            })?;
            debug!(tx = %probe.transaction_id, "sent opening chunk");
        }

        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        Ok(())
    }

    /// Send one complete message, split into chunks. Returns the message id.
    pub async fn send_message(&self, content_type: &str, body: &[u8]) -> Result<String> {
        let message_id = generate_message_id();
        let total = body.len() as u64;

        let mut guard = self.writer.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| EngineError::Network("media transport not open".to_string()))?;

        if body.is_empty() {
            let chunk = MsrpChunk::send(
                &self.remote_path,
                &self.local_path,
                &message_id,
                content_type,
                ByteRange::whole(0),
                Bytes::new(),
                Continuation::Complete,
            );
            stream
                .write_all(&chunk.encode())
                .await
                .map_err(|e| EngineError::Network(e.to_string()))?;
            return Ok(message_id);
        }

        let mut offset = 0usize;
        while offset < body.len() {
            let end = (offset + CHUNK_SIZE).min(body.len());
            let continuation = if end == body.len() {
                Continuation::Complete
            } else {
                Continuation::More
            };
            let chunk = MsrpChunk::send(
                &self.remote_path,
                &self.local_path,
                &message_id,
                content_type,
                ByteRange {
                    start: offset as u64 + 1,
                    end: Some(end as u64),
                    total: Some(total),
                },
                Bytes::copy_from_slice(&body[offset..end]),
                continuation,
            );
            stream
                .write_all(&chunk.encode())
                .await
                .map_err(|e| EngineError::Network(e.to_string()))?;

            let mut transferred = self.transferred.lock().await;
            *transferred = end as u64;
            offset = end;
        }

        debug!(%message_id, total, "message sent");
        Ok(message_id)
    }

    /// Run the receive loop until the peer closes, invoking `on_event` for
    /// every reassembled message and progress step. Acknowledges each SEND
    /// with a 200 response; silently absorbs the opening probe. Takes the
    /// read half; the loop can run only once per open.
    pub async fn receive_loop<F>(&self, mut on_event: F) -> Result<()>
    where
        F: FnMut(MsrpEvent) + Send,
    {
        let mut stream = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::Network("media transport not open".to_string()))?;

        let mut buffer = BytesMut::with_capacity(8192);
        let mut assembly: Option<(String, String, Vec<u8>, Option<u64>)> = None;

        loop {
            while let Some((chunk, consumed)) = parse_next_chunk(&buffer) {
                let _ = buffer.split_to(consumed);
                match chunk.kind {
                    MsrpKind::Send => {
                        let ack = MsrpChunk::ok_response(&chunk);
                        self.write_raw(&ack.encode()).await?;

                        if chunk.is_empty_probe() {
                            debug!(tx = %chunk.transaction_id, "opening chunk received");
                            continue;
                        }

                        let message_id = chunk
                            .message_id
                            .clone()
                            .unwrap_or_else(|| chunk.transaction_id.clone());
                        let content_type = chunk
                            .content_type
                            .clone()
                            .unwrap_or_else(|| "application/octet-stream".to_string());
                        let total = chunk.byte_range.and_then(|r| r.total);

                        let entry = assembly.get_or_insert_with(|| {
                            (message_id.clone(), content_type.clone(), Vec::new(), total)
                        });
                        entry.2.extend_from_slice(&chunk.body);

                        if let Some(total) = entry.3 {
                            on_event(MsrpEvent::Progress {
                                transferred: entry.2.len() as u64,
                                total,
                            });
                        }

                        match chunk.continuation {
                            Continuation::More => {}
                            Continuation::Aborted => {
                                let (id, _, _, _) = assembly.take().unwrap();
                                warn!(message_id = %id, "remote aborted transfer");
                                on_event(MsrpEvent::TransferAborted { message_id: id });
                            }
                            Continuation::Complete => {
                                let (id, content_type, body, _) = assembly.take().unwrap();
                                on_event(MsrpEvent::MessageReceived {
                                    message_id: id,
                                    content_type,
                                    body: Bytes::from(body),
                                });
                            }
                        }
                    }
                    MsrpKind::Report | MsrpKind::Response(_) => {
                        // Acks and reports carry no payload for us
                    }
                }
            }

            let mut read_buf = [0u8; 4096];
            let n = stream
                .read(&mut read_buf)
                .await
                .map_err(|e| EngineError::Network(e.to_string()))?;
            if n == 0 {
                on_event(MsrpEvent::Closed);
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| EngineError::Network("media transport not open".to_string()))?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| EngineError::Network(e.to_string()))
    }

    /// Drop the transport, if open.
    pub async fn close(&self) {
        self.reader.lock().await.take();
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// Extract host and port from an MSRP URI like
/// `msrp://10.0.0.1:2855/session-id;tcp`.
pub fn parse_msrp_uri(uri: &str) -> Result<(String, u16)> {
    let rest = uri
        .strip_prefix("msrp://")
        .or_else(|| uri.strip_prefix("msrps://"))
        .ok_or_else(|| EngineError::Payload(format!("not an msrp uri: {}", uri)))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| EngineError::Payload(format!("msrp uri missing port: {}", uri)))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| EngineError::Payload(format!("invalid msrp port in: {}", uri)))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};
    use tokio::io::duplex;

    struct PipeConnector {
        side: Mutex<Option<Box<dyn MsrpStream>>>,
        accepts: AtomicU16,
    }

    impl PipeConnector {
        fn pair() -> (Arc<Self>, Box<dyn MsrpStream>) {
            let (a, b) = duplex(64 * 1024);
            (
                Arc::new(Self {
                    side: Mutex::new(Some(Box::new(a))),
                    accepts: AtomicU16::new(0),
                }),
                Box::new(b),
            )
        }
    }

    #[async_trait::async_trait]
    impl MsrpConnector for PipeConnector {
        async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn MsrpStream>> {
            self.side
                .lock()
                .await
                .take()
                .ok_or_else(|| EngineError::Network("already connected".to_string()))
        }

        async fn accept(&self, _local_port: u16) -> Result<Box<dyn MsrpStream>> {
            self.accepts.fetch_add(1, Ordering::SeqCst);
            self.side
                .lock()
                .await
                .take()
                .ok_or_else(|| EngineError::Network("already accepted".to_string()))
        }
    }

    struct NeverConnector;

    #[async_trait::async_trait]
    impl MsrpConnector for NeverConnector {
        async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn MsrpStream>> {
            std::future::pending().await
        }

        async fn accept(&self, _local_port: u16) -> Result<Box<dyn MsrpStream>> {
            std::future::pending().await
        }
    }

    #[test]
    fn test_role_resolution() {
        assert_eq!(
            RemoteSetup::Active.local_role(SetupRole::Passive),
            SetupRole::Passive
        );
        assert_eq!(
            RemoteSetup::Passive.local_role(SetupRole::Passive),
            SetupRole::Active
        );
        assert_eq!(
            RemoteSetup::ActPass.local_role(SetupRole::Passive),
            SetupRole::Passive
        );
        assert_eq!(
            RemoteSetup::ActPass.local_role(SetupRole::Active),
            SetupRole::Active
        );
    }

    #[test]
    fn test_active_side_advertises_discovery_port() {
        assert_eq!(SetupRole::Active.advertised_port(2855), 9);
        assert_eq!(SetupRole::Passive.advertised_port(2855), 2855);
    }

    #[test]
    fn test_parse_msrp_uri() {
        assert_eq!(
            parse_msrp_uri("msrp://10.0.0.1:2855/abc;tcp").unwrap(),
            ("10.0.0.1".to_string(), 2855)
        );
        assert_eq!(
            parse_msrp_uri("msrps://host.example.com:9000/s;tcp").unwrap(),
            ("host.example.com".to_string(), 9000)
        );
        assert!(parse_msrp_uri("sip:host").is_err());
        assert!(parse_msrp_uri("msrp://host/abc;tcp").is_err());
    }

    #[tokio::test]
    async fn test_passive_open_sends_exactly_one_empty_chunk() {
        let (connector, mut peer) = PipeConnector::pair();
        let session = MsrpSession::new(
            SetupRole::Passive,
            "msrp://10.0.0.1:2855/local;tcp",
            "msrp://10.0.0.2:2860/peer;tcp",
        );

        session.open(connector.clone(), 2855).await.unwrap();
        assert_eq!(connector.accepts.load(Ordering::SeqCst), 1);

        let mut buf = vec![0u8; 4096];
        let n = peer.read(&mut buf).await.unwrap();
        let (chunk, consumed) = parse_next_chunk(&buf[..n]).unwrap();
        assert!(chunk.is_empty_probe());
        assert_eq!(consumed, n, "only one chunk on the wire");
    }

    #[tokio::test]
    async fn test_active_open_sends_nothing() {
        let (connector, mut peer) = PipeConnector::pair();
        let session = MsrpSession::new(
            SetupRole::Active,
            "msrp://10.0.0.1:2855/local;tcp",
            "msrp://10.0.0.2:2860/peer;tcp",
        );

        session.open(connector, 0).await.unwrap();
        session
            .send_message("text/plain", b"after connect")
            .await
            .unwrap();

        // First bytes from the active side are the data chunk, no probe
        let mut buf = vec![0u8; 8192];
        let n = peer.read(&mut buf).await.unwrap();
        let (chunk, _) = parse_next_chunk(&buf[..n]).unwrap();
        assert!(!chunk.is_empty_probe());
        assert_eq!(&chunk.body[..], b"after connect");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let session = MsrpSession::new(
            SetupRole::Active,
            "msrp://10.0.0.1:2855/local;tcp",
            "msrp://10.0.0.2:2860/peer;tcp",
        );

        let err = session
            .open(Arc::new(NeverConnector), 0)
            .await
            .expect_err("must time out");
        assert!(matches!(err, EngineError::Network(_)));
    }

    #[tokio::test]
    async fn test_send_and_receive_between_sessions() {
        let (connector_a, stream_b) = PipeConnector::pair();
        let connector_b = Arc::new(PipeConnector {
            side: Mutex::new(Some(stream_b)),
            accepts: AtomicU16::new(0),
        });

        let sender = MsrpSession::new(
            SetupRole::Active,
            "msrp://10.0.0.1:2855/a;tcp",
            "msrp://10.0.0.2:2860/b;tcp",
        );
        let receiver = Arc::new(MsrpSession::new(
            SetupRole::Passive,
            "msrp://10.0.0.2:2860/b;tcp",
            "msrp://10.0.0.1:2855/a;tcp",
        ));

        sender.open(connector_a, 0).await.unwrap();
        receiver.open(connector_b, 2860).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let recv_handle = {
            let receiver = receiver.clone();
            tokio::spawn(async move {
                receiver
                    .receive_loop(move |event| {
                        let _ = tx.send(event);
                    })
                    .await
            })
        };

        let payload = vec![0x42u8; 5000]; // spans multiple chunks
        sender.send_message("application/octet-stream", &payload).await.unwrap();

        let mut received = None;
        while let Some(event) = rx.recv().await {
            if let MsrpEvent::MessageReceived { body, content_type, .. } = event {
                received = Some((body, content_type));
                break;
            }
        }
        let (body, content_type) = received.expect("message must arrive");
        assert_eq!(&body[..], &payload[..]);
        assert_eq!(content_type, "application/octet-stream");
        assert_eq!(sender.transferred().await, 5000);

        sender.close().await;
        recv_handle.abort();
    }
}
