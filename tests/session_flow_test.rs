//! Full session lifecycle against fake collaborators: originating INVITE,
//! media bring-up over an in-memory stream pair, and the transfer-error
//! suppression when the content had already fully transferred.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use natter::application::SessionEngine;
use natter::config::EngineConfig;
use natter::domain::content::FileDescriptor;
use natter::domain::session::{Session, SessionKind, SessionState};
use natter::domain::shared::{SessionEvent, SessionListener, SessionOutcome};
use natter::infrastructure::framing::{parse_cpim, DispositionRequest};
use natter::infrastructure::protocols::msrp::{
    parse_next_chunk, MsrpConnector, MsrpSession, MsrpStream, SetupRole,
};
use natter::infrastructure::protocols::sip::{
    AkaOutcome, AuthProcedure, CapabilityRequery, NullTransferStore, SendOutcome, SimChallenge,
    SipRequest, SipResponse, SipTransactionSender,
};
use natter::{EngineError, Result};

struct FixedSim;

#[async_trait]
impl SimChallenge for FixedSim {
    async fn challenge(&self, _nonce: &str) -> Result<AkaOutcome> {
        Ok(AkaOutcome::Res(b"res".to_vec()))
    }
}

/// Answers an INVITE with 200 + an SDP declaring the remote setup role, and
/// everything else with a bare 200.
struct AnsweringSender {
    requests: Mutex<Vec<SipRequest>>,
    setup: &'static str,
}

impl AnsweringSender {
    fn new() -> Arc<Self> {
        Self::with_setup("active")
    }

    fn with_setup(setup: &'static str) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            setup,
        })
    }

    fn methods(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| r.method().map(|m| m.to_string()))
            .collect()
    }
}

#[async_trait]
impl SipTransactionSender for AnsweringSender {
    async fn send(&self, request: SipRequest) -> SendOutcome {
        let is_invite = request
            .method()
            .map(|m| m.as_str() == "INVITE")
            .unwrap_or(false);
        let call_id = request.call_id().unwrap_or_default();
        let cseq_line = request.header_value("CSeq").unwrap_or_default();
        self.requests.lock().unwrap().push(request);

        let body = if is_invite {
            format!(
                "v=0\r\n\
                 o=- 1 1 IN IP4 10.0.0.2\r\n\
                 s=-\r\n\
                 c=IN IP4 10.0.0.2\r\n\
                 t=0 0\r\n\
                 m=message 2860 TCP/MSRP *\r\n\
                 a=path:msrp://10.0.0.2:2860/peer-session;tcp\r\n\
                 a=setup:{}\r\n\
                 a=accept-types:message/cpim\r\n\
                 a=sendrecv\r\n",
                self.setup
            )
        } else {
            String::new()
        };
        let data = format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/TCP 10.0.0.1;branch=z9hG4bKa\r\n\
             From: <sip:alice@ims.example.com>;tag=a\r\n\
             To: <sip:bob@ims.example.com>;tag=remote-tag\r\n\
             Call-ID: {}\r\n\
             CSeq: {}\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{}",
            call_id,
            cseq_line,
            body.len(),
            body
        );
        SendOutcome::Response(SipResponse::parse(data.as_bytes()).unwrap())
    }
}

/// Hands out one pre-made duplex stream per accept/connect.
struct PipeConnector {
    side: tokio::sync::Mutex<Option<Box<dyn MsrpStream>>>,
}

impl PipeConnector {
    fn pair() -> (Arc<Self>, Box<dyn MsrpStream>) {
        let (a, b) = duplex(64 * 1024);
        (
            Arc::new(Self {
                side: tokio::sync::Mutex::new(Some(Box::new(a))),
            }),
            Box::new(b),
        )
    }
}

#[async_trait]
impl MsrpConnector for PipeConnector {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn MsrpStream>> {
        self.take().await
    }

    async fn accept(&self, _local_port: u16) -> Result<Box<dyn MsrpStream>> {
        self.take().await
    }
}

impl PipeConnector {
    async fn take(&self) -> Result<Box<dyn MsrpStream>> {
        self.side
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::Network("transport already taken".to_string()))
    }
}

/// Transport whose reads fail immediately, as a connection reset
/// mid-transfer would.
struct ResetStream;

impl AsyncRead for ResetStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        )))
    }
}

impl AsyncWrite for ResetStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct ResetConnector;

#[async_trait]
impl MsrpConnector for ResetConnector {
    async fn connect(&self, _host: &str, _port: u16) -> Result<Box<dyn MsrpStream>> {
        Ok(Box::new(ResetStream))
    }

    async fn accept(&self, _local_port: u16) -> Result<Box<dyn MsrpStream>> {
        Ok(Box::new(ResetStream))
    }
}

#[derive(Default)]
struct RequeryRecorder {
    parties: Mutex<Vec<String>>,
}

#[async_trait]
impl CapabilityRequery for RequeryRecorder {
    async fn requery(&self, remote_party: &str) {
        self.parties.lock().unwrap().push(remote_party.to_string());
    }
}

struct ChannelListener {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionListener for ChannelListener {
    fn on_event(&self, event: &SessionEvent) {
        let _ = self.tx.send(event.clone());
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sip.domain = "ims.example.com".to_string();
    config.user.private_identity = "alice@ims.example.com".to_string();
    config.user.public_identity = "sip:alice@ims.example.com".to_string();
    config.user.realm = "ims.example.com".to_string();
    config
}

fn engine(
    sender: Arc<dyn SipTransactionSender>,
    connector: Arc<dyn MsrpConnector>,
    requery: Arc<RequeryRecorder>,
) -> Arc<SessionEngine> {
    let config = test_config();
    let auth = Arc::new(AuthProcedure::new(
        &config.user.private_identity,
        &config.user.realm,
        Arc::new(FixedSim),
    ));
    Arc::new(SessionEngine::new(
        config,
        "10.0.0.1",
        sender,
        auth,
        connector,
        requery,
        Arc::new(NullTransferStore),
    ))
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("event must arrive")
        .expect("channel open")
}

#[tokio::test]
async fn originating_session_establishes_signaling_and_media() {
    let sender = AnsweringSender::new();
    let (connector, mut peer) = PipeConnector::pair();
    let requery = Arc::new(RequeryRecorder::default());
    let engine = engine(sender.clone(), connector, requery);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = engine.start_originating(
        SessionKind::Chat,
        "sip:bob@ims.example.com",
        Some(Arc::new(ChannelListener { tx })),
    );

    // Remote answered active, so our passive side must open with exactly
    // one bodiless chunk
    let mut buf = vec![0u8; 4096];
    let n = peer.read(&mut buf).await.unwrap();
    let (probe, consumed) = parse_next_chunk(&buf[..n]).unwrap();
    assert!(probe.is_empty_probe());
    assert_eq!(consumed, n);

    // Both milestones reached, in order
    loop {
        if matches!(next_event(&mut rx).await, SessionEvent::SignalingEstablished) {
            break;
        }
    }
    loop {
        if matches!(next_event(&mut rx).await, SessionEvent::MediaEstablished) {
            break;
        }
    }
    assert_eq!(session.state(), SessionState::MediaEstablished);

    // INVITE then ACK, with the ACK reusing the INVITE's CSeq
    let methods = sender.methods();
    assert_eq!(methods, vec!["INVITE", "ACK"]);
    let requests = sender.requests.lock().unwrap();
    assert_eq!(requests[0].cseq(), requests[1].cseq());
    drop(requests);

    // Peer closes the media stream; the session winds down as completed
    drop(peer);
    loop {
        if let SessionEvent::Terminated(outcome) = next_event(&mut rx).await {
            assert_eq!(outcome, SessionOutcome::Completed);
            break;
        }
    }
}

#[tokio::test]
async fn transport_reset_mid_transfer_reports_error_and_requeries() {
    // Remote is passive, so our side connects out and gets the failing stream
    let sender = AnsweringSender::with_setup("passive");
    let requery = Arc::new(RequeryRecorder::default());
    let engine = engine(sender.clone(), Arc::new(ResetConnector), requery.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.start_originating(
        SessionKind::Chat,
        "sip:bob@ims.example.com",
        Some(Arc::new(ChannelListener { tx })),
    );

    // The read failure must surface as an error outcome, not completion
    loop {
        if let SessionEvent::Terminated(outcome) = next_event(&mut rx).await {
            assert!(matches!(outcome, SessionOutcome::Error(_)));
            break;
        }
    }

    // Failure tears the dialog down and re-queries the peer's capabilities
    assert_eq!(
        *requery.parties.lock().unwrap(),
        vec!["sip:bob@ims.example.com".to_string()]
    );
    assert!(sender.methods().contains(&"BYE".to_string()));
}

#[tokio::test]
async fn local_close_tears_down_media_transport() {
    let sender = AnsweringSender::new();
    let (connector, mut peer) = PipeConnector::pair();
    let requery = Arc::new(RequeryRecorder::default());
    let engine = engine(sender, connector, requery);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = engine.start_originating(
        SessionKind::Chat,
        "sip:bob@ims.example.com",
        Some(Arc::new(ChannelListener { tx })),
    );

    // Drain the opening probe and wait for media
    let mut buf = vec![0u8; 4096];
    let _ = peer.read(&mut buf).await.unwrap();
    loop {
        if matches!(next_event(&mut rx).await, SessionEvent::MediaEstablished) {
            break;
        }
    }

    session.close();
    loop {
        if let SessionEvent::Terminated(outcome) = next_event(&mut rx).await {
            assert_eq!(outcome, SessionOutcome::AbortedBySystem);
            break;
        }
    }

    // The media worker must release the transport without the peer hanging
    // up first; EOF on the peer side proves the stream was closed
    let n = tokio::time::timeout(std::time::Duration::from_secs(5), peer.read(&mut buf))
        .await
        .expect("transport must close")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn file_transfer_offer_carries_selector_and_resume_range() {
    let sender = AnsweringSender::new();
    let (connector, mut peer) = PipeConnector::pair();
    let requery = Arc::new(RequeryRecorder::default());
    let engine = engine(sender.clone(), connector, requery);

    let mut file = FileDescriptor::new("photo.jpg", "image/jpeg", 1000);
    file.transferred = 400;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let session = engine.start_file_transfer(
        "sip:bob@ims.example.com",
        file,
        Some(Arc::new(ChannelListener { tx })),
    );
    assert_eq!(session.kind(), SessionKind::FileTransfer);

    // Drain the probe so the passive open completes
    let mut buf = vec![0u8; 4096];
    let _ = peer.read(&mut buf).await.unwrap();

    loop {
        if matches!(next_event(&mut rx).await, SessionEvent::SignalingEstablished) {
            break;
        }
    }

    let requests = sender.requests.lock().unwrap();
    let offer = String::from_utf8_lossy(requests[0].body()).to_string();
    assert!(offer.contains("a=file-selector:name:\"photo.jpg\" type:image/jpeg size:1000"));
    // Resume from the transferred offset, 1-based
    assert!(offer.contains("a=file-range:401-1000"));
    assert!(offer.contains("a=accept-types:image/jpeg"));
}

#[tokio::test]
async fn transfer_error_after_completion_is_suppressed() {
    let sender = AnsweringSender::new();
    let (connector, mut peer) = PipeConnector::pair();
    let requery = Arc::new(RequeryRecorder::default());
    let engine = engine(sender, connector.clone(), requery.clone());

    let session = Arc::new(Session::originating(
        SessionKind::FileTransfer,
        "sip:bob@ims.example.com",
        "ims.example.com",
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.register_listener(Arc::new(ChannelListener { tx }));

    let msrp = Arc::new(MsrpSession::new(
        SetupRole::Active,
        "msrp://10.0.0.1:2855/local;tcp",
        "msrp://10.0.0.2:2860/peer;tcp",
    ));
    msrp.open(connector, 0).await.unwrap();

    // Drain the peer side so writes never block
    tokio::spawn(async move {
        let mut sink = vec![0u8; 8192];
        while matches!(peer.read(&mut sink).await, Ok(n) if n > 0) {}
    });

    // Whole payload transferred before the error hits
    let payload = vec![0u8; 4096];
    msrp.send_message("application/octet-stream", &payload)
        .await
        .unwrap();
    assert_eq!(msrp.transferred().await, 4096);

    engine.msrp_transfer_error(&session, &msrp, Some(4096)).await;

    // Completion stands; no error outcome is emitted
    let event = next_event(&mut rx).await;
    match event {
        SessionEvent::Terminated(outcome) => assert_eq!(outcome, SessionOutcome::Completed),
        other => panic!("unexpected event: {:?}", other),
    }
    assert!(rx.try_recv().is_err());

    // The capability re-query hook still fired
    assert_eq!(
        *requery.parties.lock().unwrap(),
        vec!["sip:bob@ims.example.com".to_string()]
    );
}

#[tokio::test]
async fn session_message_is_cpim_wrapped() {
    let sender = AnsweringSender::new();
    let (connector, mut peer) = PipeConnector::pair();
    let requery = Arc::new(RequeryRecorder::default());
    let engine = engine(sender, connector.clone(), requery);

    let session = Arc::new(Session::originating(
        SessionKind::Chat,
        "sip:bob@ims.example.com",
        "ims.example.com",
    ));
    let msrp = Arc::new(MsrpSession::new(
        SetupRole::Active,
        "msrp://10.0.0.1:2855/local;tcp",
        "msrp://10.0.0.2:2860/peer;tcp",
    ));
    msrp.open(connector, 0).await.unwrap();

    let message_id = engine
        .send_session_message(
            &session,
            &msrp,
            "text/plain",
            b"hi bob",
            DispositionRequest {
                delivery: true,
                display: false,
            },
        )
        .await
        .unwrap();

    let mut buf = vec![0u8; 8192];
    let n = peer.read(&mut buf).await.unwrap();
    let (chunk, _) = parse_next_chunk(&buf[..n]).unwrap();
    assert_eq!(chunk.content_type.as_deref(), Some("message/cpim"));

    let cpim = parse_cpim(&chunk.body, "transport-id").unwrap();
    assert_eq!(cpim.message_id, message_id);
    assert_eq!(cpim.from, "sip:alice@ims.example.com");
    assert_eq!(cpim.to, "sip:bob@ims.example.com");
    assert_eq!(cpim.content, b"hi bob");
    assert!(cpim.disposition.delivery);
    assert!(!cpim.disposition.display);
}

#[tokio::test]
async fn transfer_error_before_completion_reports_error() {
    let sender = AnsweringSender::new();
    let (connector, mut peer) = PipeConnector::pair();
    let requery = Arc::new(RequeryRecorder::default());
    let engine = engine(sender, connector.clone(), requery.clone());

    let session = Arc::new(Session::originating(
        SessionKind::FileTransfer,
        "sip:bob@ims.example.com",
        "ims.example.com",
    ));
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.register_listener(Arc::new(ChannelListener { tx }));

    let msrp = Arc::new(MsrpSession::new(
        SetupRole::Active,
        "msrp://10.0.0.1:2855/local;tcp",
        "msrp://10.0.0.2:2860/peer;tcp",
    ));
    msrp.open(connector, 0).await.unwrap();

    tokio::spawn(async move {
        let mut sink = vec![0u8; 8192];
        while matches!(peer.read(&mut sink).await, Ok(n) if n > 0) {}
    });

    // Only part of the payload made it
    msrp.send_message("application/octet-stream", &vec![0u8; 1000])
        .await
        .unwrap();

    engine.msrp_transfer_error(&session, &msrp, Some(4096)).await;

    match next_event(&mut rx).await {
        SessionEvent::Terminated(outcome) => {
            assert!(matches!(outcome, SessionOutcome::Error(_)))
        }
        other => panic!("unexpected event: {:?}", other),
    }
    assert_eq!(requery.parties.lock().unwrap().len(), 1);
}
