//! End-to-end pager dispatch flow: a small message is queued, challenged
//! once with 407, resent with credentials and delivered.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use natter::application::{route_for, DeliveryRoute, PagerDispatcher, PagerMessage};
use natter::config::EngineConfig;
use natter::infrastructure::protocols::sip::{
    AkaOutcome, AuthProcedure, SendOutcome, SimChallenge, SipRequest, SipResponse,
    SipTransactionSender, TransferStore,
};
use natter::Result;

struct FixedSim;

#[async_trait]
impl SimChallenge for FixedSim {
    async fn challenge(&self, _nonce: &str) -> Result<AkaOutcome> {
        Ok(AkaOutcome::Res(b"res-bytes".to_vec()))
    }
}

/// Transaction layer that challenges the first request and accepts the
/// second, recording everything it sees.
struct ChallengeOnceSender {
    requests: Mutex<Vec<SipRequest>>,
}

impl ChallengeOnceSender {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SipTransactionSender for ChallengeOnceSender {
    async fn send(&self, request: SipRequest) -> SendOutcome {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        let data: &[u8] = if requests.len() == 1 {
            b"SIP/2.0 407 Proxy Authentication Required\r\n\
              Via: SIP/2.0/TCP 10.0.0.1;branch=z9hG4bKa\r\n\
              From: <sip:alice@ims.example.com>;tag=a\r\n\
              To: <sip:bob@ims.example.com>;tag=b\r\n\
              Call-ID: c@x\r\n\
              CSeq: 1 MESSAGE\r\n\
              Proxy-Authenticate: Digest realm=\"ims.example.com\", nonce=\"fresh-nonce-1\", algorithm=AKAv1-MD5\r\n\
              Content-Length: 0\r\n\r\n"
        } else {
            b"SIP/2.0 200 OK\r\n\
              Via: SIP/2.0/TCP 10.0.0.1;branch=z9hG4bKa\r\n\
              From: <sip:alice@ims.example.com>;tag=a\r\n\
              To: <sip:bob@ims.example.com>;tag=b\r\n\
              Call-ID: c@x\r\n\
              CSeq: 2 MESSAGE\r\n\
              Content-Length: 0\r\n\r\n"
        };
        SendOutcome::Response(SipResponse::parse(data).unwrap())
    }
}

#[derive(Default)]
struct OutcomeStore {
    sent: Mutex<Vec<String>>,
    failed: Mutex<Vec<String>>,
}

impl TransferStore for OutcomeStore {
    fn message_sent(&self, _conversation_id: &str, message_id: &str) {
        self.sent.lock().unwrap().push(message_id.to_string());
    }
    fn message_failed(&self, _conversation_id: &str, message_id: &str, _reason: &str) {
        self.failed.lock().unwrap().push(message_id.to_string());
    }
    fn message_received(&self, _conversation_id: &str, _message_id: &str) {}
    fn transfer_progress(&self, _session_id: &str, _transferred: u64, _total: u64) {}
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sip.domain = "ims.example.com".to_string();
    config.user.private_identity = "alice@ims.example.com".to_string();
    config.user.public_identity = "sip:alice@ims.example.com".to_string();
    config.user.realm = "ims.example.com".to_string();
    config
}

#[tokio::test]
async fn small_message_is_challenged_once_and_delivered() {
    let config = test_config();
    let payload = vec![b'x'; 500];

    // 500 encoded bytes stay below the pager threshold
    assert_eq!(
        route_for(payload.len(), config.messaging.pager_threshold_bytes),
        DeliveryRoute::Pager
    );

    let sender = ChallengeOnceSender::new();
    let store = Arc::new(OutcomeStore::default());
    let auth = Arc::new(AuthProcedure::new(
        &config.user.private_identity,
        &config.user.realm,
        Arc::new(FixedSim),
    ));
    let mut dispatcher = PagerDispatcher::start(&config, sender.clone(), auth, store.clone());

    let message = PagerMessage::new(
        "conv-1",
        vec!["sip:bob@ims.example.com".to_string()],
        "text/plain",
        payload,
    );
    let message_id = message.message_id.clone();
    assert_eq!(dispatcher.enqueue(message).unwrap(), DeliveryRoute::Pager);
    dispatcher.close().await;

    // Exactly one resend, exactly one success report
    let requests = sender.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert_eq!(*store.sent.lock().unwrap(), vec![message_id]);
    assert!(store.failed.lock().unwrap().is_empty());

    // The resend carried credentials computed from the fresh nonce
    let retried = requests[1]
        .header_value("Proxy-Authorization")
        .expect("retried request must carry credentials");
    assert!(retried.contains("nonce=\"fresh-nonce-1\""));
    assert!(retried.contains("response=\""));
    assert!(!retried.contains("response=\"\""));

    // Same dialog, strictly increasing CSeq
    assert_eq!(requests[0].call_id(), requests[1].call_id());
    assert!(requests[1].cseq().unwrap() > requests[0].cseq().unwrap());

    // The first request deliberately drew the challenge with an empty
    // response value
    let first = requests[0].header_value("Proxy-Authorization").unwrap();
    assert!(first.contains("response=\"\""));
}

#[tokio::test]
async fn oversized_message_escalates_to_session() {
    let config = test_config();
    let payload = vec![b'y'; 2000];
    assert_eq!(
        route_for(payload.len(), config.messaging.pager_threshold_bytes),
        DeliveryRoute::Session
    );

    let sender = ChallengeOnceSender::new();
    let store = Arc::new(OutcomeStore::default());
    let auth = Arc::new(AuthProcedure::new(
        &config.user.private_identity,
        &config.user.realm,
        Arc::new(FixedSim),
    ));
    let mut dispatcher = PagerDispatcher::start(&config, sender.clone(), auth, store.clone());

    // The dispatcher measures the framed wire bytes and refuses to queue;
    // the caller takes the session route instead
    let route = dispatcher
        .enqueue(PagerMessage::new(
            "conv-1",
            vec!["sip:bob@ims.example.com".to_string()],
            "text/plain",
            payload,
        ))
        .unwrap();
    assert_eq!(route, DeliveryRoute::Session);
    dispatcher.close().await;

    // Nothing went out as a pager MESSAGE and no outcome was recorded
    assert!(sender.requests.lock().unwrap().is_empty());
    assert!(store.sent.lock().unwrap().is_empty());
    assert!(store.failed.lock().unwrap().is_empty());
}
