use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, Level};

use natter::application::{PagerDispatcher, PagerMessage};
use natter::config::EngineConfig;
use natter::infrastructure::protocols::sip::{
    AkaOutcome, AuthProcedure, NullTransferStore, SendOutcome, SimChallenge, SipRequest,
    SipResponse, SipTransactionSender,
};
use natter::Result;

/// Loopback transaction layer for the bring-up demo: answers every request
/// with 200 OK.
struct LoopbackSender;

#[async_trait]
impl SipTransactionSender for LoopbackSender {
    async fn send(&self, request: SipRequest) -> SendOutcome {
        let call_id = request.call_id().unwrap_or_default();
        let cseq = request.cseq().unwrap_or(1);
        let data = format!(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/TCP demo;branch=z9hG4bKdemo\r\n\
             From: <sip:demo@localhost>;tag=demo\r\n\
             To: <sip:demo@localhost>;tag=loop\r\n\
             Call-ID: {}\r\n\
             CSeq: {} MESSAGE\r\n\
             Content-Length: 0\r\n\r\n",
            call_id, cseq
        );
        match SipResponse::parse(data.as_bytes()) {
            Ok(response) => SendOutcome::Response(response),
            Err(e) => SendOutcome::TransportError(e.to_string()),
        }
    }
}

/// Demo SIM that answers every challenge with fixed material.
struct DemoSim;

#[async_trait]
impl SimChallenge for DemoSim {
    async fn challenge(&self, _nonce: &str) -> Result<AkaOutcome> {
        Ok(AkaOutcome::Res(b"demo-res".to_vec()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("Starting Natter messaging engine");

    let config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load(std::path::Path::new(&path))?,
        None => EngineConfig::default(),
    };
    info!(domain = %config.sip.domain, "Configuration loaded");

    demo_pager_dispatch(&config).await;

    info!("Natter engine demo complete");
    Ok(())
}

/// Send one pager-mode message through the dispatch queue against the
/// loopback transaction layer.
async fn demo_pager_dispatch(config: &EngineConfig) {
    let auth = Arc::new(AuthProcedure::new(
        &config.user.private_identity,
        &config.user.realm,
        Arc::new(DemoSim),
    ));
    let mut dispatcher = PagerDispatcher::start(
        config,
        Arc::new(LoopbackSender),
        auth,
        Arc::new(NullTransferStore),
    );

    let message = PagerMessage::new(
        "demo-conversation",
        vec![config.user.public_identity.clone()],
        "text/plain",
        b"hello from natter".to_vec(),
    );
    info!(message_id = %message.message_id, "enqueueing demo message");
    match dispatcher.enqueue(message) {
        Ok(route) => info!(?route, "demo message routed"),
        Err(e) => tracing::warn!(error = %e, "enqueue failed"),
    }
    dispatcher.close().await;
}
