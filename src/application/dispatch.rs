//! Pager-mode message dispatch
//!
//! Small messages travel as SIP MESSAGE requests instead of a full session
//! invitation. They flow through a single-consumer FIFO: callers enqueue,
//! one background worker dequeues and delivers, and every dequeued message
//! produces exactly one outcome. Closing the channel is the cancellation
//! signal; there is no sentinel value.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::shared::{EngineError, Result};
use crate::infrastructure::framing::{
    build_cpim, build_multipart, multipart_content_type, DispositionRequest,
};
use crate::infrastructure::protocols::sip::{
    AuthProcedure, DialogPath, RequestBuilder, SendOutcome, SipMethod, SipTransactionSender,
    TransferStore,
};

/// Which transport a payload should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// Small enough for a pager-mode MESSAGE
    Pager,
    /// Needs a full session invitation
    Session,
}

/// Decide pager vs session from the encoded size. The threshold compares
/// wire bytes, not characters.
pub fn route_for(encoded_len: usize, threshold: usize) -> DeliveryRoute {
    if encoded_len > threshold {
        DeliveryRoute::Session
    } else {
        DeliveryRoute::Pager
    }
}

/// One queued standalone message.
#[derive(Debug, Clone)]
pub struct PagerMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub recipients: Vec<String>,
    pub content_type: String,
    pub payload: Vec<u8>,
    pub disposition: DispositionRequest,
    pub enqueued_at: DateTime<Utc>,
}

impl PagerMessage {
    pub fn new(
        conversation_id: &str,
        recipients: Vec<String>,
        content_type: &str,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            recipients,
            content_type: content_type.to_string(),
            payload,
            disposition: DispositionRequest::none(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn with_disposition(mut self, disposition: DispositionRequest) -> Self {
        self.disposition = disposition;
        self
    }
}

/// What one delivery attempt told the retry loop to do next.
enum RetryDecision {
    Delivered,
    /// 407 absorbed; resend with a fresh Authorization header
    RetryChallenge,
    Failed(EngineError),
}

/// Handle for enqueueing pager messages. Dropping every handle (or calling
/// [`PagerDispatcher::close`]) stops the worker after the queue drains.
pub struct PagerDispatcher {
    queue: Option<mpsc::UnboundedSender<PagerMessage>>,
    worker: Option<JoinHandle<()>>,
    public_identity: String,
    service_uri: String,
    threshold: usize,
}

impl PagerDispatcher {
    pub fn start(
        config: &EngineConfig,
        sender: Arc<dyn SipTransactionSender>,
        auth: Arc<AuthProcedure>,
        store: Arc<dyn TransferStore>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = DispatchWorker {
            rx,
            sender,
            auth,
            store,
            local_domain: config.sip.domain.clone(),
            public_identity: config.user.public_identity.clone(),
            service_uri: config.sip.deferred_service_uri.clone(),
            max_auth_retries: config.messaging.max_auth_retries,
        };
        let handle = tokio::spawn(worker.run());
        Self {
            queue: Some(tx),
            worker: Some(handle),
            public_identity: config.user.public_identity.clone(),
            service_uri: config.sip.deferred_service_uri.clone(),
            threshold: config.messaging.pager_threshold_bytes,
        }
    }

    /// Enqueue one message for background delivery. The message is framed
    /// here so the routing decision sees wire bytes: payloads whose encoded
    /// form exceeds the pager threshold are never queued, and the caller
    /// escalates them to a session invitation.
    pub fn enqueue(&self, message: PagerMessage) -> Result<DeliveryRoute> {
        let (_, _, body) = frame_pager(&self.public_identity, &self.service_uri, &message)?;
        if route_for(body.len(), self.threshold) == DeliveryRoute::Session {
            debug!(
                message_id = %message.message_id,
                encoded = body.len(),
                threshold = self.threshold,
                "payload exceeds pager threshold"
            );
            return Ok(DeliveryRoute::Session);
        }

        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| EngineError::Internal("dispatcher closed".to_string()))?;
        queue
            .send(message)
            .map_err(|_| EngineError::Internal("dispatch worker gone".to_string()))?;
        Ok(DeliveryRoute::Pager)
    }

    /// Close the queue and wait for the worker to drain it.
    pub async fn close(&mut self) {
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

struct DispatchWorker {
    rx: mpsc::UnboundedReceiver<PagerMessage>,
    sender: Arc<dyn SipTransactionSender>,
    auth: Arc<AuthProcedure>,
    store: Arc<dyn TransferStore>,
    local_domain: String,
    public_identity: String,
    service_uri: String,
    max_auth_retries: u32,
}

impl DispatchWorker {
    async fn run(mut self) {
        info!("pager dispatch worker started");
        while let Some(message) = self.rx.recv().await {
            let message_id = message.message_id.clone();
            let conversation_id = message.conversation_id.clone();
            match self.deliver(message).await {
                Ok(()) => {
                    debug!(%message_id, "pager message delivered");
                    self.store.message_sent(&conversation_id, &message_id);
                }
                Err(e) => {
                    warn!(%message_id, error = %e, "pager message failed");
                    self.store
                        .message_failed(&conversation_id, &message_id, &e.to_string());
                }
            }
        }
        info!("pager dispatch worker stopped");
    }

    /// Deliver one dequeued message, retrying only on authentication
    /// challenges and only up to the configured bound.
    async fn deliver(&self, message: PagerMessage) -> Result<()> {
        let (request_uri, content_type, body) =
            frame_pager(&self.public_identity, &self.service_uri, &message)?;

        // One dialog per pager message; CSeq advances across challenge
        // retries inside it.
        let mut dialog = DialogPath::originating(&self.local_domain);

        let mut attempts = 0u32;
        loop {
            let decision = self
                .attempt(&mut dialog, &request_uri, &content_type, &body)
                .await;
            match decision {
                RetryDecision::Delivered => return Ok(()),
                RetryDecision::Failed(e) => return Err(e),
                RetryDecision::RetryChallenge => {
                    attempts += 1;
                    if attempts > self.max_auth_retries {
                        return Err(EngineError::Auth(
                            "challenge retries exhausted".to_string(),
                        ));
                    }
                    dialog.reset_for_challenge_retry();
                }
            }
        }
    }

    async fn attempt(
        &self,
        dialog: &mut DialogPath,
        request_uri: &str,
        content_type: &str,
        body: &[u8],
    ) -> RetryDecision {
        let authorization = match self
            .auth
            .write_security_header("MESSAGE", request_uri)
            .await
        {
            Ok(header) => header,
            Err(e) => return RetryDecision::Failed(e),
        };

        let request = RequestBuilder::new(
            SipMethod::Message,
            request_uri,
            &self.public_identity,
            request_uri,
        )
        .via_host(&self.local_domain)
        .header("Proxy-Authorization", &authorization)
        .header("Accept-Contact", "*;+g.oma.sip-im")
        .body(content_type, body.to_vec())
        .build(dialog);

        let request = match request {
            Ok(req) => req,
            Err(e) => return RetryDecision::Failed(EngineError::Payload(e.to_string())),
        };

        match self.sender.send(request).await {
            SendOutcome::Response(response) => {
                self.auth.read_security_header(&response).await;
                if response.is_success() {
                    RetryDecision::Delivered
                } else if response.is_auth_challenge() {
                    RetryDecision::RetryChallenge
                } else {
                    RetryDecision::Failed(EngineError::Network(format!(
                        "MESSAGE rejected with {}",
                        response.status_code()
                    )))
                }
            }
            SendOutcome::Timeout => {
                RetryDecision::Failed(EngineError::Network("transaction timeout".to_string()))
            }
            SendOutcome::TransportError(e) => RetryDecision::Failed(EngineError::Network(e)),
        }
    }

}

/// Wrap the payload: CPIM for a single recipient, multipart with a
/// resource-list part for several. Returns request URI, content type and
/// the framed body.
fn frame_pager(
    public_identity: &str,
    service_uri: &str,
    message: &PagerMessage,
) -> Result<(String, String, Vec<u8>)> {
    let Some(first) = message.recipients.first() else {
        return Err(EngineError::Payload("message has no recipients".to_string()));
    };

    let cpim = build_cpim(
        public_identity,
        first,
        &message.message_id,
        message.enqueued_at,
        message.disposition,
        &message.content_type,
        &message.payload,
    );

    if message.recipients.len() == 1 {
        Ok((first.clone(), "message/cpim".to_string(), cpim))
    } else {
        let body = build_multipart(&message.recipients, "message/cpim", &cpim);
        Ok((service_uri.to_string(), multipart_content_type(), body))
    }
}
