//! Session engine: workers for originating and terminating sessions
//!
//! One tokio task per session drives the SIP exchange and the MSRP media
//! bring-up. The engine owns no sockets; requests go through the injected
//! transaction sender, media streams through the injected connector. Worker
//! errors are caught at the outermost scope and become a session error
//! notification instead of a lost task.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::domain::content::FileDescriptor;
use crate::domain::registry::SessionRegistry;
use crate::domain::session::{Session, SessionKind, SessionState};
use crate::domain::shared::{
    AbortOrigin, EngineError, Result, SessionEvent, TerminationReason,
};
use crate::infrastructure::framing::{
    build_cpim, is_cpim_content, is_imdn_content, parse_cpim, DispositionRequest, ImdnReport,
    IMDN_CONTENT_TYPE,
};
use crate::infrastructure::protocols::msrp::{MsrpConnector, MsrpEvent, MsrpSession, RemoteSetup};
use crate::infrastructure::protocols::sip::{
    AuthProcedure, CapabilityRequery, DialogPath, MsrpSdpBuilder, RequestBuilder, ResponseBuilder,
    SdpSession, SendOutcome, SipMethod, SipRequest, SipResponse, SipTransactionSender,
    TransferStore,
};

/// Engine facade wiring sessions to their external collaborators.
pub struct SessionEngine {
    config: EngineConfig,
    local_address: String,
    sender: Arc<dyn SipTransactionSender>,
    auth: Arc<AuthProcedure>,
    connector: Arc<dyn MsrpConnector>,
    requery: Arc<dyn CapabilityRequery>,
    store: Arc<dyn TransferStore>,
    registry: SessionRegistry,
}

impl SessionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        local_address: &str,
        sender: Arc<dyn SipTransactionSender>,
        auth: Arc<AuthProcedure>,
        connector: Arc<dyn MsrpConnector>,
        requery: Arc<dyn CapabilityRequery>,
        store: Arc<dyn TransferStore>,
    ) -> Self {
        Self {
            config,
            local_address: local_address.to_string(),
            sender,
            auth,
            connector,
            requery,
            store,
            registry: SessionRegistry::new(),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Create and start an originating session. Returns immediately; the
    /// worker task drives signaling and media in the background. Listeners
    /// passed here are registered before the worker can emit anything.
    pub fn start_originating(
        self: &Arc<Self>,
        kind: SessionKind,
        remote_party: &str,
        listener: Option<Arc<dyn crate::domain::shared::SessionListener>>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::originating(
            kind,
            remote_party,
            &self.config.sip.domain,
        ));
        self.spawn_originating(session, listener)
    }

    /// Create and start an originating file-transfer session. A non-zero
    /// transferred offset on the descriptor resumes via `file-range`.
    pub fn start_file_transfer(
        self: &Arc<Self>,
        remote_party: &str,
        file: FileDescriptor,
        listener: Option<Arc<dyn crate::domain::shared::SessionListener>>,
    ) -> Arc<Session> {
        let session = Arc::new(Session::originating_transfer(
            remote_party,
            &self.config.sip.domain,
            file,
        ));
        self.spawn_originating(session, listener)
    }

    fn spawn_originating(
        self: &Arc<Self>,
        session: Arc<Session>,
        listener: Option<Arc<dyn crate::domain::shared::SessionListener>>,
    ) -> Arc<Session> {
        if let Some(listener) = listener {
            session.register_listener(listener);
        }
        self.registry.insert(session.clone());

        let engine = self.clone();
        let worker_session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_originating(worker_session.clone()).await {
                warn!(session_id = %worker_session.session_id(), error = %e, "session worker failed");
                worker_session.handle_error(&e);
            }
            engine.registry.remove(&worker_session.call_id());
        });
        session
    }

    /// Register a terminating session for an inbound INVITE and answer it.
    /// Invitations asserted from the store-and-forward service are accepted
    /// and started without asking anyone.
    pub fn handle_invite(self: &Arc<Self>, request: &SipRequest) -> Result<SipResponse> {
        let call_id = request
            .call_id()
            .ok_or_else(|| EngineError::Payload("INVITE without Call-ID".to_string()))?;
        let remote_party = request
            .asserted_identity()
            .ok_or_else(|| EngineError::Payload("INVITE without sender identity".to_string()))?;
        let remote_sdp = request.body_text();

        let kind = if remote_party == self.config.sip.deferred_service_uri {
            SessionKind::DeferredRetrieval
        } else {
            SessionKind::Chat
        };

        let mut dialog = DialogPath::terminating(
            &call_id,
            request.from_tag().as_deref(),
            request.cseq().unwrap_or(0),
        );
        dialog.set_remote_sdp(remote_sdp.clone());

        let session = Arc::new(Session::terminating(
            kind,
            &remote_party,
            dialog,
            request.contribution_id().as_deref(),
            request.conversation_id().as_deref(),
        ));
        session.transition(SessionState::Negotiating)?;
        self.registry.insert(session.clone());
        info!(session_id = %session.session_id(), %remote_party, "terminating session created");

        let response = self.answer_invite(&session, request, &remote_sdp)?;

        // Store-and-forward retrieval starts its media leg immediately
        let engine = self.clone();
        let media_session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_terminating_media(media_session.clone()).await {
                warn!(session_id = %media_session.session_id(), error = %e, "terminating media failed");
                media_session.handle_error(&e);
            }
            engine.registry.remove(&media_session.call_id());
        });

        Ok(response)
    }

    /// Route a BYE to its session; unknown dialogs get 481.
    pub fn handle_bye(&self, request: &SipRequest) -> Result<SipResponse> {
        let call_id = request
            .call_id()
            .ok_or_else(|| EngineError::Payload("BYE without Call-ID".to_string()))?;

        match self.registry.remove(&call_id) {
            Some(session) => {
                session.receive_bye();
                ResponseBuilder::ok()
                    .build_for(request)
                    .map_err(|e| EngineError::Payload(e.to_string()))
            }
            None => ResponseBuilder::new(481)
                .build_for(request)
                .map_err(|e| EngineError::Payload(e.to_string())),
        }
    }

    /// Inbound pager-mode MESSAGE: unwrap, notify, and answer a delivery
    /// report when the sender asked for one.
    pub async fn handle_message(&self, request: &SipRequest) -> Result<SipResponse> {
        let content_type = request
            .content_type()
            .unwrap_or_else(|| "text/plain".to_string());
        let transport_id = request.call_id().unwrap_or_default();

        if is_cpim_content(&content_type) {
            let cpim = parse_cpim(request.body(), &transport_id)
                .ok_or_else(|| EngineError::Payload("malformed CPIM envelope".to_string()))?;

            if is_imdn_content(&cpim.content_type) {
                // A disposition report about one of our own messages
                if let Some(report) = ImdnReport::parse(&String::from_utf8_lossy(&cpim.content)) {
                    debug!(message_id = %report.message_id, status = ?report.status, "disposition report received");
                }
            } else {
                self.store.message_received("", &cpim.message_id);
                if cpim.disposition.delivery {
                    self.send_delivery_report(&cpim.from, &cpim.message_id).await;
                }
            }
        } else {
            self.store.message_received("", &transport_id);
        }

        ResponseBuilder::ok()
            .build_for(request)
            .map_err(|e| EngineError::Payload(e.to_string()))
    }

    /// Close every session and forget them.
    pub fn shutdown(&self) {
        self.registry.close_all();
    }

    // ---- originating flow ----

    async fn run_originating(&self, session: Arc<Session>) -> Result<()> {
        session.transition(SessionState::Negotiating)?;

        let local_path = format!(
            "msrp://{}:{}/{};tcp",
            self.local_address,
            self.config.msrp.local_port,
            Uuid::new_v4().simple()
        );
        let mut builder = MsrpSdpBuilder::new(
            &self.local_address,
            self.config.msrp.local_port,
            &local_path,
            "actpass",
        );
        if let Some(file) = session.content() {
            builder = builder
                .accept_types(&file.mime_type)
                .file_transfer(file.clone());
        }
        let offer = builder.build().to_sdp_string();
        session.with_dialog(|d| d.set_local_sdp(offer.clone()));

        let (response, invite_cseq) = self.send_invite(&session, &offer).await?;
        session.check_interrupted()?;

        if !response.is_success() {
            let reason = if response.status_code() >= 400 {
                TerminationReason::Rejected
            } else {
                TerminationReason::Error
            };
            session.terminate(reason, AbortOrigin::Remote);
            return Ok(());
        }

        let remote_sdp = response.body_text();
        session.with_dialog(|d| {
            if let Some(tag) = response.to_tag() {
                d.set_remote_tag(&tag);
            }
            // Record-Route arrives top-down; the originating route set is
            // the reverse
            let mut routes = response.record_routes();
            routes.reverse();
            d.set_route_set(routes);
            d.set_remote_sdp(remote_sdp.clone());
        });

        self.send_ack(&session, invite_cseq).await?;
        session.transition(SessionState::SignalingEstablished)?;
        session.notify(SessionEvent::SignalingEstablished);
        session.check_interrupted()?;

        let msrp = self.open_media(&session, &remote_sdp, &local_path).await?;
        session.transition(SessionState::MediaEstablished)?;
        session.notify(SessionEvent::MediaEstablished);

        match self.run_media_loop(&session, &msrp).await {
            // Media closed without a BYE; treat the exchange as complete
            Ok(()) => session.terminate(TerminationReason::Completed, AbortOrigin::Local),
            Err(e) => {
                warn!(session_id = %session.session_id(), error = %e, "media transfer failed");
                let expected = session.content().map(|f| f.size);
                self.msrp_transfer_error(&session, &msrp, expected).await;
            }
        }
        Ok(())
    }

    /// Send the INVITE, re-running the security procedure on each 407/401 in
    /// a bounded loop. Returns the final response and the CSeq of the INVITE
    /// it answers (for the ACK).
    async fn send_invite(&self, session: &Arc<Session>, offer: &str) -> Result<(SipResponse, u32)> {
        let remote = session.remote_party().to_string();
        let mut attempts = 0u32;

        loop {
            session.check_interrupted()?;
            let authorization = self
                .auth
                .write_security_header("INVITE", &remote)
                .await?;

            let request = session.with_dialog(|dialog| {
                RequestBuilder::new(
                    SipMethod::Invite,
                    &remote,
                    &self.config.user.public_identity,
                    &remote,
                )
                .via_host(&self.config.sip.domain)
                .contact(&self.config.user.public_identity)
                .header("Proxy-Authorization", &authorization)
                .header("Contribution-ID", session.contribution_id())
                .header("Conversation-ID", session.conversation_id())
                .body("application/sdp", offer.as_bytes().to_vec())
                .build(dialog)
            })
            .map_err(|e| EngineError::Payload(e.to_string()))?;
            let invite_cseq = request.cseq().unwrap_or(0);

            match self.sender.send(request).await {
                SendOutcome::Response(response) => {
                    self.auth.read_security_header(&response).await;
                    if response.is_auth_challenge() {
                        attempts += 1;
                        if attempts > self.config.messaging.max_auth_retries {
                            return Err(EngineError::Auth(
                                "challenge retries exhausted".to_string(),
                            ));
                        }
                        session.transition(SessionState::AuthChallenged)?;
                        session.with_dialog(|d| d.reset_for_challenge_retry());
                        session.transition(SessionState::Negotiating)?;
                        continue;
                    }
                    return Ok((response, invite_cseq));
                }
                SendOutcome::Timeout => {
                    session.terminate(TerminationReason::TimedOut, AbortOrigin::System);
                    return Err(EngineError::Network("transaction timeout".to_string()));
                }
                SendOutcome::TransportError(e) => return Err(EngineError::Network(e)),
            }
        }
    }

    async fn send_ack(&self, session: &Arc<Session>, invite_cseq: u32) -> Result<()> {
        let remote = session.remote_party().to_string();
        let ack = session.with_dialog(|dialog| {
            RequestBuilder::new(
                SipMethod::Ack,
                &remote,
                &self.config.user.public_identity,
                &remote,
            )
            .via_host(&self.config.sip.domain)
            .build_with_cseq(dialog, invite_cseq)
        })
        .map_err(|e| EngineError::Payload(e.to_string()))?;

        match self.sender.send(ack).await {
            SendOutcome::TransportError(e) => Err(EngineError::Network(e)),
            _ => Ok(()),
        }
    }

    // ---- terminating flow ----

    /// Build the 200 answer with our SDP, complementing the offered setup.
    fn answer_invite(
        &self,
        session: &Arc<Session>,
        request: &SipRequest,
        remote_sdp: &str,
    ) -> Result<SipResponse> {
        let offer = SdpSession::parse(remote_sdp)
            .ok_or_else(|| EngineError::Payload("unparseable SDP offer".to_string()))?;
        let media = offer
            .msrp_media()
            .ok_or_else(|| EngineError::Payload("offer has no MSRP media".to_string()))?;

        let remote_setup =
            RemoteSetup::parse(media.setup().unwrap_or("actpass")).unwrap_or(RemoteSetup::ActPass);
        let local_role = remote_setup.local_role(self.config.msrp.preferred_setup_role.into());

        let local_path = format!(
            "msrp://{}:{}/{};tcp",
            self.local_address,
            self.config.msrp.local_port,
            Uuid::new_v4().simple()
        );
        let answer = MsrpSdpBuilder::new(
            &self.local_address,
            local_role.advertised_port(self.config.msrp.local_port),
            &local_path,
            local_role.as_sdp_value(),
        )
        .build()
        .to_sdp_string();

        let local_tag = session.with_dialog(|d| {
            d.set_local_sdp(answer.clone());
            d.local_tag().map(|t| t.to_string())
        });

        let mut builder = ResponseBuilder::ok()
            .header("Contribution-ID", session.contribution_id())
            .header("Conversation-ID", session.conversation_id())
            .body("application/sdp", answer.into_bytes());
        if let Some(tag) = local_tag {
            builder = builder.to_tag(&tag);
        }
        builder
            .build_for(request)
            .map_err(|e| EngineError::Payload(e.to_string()))
    }

    async fn run_terminating_media(&self, session: Arc<Session>) -> Result<()> {
        session.transition(SessionState::SignalingEstablished)?;
        session.notify(SessionEvent::SignalingEstablished);

        let (remote_sdp, local_sdp) = session.with_dialog(|d| {
            (
                d.remote_sdp().map(|s| s.to_string()),
                d.local_sdp().map(|s| s.to_string()),
            )
        });
        let remote_sdp =
            remote_sdp.ok_or_else(|| EngineError::Internal("no remote SDP".to_string()))?;
        let local_sdp =
            local_sdp.ok_or_else(|| EngineError::Internal("no local SDP".to_string()))?;

        let local_path = SdpSession::parse(&local_sdp)
            .and_then(|s| s.msrp_media().and_then(|m| m.path().map(|p| p.to_string())))
            .ok_or_else(|| EngineError::Internal("no local MSRP path".to_string()))?;

        let msrp = self.open_media(&session, &remote_sdp, &local_path).await?;
        session.transition(SessionState::MediaEstablished)?;
        session.notify(SessionEvent::MediaEstablished);

        match self.run_media_loop(&session, &msrp).await {
            Ok(()) => session.terminate(TerminationReason::Completed, AbortOrigin::Local),
            Err(e) => {
                warn!(session_id = %session.session_id(), error = %e, "media transfer failed");
                let expected = session.content().map(|f| f.size);
                self.msrp_transfer_error(&session, &msrp, expected).await;
            }
        }
        Ok(())
    }

    // ---- media ----

    /// Resolve the setup role against the peer's SDP and open the transport.
    async fn open_media(
        &self,
        session: &Arc<Session>,
        remote_sdp: &str,
        local_path: &str,
    ) -> Result<Arc<MsrpSession>> {
        let sdp = SdpSession::parse(remote_sdp)
            .ok_or_else(|| EngineError::Payload("unparseable remote SDP".to_string()))?;
        let media = sdp
            .msrp_media()
            .ok_or_else(|| EngineError::Payload("remote SDP has no MSRP media".to_string()))?;
        let remote_path = media
            .path()
            .ok_or_else(|| EngineError::Payload("MSRP media without path".to_string()))?;

        let remote_setup =
            RemoteSetup::parse(media.setup().unwrap_or("actpass")).unwrap_or(RemoteSetup::ActPass);
        let local_role = remote_setup.local_role(self.config.msrp.preferred_setup_role.into());
        debug!(session_id = %session.session_id(), role = ?local_role, "media role resolved");

        let msrp = Arc::new(MsrpSession::new(local_role, local_path, remote_path));
        let result = msrp
            .open_with_timeout(
                self.connector.clone(),
                self.config.msrp.local_port,
                Duration::from_secs(self.config.msrp.open_timeout_secs),
            )
            .await;

        if let Err(e) = result {
            self.msrp_transfer_error(session, &msrp, None).await;
            return Err(e);
        }
        session.check_interrupted()?;
        Ok(msrp)
    }

    /// Pump received chunks into session events until the peer closes, the
    /// session is interrupted, or the transport fails. A transport failure
    /// surfaces as the pump task's error so the caller can run the transfer
    /// failure procedure instead of completing the session.
    async fn run_media_loop(&self, session: &Arc<Session>, msrp: &Arc<MsrpSession>) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let loop_msrp = msrp.clone();
        let pump = tokio::spawn(async move {
            loop_msrp
                .receive_loop(move |event| {
                    let _ = tx.send(event);
                })
                .await
        });

        let mut interrupted = false;
        loop {
            let event = tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = session.wait_interrupted() => {
                    interrupted = true;
                    break;
                }
            };
            match event {
                MsrpEvent::MessageReceived {
                    message_id,
                    content_type,
                    body,
                } => {
                    let (content_type, content, disposition, message_id) =
                        if is_cpim_content(&content_type) {
                            match parse_cpim(&body, &message_id) {
                                Some(cpim) => {
                                    (cpim.content_type, cpim.content, cpim.disposition, cpim.message_id)
                                }
                                None => {
                                    session.notify(SessionEvent::Error(EngineError::Payload(
                                        "malformed CPIM envelope".to_string(),
                                    )));
                                    continue;
                                }
                            }
                        } else {
                            (content_type, body.to_vec(), DispositionRequest::none(), message_id)
                        };

                    self.store
                        .message_received(session.conversation_id(), &message_id);
                    if disposition.delivery {
                        let report = ImdnReport::delivered(&message_id);
                        let cpim = build_cpim(
                            &self.config.user.public_identity,
                            session.remote_party(),
                            &Uuid::new_v4().to_string(),
                            chrono::Utc::now(),
                            DispositionRequest::none(),
                            IMDN_CONTENT_TYPE,
                            report.to_xml().as_bytes(),
                        );
                        if let Err(e) = msrp.send_message("message/cpim", &cpim).await {
                            warn!(error = %e, "failed to send delivery report");
                        }
                    }
                    session.notify(SessionEvent::MessageReceived {
                        message_id,
                        content_type,
                        content,
                        delivery_report_wanted: disposition.delivery,
                        display_report_wanted: disposition.display,
                    });
                }
                MsrpEvent::Progress { transferred, total } => {
                    self.store.transfer_progress(
                        &session.session_id().to_string(),
                        transferred,
                        total,
                    );
                    session.notify(SessionEvent::TransferProgress { transferred, total });
                }
                MsrpEvent::TransferAborted { .. } => {
                    session.notify(SessionEvent::Error(EngineError::Network(
                        "remote aborted transfer".to_string(),
                    )));
                }
                MsrpEvent::Closed => break,
            }
        }

        let result = if interrupted {
            pump.abort();
            Ok(())
        } else {
            // The receive loop has finished; surface its transport error
            match pump.await {
                Ok(result) => result,
                Err(_) => Ok(()),
            }
        };
        msrp.close().await;
        result
    }

    /// Send one message over an established session's media leg.
    pub async fn send_session_message(
        &self,
        session: &Arc<Session>,
        msrp: &Arc<MsrpSession>,
        content_type: &str,
        payload: &[u8],
        disposition: DispositionRequest,
    ) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let cpim = build_cpim(
            &self.config.user.public_identity,
            session.remote_party(),
            &message_id,
            chrono::Utc::now(),
            disposition,
            content_type,
            payload,
        );
        msrp.send_message("message/cpim", &cpim).await?;
        self.store
            .message_sent(session.conversation_id(), &message_id);
        Ok(message_id)
    }

    /// Media transfer failure: tear down the dialog and media leg, fire the
    /// capability re-query hook, and suppress the error notification when the
    /// content had already fully transferred (completion wins the race).
    pub async fn msrp_transfer_error(
        &self,
        session: &Arc<Session>,
        msrp: &Arc<MsrpSession>,
        expected_total: Option<u64>,
    ) {
        let transferred = msrp.transferred().await;
        let completed = matches!(expected_total, Some(total) if total > 0 && transferred >= total);

        if session.state() != SessionState::Idle {
            let _ = session.transition(SessionState::Terminating);
        }
        self.send_bye(session).await;
        msrp.close().await;
        self.requery.requery(session.remote_party()).await;

        if completed {
            info!(session_id = %session.session_id(), "transfer already complete; error suppressed");
            session.terminate(TerminationReason::Completed, AbortOrigin::Local);
        } else {
            session.terminate(TerminationReason::Error, AbortOrigin::System);
        }
        self.registry.remove(&session.call_id());
    }

    async fn send_bye(&self, session: &Arc<Session>) {
        if session.state() == SessionState::Idle {
            return;
        }
        let remote = session.remote_party().to_string();
        let bye = session.with_dialog(|dialog| {
            RequestBuilder::new(
                SipMethod::Bye,
                &remote,
                &self.config.user.public_identity,
                &remote,
            )
            .via_host(&self.config.sip.domain)
            .build(dialog)
        });
        match bye {
            Ok(request) => {
                let _ = self.sender.send(request).await;
            }
            Err(e) => warn!(error = %e, "could not build BYE"),
        }
    }

    async fn send_delivery_report(&self, recipient: &str, message_id: &str) {
        let report = ImdnReport::delivered(message_id);
        let cpim = build_cpim(
            &self.config.user.public_identity,
            recipient,
            &Uuid::new_v4().to_string(),
            chrono::Utc::now(),
            DispositionRequest::none(),
            IMDN_CONTENT_TYPE,
            report.to_xml().as_bytes(),
        );

        let mut dialog = DialogPath::originating(&self.config.sip.domain);
        let request = RequestBuilder::new(
            SipMethod::Message,
            recipient,
            &self.config.user.public_identity,
            recipient,
        )
        .via_host(&self.config.sip.domain)
        .body("message/cpim", cpim)
        .build(&mut dialog);

        match request {
            Ok(request) => {
                if let SendOutcome::TransportError(e) = self.sender.send(request).await {
                    warn!(error = %e, "delivery report send failed");
                }
            }
            Err(e) => warn!(error = %e, "could not build delivery report"),
        }
    }
}
