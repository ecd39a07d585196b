//! AKA digest authentication (RFC 2617, RFC 3310)
//!
//! The engine authenticates against the network with a SIM-backed digest:
//! the network's challenge nonce is handed to the SIM, and the returned RES
//! becomes the password material for the MD5 digest response. A
//! synchronization failure (AUTS) uses empty password material for that one
//! response and embeds the resynchronization token; the engine retries
//! exactly once on the follow-up challenge.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::shared::error::EngineError;

use super::message::SipResponse;

/// Result of handing a network nonce to the SIM.
#[derive(Debug, Clone)]
pub enum AkaOutcome {
    /// Challenge answered; RES is the digest password material
    Res(Vec<u8>),
    /// Sequence-number mismatch; AUTS token for resynchronization
    SyncFailure(Vec<u8>),
}

/// SIM challenge capability, supplied by an external telephony accessor.
#[async_trait]
pub trait SimChallenge: Send + Sync {
    async fn challenge(&self, nonce: &str) -> Result<AkaOutcome, EngineError>;
}

/// Parsed digest challenge/info parameters.
#[derive(Debug, Clone, Default)]
pub struct DigestParams {
    params: HashMap<String, String>,
}

impl DigestParams {
    /// Parse `Digest key="value", key=value, ...`, respecting quoted values.
    pub fn parse(value: &str) -> Self {
        let digest_str = value.strip_prefix("Digest ").unwrap_or(value).trim();

        let mut params = HashMap::new();
        for part in split_respecting_quotes(digest_str) {
            if let Some((key, value)) = part.split_once('=') {
                params.insert(
                    key.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                );
            }
        }
        Self { params }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }
}

/// Split a comma-separated parameter list, keeping quoted commas intact.
fn split_respecting_quotes(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if !current.trim().is_empty() {
                    parts.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Per-profile authentication state.
///
/// A nonce is consumed at most once. A `nextnonce` from a success response
/// becomes the nonce for the next request only, then clears.
#[derive(Debug, Clone)]
struct AuthState {
    realm: String,
    nonce: Option<String>,
    next_nonce: Option<String>,
    opaque: Option<String>,
    qop: Option<String>,
    nonce_count: u32,
    /// The previous challenge ended in AUTS; a second consecutive one is
    /// fatal instead of another resync round.
    sync_failed: bool,
}

/// AKA digest authentication procedure, serialized per user profile.
pub struct AuthProcedure {
    username: String,
    profile_realm: String,
    algorithm: String,
    sim: Arc<dyn SimChallenge>,
    state: Mutex<AuthState>,
}

impl AuthProcedure {
    pub fn new(username: &str, profile_realm: &str, sim: Arc<dyn SimChallenge>) -> Self {
        Self {
            username: username.to_string(),
            profile_realm: profile_realm.to_string(),
            algorithm: "AKAv1-MD5".to_string(),
            sim,
            state: Mutex::new(AuthState {
                realm: profile_realm.to_string(),
                nonce: None,
                next_nonce: None,
                opaque: None,
                qop: None,
                nonce_count: 0,
                sync_failed: false,
            }),
        }
    }

    /// Absorb security parameters from a challenge or success response.
    ///
    /// The profile realm is used only when the challenge did not carry one;
    /// `opaque` is stored for verbatim echo on the retried request.
    pub async fn read_security_header(&self, response: &SipResponse) {
        let mut state = self.state.lock().await;

        if response.is_auth_challenge() {
            let Some(header) = response.authenticate_header() else {
                warn!("challenge response without authenticate header");
                return;
            };
            let params = DigestParams::parse(&header);

            state.realm = params
                .get("realm")
                .map(|r| r.to_string())
                .unwrap_or_else(|| self.profile_realm.clone());
            state.nonce = params.get("nonce").map(|n| n.to_string());
            state.opaque = params.get("opaque").map(|o| o.to_string());
            state.qop = params.get("qop").map(|q| q.to_string());
            state.nonce_count = 0;
            debug!(realm = %state.realm, "absorbed digest challenge");
        } else if response.is_success() {
            if let Some(info) = response.authentication_info() {
                let params = DigestParams::parse(&info);
                if let Some(next) = params.get("nextnonce") {
                    state.next_nonce = Some(next.to_string());
                    debug!("stored nextnonce for the following request");
                }
            }
        }
    }

    /// Compute the `Authorization` header value for the given request line.
    ///
    /// 1. A pending `nextnonce` is promoted to the active nonce and cleared.
    /// 2. With no nonce available, an empty-response header is produced to
    ///    deliberately draw a challenge.
    /// 3. Otherwise the SIM answers the nonce; RES becomes the password
    ///    material, AUTS switches to empty material plus an `auts` parameter.
    pub async fn write_security_header(
        &self,
        method: &str,
        uri: &str,
    ) -> Result<String, EngineError> {
        let mut state = self.state.lock().await;

        if let Some(next) = state.next_nonce.take() {
            state.nonce = Some(next);
            state.nonce_count = 0;
        }

        // Consuming the nonce here enforces single use
        let Some(nonce) = state.nonce.take() else {
            return Ok(self.empty_response_header(&state, uri));
        };

        let (password, auts) = match self.sim.challenge(&nonce).await? {
            AkaOutcome::Res(res) => {
                state.sync_failed = false;
                (res, None)
            }
            AkaOutcome::SyncFailure(token) => {
                if state.sync_failed {
                    return Err(EngineError::Auth(
                        "repeated synchronization failure".to_string(),
                    ));
                }
                state.sync_failed = true;
                warn!("SIM reported sequence resync; answering with empty material");
                (Vec::new(), Some(general_purpose::STANDARD.encode(token)))
            }
        };

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", algorithm={}",
            self.username, state.realm, nonce, uri, self.algorithm
        );

        let response = if let Some(qop) = state.qop.clone() {
            state.nonce_count += 1;
            let nc = format!("{:08x}", state.nonce_count);
            let cnonce = generate_cnonce();
            let response = compute_digest_response(
                &self.username,
                &state.realm,
                &password,
                &nonce,
                method,
                uri,
                Some((&qop, &nc, &cnonce)),
            );
            header.push_str(&format!(
                ", qop={}, nc={}, cnonce=\"{}\"",
                qop, nc, cnonce
            ));
            response
        } else {
            compute_digest_response(
                &self.username,
                &state.realm,
                &password,
                &nonce,
                method,
                uri,
                None,
            )
        };

        header.push_str(&format!(", response=\"{}\"", response));

        if let Some(opaque) = &state.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(auts) = auts {
            header.push_str(&format!(", auts=\"{}\"", auts));
        }

        Ok(header)
    }

    /// First-request header with an empty response field.
    fn empty_response_header(&self, state: &AuthState, uri: &str) -> String {
        format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"\", uri=\"{}\", algorithm={}, response=\"\"",
            self.username, state.realm, uri, self.algorithm
        )
    }

    /// Reset to provisioning defaults (explicit re-provisioning only).
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.realm = self.profile_realm.clone();
        state.nonce = None;
        state.next_nonce = None;
        state.opaque = None;
        state.qop = None;
        state.nonce_count = 0;
        state.sync_failed = false;
    }
}

/// MD5 digest response per RFC 2617.
///
/// Password material may be binary (AKA RES), so HA1 is computed over raw
/// bytes rather than a formatted string.
fn compute_digest_response(
    username: &str,
    realm: &str,
    password: &[u8],
    nonce: &str,
    method: &str,
    uri: &str,
    qop: Option<(&str, &str, &str)>,
) -> String {
    let ha1 = {
        let mut input = Vec::new();
        input.extend_from_slice(username.as_bytes());
        input.push(b':');
        input.extend_from_slice(realm.as_bytes());
        input.push(b':');
        input.extend_from_slice(password);
        format!("{:x}", md5::compute(input))
    };

    let ha2 = {
        let digest = md5::compute(format!("{}:{}", method, uri));
        format!("{:x}", digest)
    };

    let response = match qop {
        Some((qop, nc, cnonce)) => {
            let digest = md5::compute(format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, nonce, nc, cnonce, qop, ha2
            ));
            format!("{:x}", digest)
        }
        None => {
            let digest = md5::compute(format!("{}:{}:{}", ha1, nonce, ha2));
            format!("{:x}", digest)
        }
    };

    response
}

fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: Vec<u8> = (0..8).map(|_| rng.gen()).collect();
    hex::encode(random_bytes)
}
