//! Configuration management

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::shared::{EngineError, Result};
use crate::infrastructure::protocols::msrp::SetupRole;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub sip: SipConfig,
    pub user: UserProfile,
    pub messaging: MessagingConfig,
    pub msrp: MsrpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    /// Local IMS domain, used for call-id generation and request URIs
    pub domain: String,
    /// Conference-factory / store-and-forward service URI; inbound
    /// invitations asserted from this identity are retrieval sessions
    pub deferred_service_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// IMS private identity used as the digest username
    pub private_identity: String,
    /// Public identity placed in From headers
    pub public_identity: String,
    /// Realm fallback when a challenge carries none
    pub realm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Encoded payloads above this many bytes escalate from pager-mode
    /// MESSAGE to a full session invitation
    pub pager_threshold_bytes: usize,
    /// Upper bound on 407-challenge retries for one pager message
    pub max_auth_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MsrpConfig {
    /// Local port a passive endpoint listens on
    pub local_port: u16,
    /// Seconds to wait for the media transport to open
    pub open_timeout_secs: u64,
    /// Role taken when the remote offers actpass
    pub preferred_setup_role: PreferredSetupRole,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PreferredSetupRole {
    Active,
    Passive,
}

impl From<PreferredSetupRole> for SetupRole {
    fn from(role: PreferredSetupRole) -> Self {
        match role {
            PreferredSetupRole::Active => SetupRole::Active,
            PreferredSetupRole::Passive => SetupRole::Passive,
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            deferred_service_uri: "sip:sf@localhost".to_string(),
        }
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            private_identity: "user@localhost".to_string(),
            public_identity: "sip:user@localhost".to_string(),
            realm: "localhost".to_string(),
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            pager_threshold_bytes: 900,
            max_auth_retries: 3,
        }
    }
}

impl Default for MsrpConfig {
    fn default() -> Self {
        Self {
            local_port: 2855,
            open_timeout_secs: 30,
            preferred_setup_role: PreferredSetupRole::Passive,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file, falling back to defaults for absent sections.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Internal(format!("cannot read config: {}", e)))?;
        toml::from_str(&raw)
            .map_err(|e| EngineError::Internal(format!("cannot parse config: {}", e)))
    }
}
