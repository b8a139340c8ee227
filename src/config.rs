//! Service configuration: cookie/token parameters, trusted-header settings,
//! allow-lists, and the snapshot location.
//!
//! Loaded from a JSON file, overridable through `TRUSTRING_*` environment
//! variables, and validated before the service starts. The server id is
//! normally supplied by the cluster-membership service; when absent a random
//! one is generated, which still works but means tokens minted before a
//! restart verify only through older ring slots.

use crate::ring::DEFAULT_RING_SIZE;
use crate::util::{env_list, env_string, env_truthy, env_u64};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default cookie ttl: 20 minutes.
pub const DEFAULT_TTL_MS: u64 = 20 * 60 * 1000;

/// Placeholder shared secret; must be changed before trusting headers.
pub const DEFAULT_SHARED_SECRET: &str = "default-setting-change-before-use";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Name of the authentication cookie.
    pub cookie_name: String,
    /// Token time-to-live in milliseconds.
    pub ttl_ms: u64,
    /// Number of key ring slots (1..=9; the wire format encodes the slot as
    /// a single digit).
    pub ring_size: usize,
    /// Store identity in the container session instead of a cookie.
    pub use_session: bool,
    /// Only accept and emit cookies marked secure (HTTPS-only).
    pub secure_cookie: bool,
    /// Enable the trusted-header (server token) path.
    pub server_token_enabled: bool,
    /// Static secret shared by all trusted servers for the header path.
    pub shared_secret: String,
    /// Header carrying `hash;subject;timestamp` from trusted servers.
    pub token_header_name: String,
    /// Remote addresses allowed to present the server token header.
    pub safe_host_addrs: Vec<String>,
    /// Header a trusted proxy uses to assert a subject on injection; empty
    /// disables the path.
    pub proxy_header_name: String,
    /// Request parameter a trusted proxy uses to assert a subject; empty
    /// disables the path.
    pub proxy_parameter_name: String,
    /// Remote addresses trusted as front-end proxies for injection.
    pub trusted_proxy_addrs: Vec<String>,
    /// Location of the key ring snapshot file.
    pub snapshot_path: PathBuf,
    /// Stable per-process server id from the cluster-membership service.
    pub server_id: Option<String>,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            cookie_name: "trustring-authn".to_string(),
            ttl_ms: DEFAULT_TTL_MS,
            ring_size: DEFAULT_RING_SIZE,
            use_session: false,
            secure_cookie: false,
            server_token_enabled: true,
            shared_secret: DEFAULT_SHARED_SECRET.to_string(),
            token_header_name: "x-trustring-token".to_string(),
            safe_host_addrs: vec![
                "localhost".to_string(),
                "127.0.0.1".to_string(),
                "::1".to_string(),
            ],
            proxy_header_name: String::new(),
            proxy_parameter_name: String::new(),
            trusted_proxy_addrs: Vec::new(),
            snapshot_path: PathBuf::from("data/cookie-keys.bin"),
            server_id: None,
        }
    }
}

impl TokenConfig {
    /// Load config from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: TokenConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Apply `TRUSTRING_*` environment overrides on top of `self`.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(v) = env_string("TRUSTRING_COOKIE_NAME") {
            self.cookie_name = v;
        }
        if let Some(v) = env_u64("TRUSTRING_TTL_MS") {
            self.ttl_ms = v;
        }
        if let Some(v) = env_u64("TRUSTRING_RING_SIZE") {
            self.ring_size = v as usize;
        }
        self.use_session = env_truthy("TRUSTRING_USE_SESSION", self.use_session);
        self.secure_cookie = env_truthy("TRUSTRING_SECURE_COOKIE", self.secure_cookie);
        self.server_token_enabled =
            env_truthy("TRUSTRING_SERVER_TOKEN_ENABLED", self.server_token_enabled);
        if let Some(v) = env_string("TRUSTRING_SHARED_SECRET") {
            self.shared_secret = v;
        }
        if let Some(v) = env_string("TRUSTRING_TOKEN_HEADER") {
            self.token_header_name = v;
        }
        if let Some(v) = env_list("TRUSTRING_SAFE_HOSTS") {
            self.safe_host_addrs = v;
        }
        if let Some(v) = env_string("TRUSTRING_PROXY_HEADER") {
            self.proxy_header_name = v;
        }
        if let Some(v) = env_string("TRUSTRING_PROXY_PARAMETER") {
            self.proxy_parameter_name = v;
        }
        if let Some(v) = env_list("TRUSTRING_TRUSTED_PROXIES") {
            self.trusted_proxy_addrs = v;
        }
        if let Some(v) = env_string("TRUSTRING_SNAPSHOT_PATH") {
            self.snapshot_path = PathBuf::from(v);
        }
        if let Some(v) = env_string("TRUSTRING_SERVER_ID") {
            self.server_id = Some(v);
        }
        self
    }

    /// Reject configurations the wire format or protocol cannot support.
    pub fn validate(&self) -> Result<()> {
        if self.cookie_name.trim().is_empty() {
            return Err(anyhow!("cookie_name must not be empty"));
        }
        if self.ttl_ms == 0 {
            return Err(anyhow!("ttl_ms must be positive"));
        }
        if !(1..=9).contains(&self.ring_size) {
            // the cookie encodes the slot index as a single digit
            return Err(anyhow!(
                "ring_size must be between 1 and 9, got {}",
                self.ring_size
            ));
        }
        if self.server_token_enabled && self.shared_secret == DEFAULT_SHARED_SECRET {
            warn!("server token path enabled with the default shared secret; change it");
        }
        Ok(())
    }

    /// The configured server id, or a generated fallback.
    pub fn effective_server_id(&self) -> String {
        match &self.server_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                warn!("no server id configured; generated {id}");
                id
            }
        }
    }
}
